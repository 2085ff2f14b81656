//! The per-message pipeline: preventive gate, authorization gate, event
//! processing.

use std::sync::Arc;

use content_scanner::Scanner;
use net_guard::Blocklist;
use tracing::{info, warn};

use crate::codec::Decoder;
use crate::collaborator::{AuditEvent, AuditKind, Collaborators, EnforcementAction};
use crate::events::{EventOutcome, EventProcessor};
use crate::gate::{self, AuthorizationGate, GateVerdict};
use crate::message::{Direction, Message};
use crate::session::{SessionEntry, SessionId, SessionStore};
use crate::settings::ProxySettings;
use crate::termination::{TerminationController, TerminationReason};

/// What the relay should do with one decoded message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Forward,
    /// Drop this message only; the rest of the read is unaffected.
    Suppress,
    Terminate(TerminationReason),
}

pub struct Interceptor {
    settings: Arc<ProxySettings>,
    store: Arc<SessionStore>,
    collaborators: Collaborators,
    gate: AuthorizationGate,
    events: EventProcessor,
    termination: TerminationController,
    decoder: Decoder,
}

impl Interceptor {
    pub fn new(
        settings: Arc<ProxySettings>,
        collaborators: Collaborators,
        scanner: Arc<Scanner>,
        blocklist: Arc<Blocklist>,
    ) -> Self {
        let store = Arc::new(SessionStore::new());
        let gate = AuthorizationGate::new(
            Arc::clone(&collaborators.authorization),
            settings.requested_permissions.clone(),
            settings.auth_failure_mode,
        );
        let events = EventProcessor::new(
            scanner,
            Arc::clone(&collaborators.threat_intel),
            Arc::clone(&collaborators.provenance),
            Arc::clone(&collaborators.audit),
            settings.thresholds.clone(),
        );
        let termination = TerminationController::new(
            Arc::clone(&store),
            Arc::clone(&collaborators.audit),
            Arc::clone(&collaborators.broadcaster),
            blocklist,
            settings.auto_block,
        );
        let decoder = Decoder::new(settings.max_message_len);

        Self {
            settings,
            store,
            collaborators,
            gate,
            events,
            termination,
            decoder,
        }
    }

    pub fn settings(&self) -> &ProxySettings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }

    pub fn decoder(&self) -> &Decoder {
        &self.decoder
    }

    pub fn events(&self) -> &EventProcessor {
        &self.events
    }

    /// Run one message through both gates and, if it survives, the event
    /// processor.
    pub async fn inspect(
        &self,
        entry: &SessionEntry,
        message: &Message,
        direction: Direction,
    ) -> Verdict {
        let kind = message.kind();

        if gate::should_block(kind, &self.settings.prevention) {
            info!(session_id = %entry.id, message_kind = %kind, %direction, "message blocked by prevention config");
            self.audit(AuditEvent::for_session(
                AuditKind::PreventiveAction,
                entry.id,
                entry.client_addr,
                serde_json::json!({
                    "message_kind": kind,
                    "direction": direction,
                    "action": "blocked",
                }),
            ))
            .await;
            return Verdict::Suppress;
        }

        if let GateVerdict::Denied { code, enforcement } =
            self.gate.authorize(entry, message, direction).await
        {
            warn!(session_id = %entry.id, message_kind = %kind, %direction, %code, "access denied");
            self.audit(AuditEvent::for_session(
                AuditKind::AccessDenied,
                entry.id,
                entry.client_addr,
                serde_json::json!({
                    "message_kind": kind,
                    "direction": direction,
                    "code": code,
                }),
            ))
            .await;

            if let Some(action) = enforcement {
                self.audit(AuditEvent::for_session(
                    AuditKind::EnforcementAction,
                    entry.id,
                    entry.client_addr,
                    serde_json::json!({
                        "action": action,
                        "code": code,
                    }),
                ))
                .await;
                if action == EnforcementAction::Terminate {
                    return Verdict::Terminate(TerminationReason::Violation(code));
                }
            }
            return Verdict::Suppress;
        }

        match self.events.process(entry, message, direction).await {
            EventOutcome::Continue => Verdict::Forward,
            EventOutcome::Terminate(reason) => Verdict::Terminate(reason),
        }
    }

    pub async fn terminate(&self, id: SessionId, reason: TerminationReason) -> bool {
        self.termination.terminate(id, reason).await
    }

    pub async fn terminate_all(&self, reason: TerminationReason) -> usize {
        self.termination.terminate_all(reason).await
    }

    /// Best-effort audit record.
    pub async fn audit(&self, event: AuditEvent) {
        if let Err(err) = self.collaborators.audit.record(event).await {
            warn!(%err, "audit record failed");
        }
    }
}
