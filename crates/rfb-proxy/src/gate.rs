//! Per-message gates: the static preventive gate and the authorization gate.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::collaborator::{
    AccessCheck, AuthorizationService, CollaboratorError, EnforcementAction, Violation,
};
use crate::message::{Direction, Message, MessageKind};
use crate::session::{Permission, SessionEntry};
use crate::settings::{FailureMode, PreventionConfig};

/// Violation code used when the authorization service cannot be reached and
/// the failure mode is closed.
pub const AUTHORIZATION_UNAVAILABLE: &str = "authorization_unavailable";

/// Static check against the configured blocking switches.
pub fn should_block(kind: MessageKind, config: &PreventionConfig) -> bool {
    config.blocks(kind)
}

/// Outcome of authorizing one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateVerdict {
    Allowed,
    Denied {
        code: String,
        /// `None` when the denial came from the failure mode and no
        /// enforcement was requested.
        enforcement: Option<EnforcementAction>,
    },
}

pub struct AuthorizationGate {
    service: Arc<dyn AuthorizationService>,
    requested: Vec<Permission>,
    failure_mode: FailureMode,
}

impl AuthorizationGate {
    pub fn new(
        service: Arc<dyn AuthorizationService>,
        requested: Vec<Permission>,
        failure_mode: FailureMode,
    ) -> Self {
        Self {
            service,
            requested,
            failure_mode,
        }
    }

    /// Authorize `message` for the session.
    ///
    /// The first call for a session obtains the access token; concurrent
    /// first calls from both directions share one issuance.
    pub async fn authorize(
        &self,
        entry: &SessionEntry,
        message: &Message,
        direction: Direction,
    ) -> GateVerdict {
        let token = entry
            .token()
            .get_or_try_init(|| {
                debug!(session_id = %entry.id, "issuing access token");
                self.service
                    .issue_token(entry.id, entry.client_addr, &self.requested)
            })
            .await;
        let token = match token {
            Ok(token) => token,
            Err(err) => return self.on_failure(entry, "issue_token", &err),
        };

        let kind = message.kind();
        let check = AccessCheck {
            kind,
            direction,
            file_name: message.file_name(),
        };
        let decision = match self
            .service
            .check_access(&entry.snapshot(), check, token)
            .await
        {
            Ok(decision) => decision,
            Err(err) => return self.on_failure(entry, "check_access", &err),
        };

        if decision.allowed {
            return GateVerdict::Allowed;
        }

        let code = decision
            .code
            .unwrap_or_else(|| "access_denied".to_string());
        let violation = Violation {
            session_id: entry.id,
            client_addr: entry.client_addr,
            message_kind: kind,
            code: code.clone(),
        };
        let enforcement = match self.service.enforce_violation(&violation).await {
            Ok(action) => action,
            Err(err) => {
                warn!(session_id = %entry.id, %err, "enforce_violation failed, blocking message");
                EnforcementAction::Block
            }
        };

        GateVerdict::Denied {
            code,
            enforcement: Some(enforcement),
        }
    }

    fn on_failure(&self, entry: &SessionEntry, call: &str, err: &CollaboratorError) -> GateVerdict {
        match self.failure_mode {
            FailureMode::Open => {
                warn!(session_id = %entry.id, call, %err, "authorization unavailable, failing open");
                GateVerdict::Allowed
            }
            FailureMode::Closed => {
                warn!(session_id = %entry.id, call, %err, "authorization unavailable, failing closed");
                GateVerdict::Denied {
                    code: AUTHORIZATION_UNAVAILABLE.to_string(),
                    enforcement: None,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::StaticAuthorization;

    fn entry() -> Arc<SessionEntry> {
        let e = Arc::new(SessionEntry::new(
            "10.0.0.5:4000".parse().unwrap(),
            "127.0.0.1:5900".parse().unwrap(),
        ));
        e.activate();
        e
    }

    fn gate(service: StaticAuthorization, mode: FailureMode) -> (AuthorizationGate, Arc<StaticAuthorization>) {
        let service = Arc::new(service);
        let gate = AuthorizationGate::new(
            service.clone(),
            vec![Permission::ViewOnly, Permission::RemoteControl],
            mode,
        );
        (gate, service)
    }

    const KEY: Message = Message::KeyEvent { down: true, key: 0x41 };

    // -- preventive --

    #[test]
    fn key_event_blocked_by_flag() {
        let cfg = PreventionConfig {
            block_key_event: true,
            ..Default::default()
        };
        assert!(should_block(MessageKind::KeyEvent, &cfg));
        assert!(!should_block(MessageKind::PointerEvent, &cfg));
        assert!(!should_block(MessageKind::KeyEvent, &PreventionConfig::default()));
    }

    // -- authorization --

    #[tokio::test]
    async fn token_is_issued_once_and_reused() {
        let (gate, service) = gate(StaticAuthorization::allow_all(), FailureMode::Closed);
        let e = entry();
        for _ in 0..3 {
            assert_eq!(gate.authorize(&e, &KEY, Direction::ClientToServer).await, GateVerdict::Allowed);
        }
        assert_eq!(service.issued(), 1);
        assert_eq!(
            e.token().get().unwrap().permissions,
            vec![Permission::ViewOnly, Permission::RemoteControl]
        );
    }

    #[tokio::test]
    async fn concurrent_first_messages_share_one_issuance() {
        let (gate, service) = gate(StaticAuthorization::allow_all(), FailureMode::Closed);
        let e = entry();
        let (a, b) = tokio::join!(
            gate.authorize(&e, &KEY, Direction::ClientToServer),
            gate.authorize(&e, &Message::Bell, Direction::ServerToClient),
        );
        assert_eq!(a, GateVerdict::Allowed);
        assert_eq!(b, GateVerdict::Allowed);
        assert_eq!(service.issued(), 1);
    }

    #[tokio::test]
    async fn denial_reports_code_and_enforcement() {
        let (gate, _) = gate(
            StaticAuthorization::allow_all().deny(
                MessageKind::KeyEvent,
                "view_only",
                EnforcementAction::Terminate,
            ),
            FailureMode::Closed,
        );
        let verdict = gate.authorize(&entry(), &KEY, Direction::ClientToServer).await;
        assert_eq!(
            verdict,
            GateVerdict::Denied {
                code: "view_only".to_string(),
                enforcement: Some(EnforcementAction::Terminate),
            }
        );
    }

    #[tokio::test]
    async fn unavailable_service_follows_failure_mode() {
        let (closed, _) = gate(StaticAuthorization::unavailable(), FailureMode::Closed);
        let verdict = closed.authorize(&entry(), &KEY, Direction::ClientToServer).await;
        assert_eq!(
            verdict,
            GateVerdict::Denied {
                code: AUTHORIZATION_UNAVAILABLE.to_string(),
                enforcement: None,
            }
        );

        let (open, _) = gate(StaticAuthorization::unavailable(), FailureMode::Open);
        let verdict = open.authorize(&entry(), &KEY, Direction::ClientToServer).await;
        assert_eq!(verdict, GateVerdict::Allowed);
    }
}
