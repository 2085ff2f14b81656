//! In-memory collaborator implementations.
//!
//! Useful for tests and for running the proxy without external services.
//! Each one records what it was asked so assertions can inspect it.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::Utc;

use crate::collaborator::{
    AccessCheck, AccessDecision, AuditEvent, AuditKind, AuditService, AuthorizationService,
    CollaboratorError, EnforcementAction, FileMetadata, IntegrityVerdict, ProvenanceService,
    RiskLevel, ThreatIntelService, ThreatType, Violation,
};
use crate::message::MessageKind;
use crate::session::{AccessToken, FileTransferRecord, Permission, SessionId, SessionSnapshot};

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Audit
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryAudit {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAudit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        lock(&self.events).clone()
    }

    pub fn count(&self, kind: AuditKind) -> usize {
        lock(&self.events).iter().filter(|e| e.kind == kind).count()
    }
}

#[async_trait]
impl AuditService for MemoryAudit {
    async fn record(&self, event: AuditEvent) -> Result<(), CollaboratorError> {
        lock(&self.events).push(event);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Threat intelligence
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ThreatRecord {
    pub session_id: SessionId,
    pub threat: ThreatType,
    pub evidence: serde_json::Value,
}

#[derive(Debug, Default)]
pub struct MemoryThreatIntel {
    reports: Mutex<Vec<ThreatRecord>>,
}

impl MemoryThreatIntel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<ThreatRecord> {
        lock(&self.reports).clone()
    }

    pub fn count(&self, threat: ThreatType) -> usize {
        lock(&self.reports).iter().filter(|r| r.threat == threat).count()
    }
}

#[async_trait]
impl ThreatIntelService for MemoryThreatIntel {
    async fn report(
        &self,
        session_id: SessionId,
        threat: ThreatType,
        evidence: serde_json::Value,
    ) -> Result<(), CollaboratorError> {
        lock(&self.reports).push(ThreatRecord {
            session_id,
            threat,
            evidence,
        });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Authorization
// ---------------------------------------------------------------------------

/// Grants whatever is requested and denies a fixed set of message kinds.
#[derive(Debug, Default)]
pub struct StaticAuthorization {
    denied: HashMap<MessageKind, (String, EnforcementAction)>,
    unavailable: bool,
    issued: Mutex<u32>,
}

impl StaticAuthorization {
    pub fn allow_all() -> Self {
        Self::default()
    }

    /// Deny `kind` with `code`, enforcing `action`.
    pub fn deny(mut self, kind: MessageKind, code: &str, action: EnforcementAction) -> Self {
        self.denied.insert(kind, (code.to_string(), action));
        self
    }

    /// Every call fails as if the service were down.
    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::default()
        }
    }

    /// How many tokens were issued.
    pub fn issued(&self) -> u32 {
        *lock(&self.issued)
    }

    fn check_up(&self) -> Result<(), CollaboratorError> {
        if self.unavailable {
            return Err(CollaboratorError::Unavailable {
                service: "authorization",
                message: "configured unavailable".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl AuthorizationService for StaticAuthorization {
    async fn issue_token(
        &self,
        session_id: SessionId,
        _client_addr: SocketAddr,
        permissions: &[Permission],
    ) -> Result<AccessToken, CollaboratorError> {
        self.check_up()?;
        // yield so concurrent first messages genuinely overlap in tests
        tokio::task::yield_now().await;
        *lock(&self.issued) += 1;
        Ok(AccessToken {
            value: format!("memory-{session_id}"),
            permissions: permissions.to_vec(),
            issued_at: Utc::now(),
        })
    }

    async fn check_access(
        &self,
        _snapshot: &SessionSnapshot,
        check: AccessCheck<'_>,
        _token: &AccessToken,
    ) -> Result<AccessDecision, CollaboratorError> {
        self.check_up()?;
        Ok(match self.denied.get(&check.kind) {
            Some((code, _)) => AccessDecision::deny(code.clone()),
            None => AccessDecision::allow(),
        })
    }

    async fn enforce_violation(
        &self,
        violation: &Violation,
    ) -> Result<EnforcementAction, CollaboratorError> {
        self.check_up()?;
        Ok(self
            .denied
            .get(&violation.message_kind)
            .map(|(_, action)| *action)
            .unwrap_or(EnforcementAction::Block))
    }
}

// ---------------------------------------------------------------------------
// Provenance
// ---------------------------------------------------------------------------

/// Returns a fixed risk level and integrity verdict for every file.
#[derive(Debug)]
pub struct StaticProvenance {
    risk: RiskLevel,
    verdict: IntegrityVerdict,
    registered: Mutex<Vec<String>>,
}

impl Default for StaticProvenance {
    fn default() -> Self {
        Self::new(RiskLevel::Low, true)
    }
}

impl StaticProvenance {
    pub fn new(risk: RiskLevel, valid: bool) -> Self {
        let issues = if valid {
            Vec::new()
        } else {
            vec!["hash mismatch".to_string()]
        };
        Self {
            risk,
            verdict: IntegrityVerdict { valid, issues },
            registered: Mutex::new(Vec::new()),
        }
    }

    /// Content hashes registered so far.
    pub fn registered(&self) -> Vec<String> {
        lock(&self.registered).clone()
    }
}

#[async_trait]
impl ProvenanceService for StaticProvenance {
    async fn register_file(&self, meta: FileMetadata<'_>) -> Result<RiskLevel, CollaboratorError> {
        lock(&self.registered).push(meta.content_hash.to_string());
        Ok(self.risk)
    }

    async fn verify_integrity(
        &self,
        _transfer: &FileTransferRecord,
        _payload: &[u8],
    ) -> Result<IntegrityVerdict, CollaboratorError> {
        Ok(self.verdict.clone())
    }
}
