//! Contracts for the services the proxy talks to.
//!
//! Authorization, audit, threat intelligence and file provenance live
//! outside this crate; the proxy only depends on these traits. Session
//! lifecycle notifications go through a [`Broadcaster`], implemented here by
//! a tokio broadcast channel.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::message::{Direction, MessageKind};
use crate::session::{AccessToken, FileTransferRecord, Permission, SessionId, SessionSnapshot};
use crate::termination::TerminationReason;

#[derive(Debug, Clone, thiserror::Error)]
pub enum CollaboratorError {
    #[error("{service} unavailable: {message}")]
    Unavailable { service: &'static str, message: String },

    #[error("{service} rejected the request: {message}")]
    Rejected { service: &'static str, message: String },
}

// ---------------------------------------------------------------------------
// Authorization
// ---------------------------------------------------------------------------

/// The message being authorized.
#[derive(Debug, Clone, Copy)]
pub struct AccessCheck<'a> {
    pub kind: MessageKind,
    pub direction: Direction,
    pub file_name: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessDecision {
    pub allowed: bool,
    /// Violation code when denied.
    pub code: Option<String>,
}

impl AccessDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            code: None,
        }
    }

    pub fn deny(code: impl Into<String>) -> Self {
        Self {
            allowed: false,
            code: Some(code.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Violation {
    pub session_id: SessionId,
    pub client_addr: SocketAddr,
    pub message_kind: MessageKind,
    pub code: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnforcementAction {
    /// Record only; the denied message is still dropped.
    Log,
    Block,
    Terminate,
}

#[async_trait]
pub trait AuthorizationService: Send + Sync {
    async fn issue_token(
        &self,
        session_id: SessionId,
        client_addr: SocketAddr,
        permissions: &[Permission],
    ) -> Result<AccessToken, CollaboratorError>;

    async fn check_access(
        &self,
        snapshot: &SessionSnapshot,
        check: AccessCheck<'_>,
        token: &AccessToken,
    ) -> Result<AccessDecision, CollaboratorError>;

    async fn enforce_violation(
        &self,
        violation: &Violation,
    ) -> Result<EnforcementAction, CollaboratorError>;
}

// ---------------------------------------------------------------------------
// Audit
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditKind {
    SessionStarted,
    SessionTerminated,
    PreventiveAction,
    AccessDenied,
    EnforcementAction,
    FileRegistered,
    ConnectionRejected,
    ListenerFailed,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub kind: AuditKind,
    pub session_id: Option<SessionId>,
    pub client_addr: Option<SocketAddr>,
    pub timestamp: DateTime<Utc>,
    pub details: serde_json::Value,
}

impl AuditEvent {
    pub fn new(kind: AuditKind, details: serde_json::Value) -> Self {
        Self {
            kind,
            session_id: None,
            client_addr: None,
            timestamp: Utc::now(),
            details,
        }
    }

    pub fn for_session(
        kind: AuditKind,
        session_id: SessionId,
        client_addr: SocketAddr,
        details: serde_json::Value,
    ) -> Self {
        Self {
            session_id: Some(session_id),
            client_addr: Some(client_addr),
            ..Self::new(kind, details)
        }
    }
}

/// Fire-and-forget audit recording. Errors are logged by the caller and never
/// affect forwarding.
#[async_trait]
pub trait AuditService: Send + Sync {
    async fn record(&self, event: AuditEvent) -> Result<(), CollaboratorError>;
}

// ---------------------------------------------------------------------------
// Threat intelligence
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ThreatType {
    SensitiveClipboardAccess,
    SensitiveFileTransfer,
    SuspiciousFileTransfer,
    FileIntegrityViolation,
    CredentialHarvesting,
    SuspiciousSource,
}

impl ThreatType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SensitiveClipboardAccess => "SENSITIVE_CLIPBOARD_ACCESS",
            Self::SensitiveFileTransfer => "SENSITIVE_FILE_TRANSFER",
            Self::SuspiciousFileTransfer => "SUSPICIOUS_FILE_TRANSFER",
            Self::FileIntegrityViolation => "FILE_INTEGRITY_VIOLATION",
            Self::CredentialHarvesting => "CREDENTIAL_HARVESTING",
            Self::SuspiciousSource => "SUSPICIOUS_SOURCE",
        }
    }
}

impl fmt::Display for ThreatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[async_trait]
pub trait ThreatIntelService: Send + Sync {
    async fn report(
        &self,
        session_id: SessionId,
        threat: ThreatType,
        evidence: serde_json::Value,
    ) -> Result<(), CollaboratorError>;
}

// ---------------------------------------------------------------------------
// Provenance
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn is_elevated(self) -> bool {
        self >= Self::High
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FileMetadata<'a> {
    pub file_name: &'a str,
    pub payload: &'a [u8],
    pub content_hash: &'a str,
    pub session_id: SessionId,
    pub source_addr: SocketAddr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityVerdict {
    pub valid: bool,
    #[serde(default)]
    pub issues: Vec<String>,
}

#[async_trait]
pub trait ProvenanceService: Send + Sync {
    async fn register_file(&self, meta: FileMetadata<'_>) -> Result<RiskLevel, CollaboratorError>;

    async fn verify_integrity(
        &self,
        transfer: &FileTransferRecord,
        payload: &[u8],
    ) -> Result<IntegrityVerdict, CollaboratorError>;
}

// ---------------------------------------------------------------------------
// Lifecycle broadcast
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    SessionStarted {
        id: SessionId,
        client_addr: SocketAddr,
        timestamp: DateTime<Utc>,
    },
    SessionTerminated {
        id: SessionId,
        reason: TerminationReason,
        timestamp: DateTime<Utc>,
    },
}

pub trait Broadcaster: Send + Sync {
    fn emit(&self, event: SessionEvent);
}

/// [`Broadcaster`] backed by a tokio broadcast channel. Emitting with no
/// subscribers is not an error.
#[derive(Debug, Clone)]
pub struct ChannelBroadcaster {
    tx: broadcast::Sender<SessionEvent>,
}

impl ChannelBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }
}

impl Broadcaster for ChannelBroadcaster {
    fn emit(&self, event: SessionEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("no lifecycle subscribers");
        }
    }
}

/// Every collaborator the proxy needs, bundled for construction.
#[derive(Clone)]
pub struct Collaborators {
    pub authorization: Arc<dyn AuthorizationService>,
    pub audit: Arc<dyn AuditService>,
    pub threat_intel: Arc<dyn ThreatIntelService>,
    pub provenance: Arc<dyn ProvenanceService>,
    pub broadcaster: Arc<dyn Broadcaster>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elevated_risk_levels() {
        assert!(!RiskLevel::Low.is_elevated());
        assert!(!RiskLevel::Medium.is_elevated());
        assert!(RiskLevel::High.is_elevated());
        assert!(RiskLevel::Critical.is_elevated());
    }

    #[test]
    fn threat_type_names_match_serde() {
        let json = serde_json::to_string(&ThreatType::SensitiveClipboardAccess).unwrap();
        assert_eq!(json, format!("\"{}\"", ThreatType::SensitiveClipboardAccess));
    }

    #[tokio::test]
    async fn channel_broadcaster_delivers_to_subscribers() {
        let broadcaster = ChannelBroadcaster::new(8);
        // no subscribers yet: must not panic
        broadcaster.emit(SessionEvent::SessionTerminated {
            id: SessionId::nil(),
            reason: TerminationReason::Shutdown,
            timestamp: Utc::now(),
        });

        let mut rx = broadcaster.subscribe();
        let id = SessionId::new_v4();
        broadcaster.emit(SessionEvent::SessionStarted {
            id,
            client_addr: "10.0.0.1:1234".parse().unwrap(),
            timestamp: Utc::now(),
        });
        match rx.recv().await.unwrap() {
            SessionEvent::SessionStarted { id: got, .. } => assert_eq!(got, id),
            other => panic!("unexpected event {other:?}"),
        }
    }
}
