//! Local implementations of the proxy's collaborator traits.
//!
//! Audit and threat reports go to the JSON-lines audit log, authorization is
//! answered from the YAML policy, and provenance is an in-process hash
//! registry.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use audit_log::{AuditEntry, AuditEventType, AuditSink, AuditSource, PolicyDecisionRecord};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use policy_engine::{AccessRequest, PolicyEngine, RuleAction};
use rfb_proxy::collaborator::{
    AccessCheck, AccessDecision, FileMetadata, IntegrityVerdict, RiskLevel,
};
use rfb_proxy::session::{AccessToken, FileTransferRecord};
use rfb_proxy::{
    AuditEvent, AuditKind, AuditService, AuthorizationService, CollaboratorError,
    EnforcementAction, Permission, ProvenanceService, SessionId, SessionSnapshot,
    ThreatIntelService, ThreatType,
};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

const COMPONENT: &str = "rfb-proxy";

// ---------------------------------------------------------------------------
// Audit
// ---------------------------------------------------------------------------

/// Writes proxy audit events through the [`AuditSink`].
#[derive(Clone)]
pub struct AuditLogService {
    sink: AuditSink,
}

impl AuditLogService {
    pub fn new(sink: AuditSink) -> Self {
        Self { sink }
    }
}

fn event_type(kind: AuditKind) -> AuditEventType {
    match kind {
        AuditKind::SessionStarted => AuditEventType::SessionStarted,
        AuditKind::SessionTerminated => AuditEventType::SessionTerminated,
        AuditKind::PreventiveAction => AuditEventType::PreventiveAction,
        AuditKind::AccessDenied => AuditEventType::AccessDenied,
        AuditKind::EnforcementAction => AuditEventType::EnforcementAction,
        AuditKind::FileRegistered => AuditEventType::FileRegistered,
        AuditKind::ConnectionRejected => AuditEventType::ConnectionRejected,
        AuditKind::ListenerFailed => AuditEventType::ListenerFailed,
    }
}

fn source(session_id: Option<SessionId>, client_addr: Option<SocketAddr>) -> AuditSource {
    let mut source = AuditSource::new(COMPONENT);
    source.session_id = session_id.map(|id| id.to_string());
    source.remote_addr = client_addr.map(|a| a.to_string());
    source
}

/// Denials carry the policy rule that produced them.
fn decision_record(event: &AuditEvent) -> Option<PolicyDecisionRecord> {
    let action = match event.kind {
        AuditKind::AccessDenied => "deny".to_string(),
        AuditKind::EnforcementAction => event.details.get("action")?.as_str()?.to_lowercase(),
        _ => return None,
    };
    let code = event.details.get("code")?.as_str()?;
    Some(PolicyDecisionRecord {
        action,
        matched_rule: (code != "default_deny").then(|| code.to_string()),
        reason: format!("violation {code}"),
    })
}

#[async_trait]
impl AuditService for AuditLogService {
    async fn record(&self, event: AuditEvent) -> Result<(), CollaboratorError> {
        let decision = decision_record(&event);
        let mut entry = AuditEntry::new(
            event_type(event.kind),
            source(event.session_id, event.client_addr),
            event.details,
        );
        entry.timestamp = event.timestamp;
        if let Some(decision) = decision {
            entry = entry.with_policy_decision(decision);
        }
        self.sink.try_log(entry).map_err(|err| CollaboratorError::Unavailable {
            service: "audit",
            message: err.to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Threat intelligence
// ---------------------------------------------------------------------------

/// Records threat reports as `threat_reported` audit entries.
#[derive(Clone)]
pub struct AuditThreatIntel {
    sink: AuditSink,
}

impl AuditThreatIntel {
    pub fn new(sink: AuditSink) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl ThreatIntelService for AuditThreatIntel {
    async fn report(
        &self,
        session_id: SessionId,
        threat: ThreatType,
        evidence: serde_json::Value,
    ) -> Result<(), CollaboratorError> {
        info!(%session_id, %threat, "threat reported");
        let mut source = AuditSource::new(COMPONENT);
        source.session_id = Some(session_id.to_string());
        let entry = AuditEntry::new(
            AuditEventType::ThreatReported,
            source,
            serde_json::json!({
                "threat_type": threat,
                "evidence": evidence,
            }),
        );
        self.sink.try_log(entry).map_err(|err| CollaboratorError::Unavailable {
            service: "threat_intel",
            message: err.to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Authorization
// ---------------------------------------------------------------------------

/// Answers authorization questions from the loaded YAML policy.
pub struct PolicyAuthorizer {
    engine: Arc<PolicyEngine>,
}

impl PolicyAuthorizer {
    pub fn new(engine: Arc<PolicyEngine>) -> Self {
        Self { engine }
    }
}

fn permission_names(permissions: &[Permission]) -> Vec<String> {
    permissions.iter().map(|p| p.as_str().to_string()).collect()
}

fn parse_permission(name: &str) -> Option<Permission> {
    match name {
        "view_only" => Some(Permission::ViewOnly),
        "remote_control" => Some(Permission::RemoteControl),
        _ => None,
    }
}

#[async_trait]
impl AuthorizationService for PolicyAuthorizer {
    async fn issue_token(
        &self,
        session_id: SessionId,
        client_addr: SocketAddr,
        permissions: &[Permission],
    ) -> Result<AccessToken, CollaboratorError> {
        let granted = self
            .engine
            .grant(client_addr.ip(), &permission_names(permissions));
        let permissions: Vec<Permission> =
            granted.iter().filter_map(|p| parse_permission(p)).collect();
        debug!(%session_id, %client_addr, ?permissions, "access token issued");
        Ok(AccessToken {
            value: uuid::Uuid::new_v4().to_string(),
            permissions,
            issued_at: Utc::now(),
        })
    }

    async fn check_access(
        &self,
        snapshot: &SessionSnapshot,
        check: AccessCheck<'_>,
        token: &AccessToken,
    ) -> Result<AccessDecision, CollaboratorError> {
        let permissions = permission_names(&token.permissions);
        let decision = self.engine.evaluate(&AccessRequest {
            message_kind: check.kind.as_str(),
            client_addr: snapshot.client_addr.ip(),
            permissions: &permissions,
            file_name: check.file_name,
        });
        Ok(match decision.violation_code() {
            None => AccessDecision::allow(),
            Some(code) => AccessDecision::deny(code),
        })
    }

    async fn enforce_violation(
        &self,
        violation: &rfb_proxy::collaborator::Violation,
    ) -> Result<EnforcementAction, CollaboratorError> {
        let action = match self.engine.rule_action(&violation.code) {
            Some(RuleAction::Terminate) => EnforcementAction::Terminate,
            Some(RuleAction::Allow) => EnforcementAction::Log,
            Some(RuleAction::Deny) | None => EnforcementAction::Block,
        };
        debug!(
            session_id = %violation.session_id,
            code = %violation.code,
            ?action,
            "violation enforced"
        );
        Ok(action)
    }
}

// ---------------------------------------------------------------------------
// Provenance
// ---------------------------------------------------------------------------

const EXECUTABLE_EXTENSIONS: &[&str] = &["exe", "dll", "bat", "cmd", "ps1", "sh", "scr", "msi", "vbs", "jar"];
const ARCHIVE_EXTENSIONS: &[&str] = &["zip", "7z", "rar", "tar", "gz", "iso"];
const LARGE_FILE: u64 = 50 * 1024 * 1024;

/// Hashes remembered before the oldest sighting is forgotten.
const DEFAULT_REGISTRY_CAPACITY: usize = 10_000;

#[derive(Debug, Clone)]
struct RegisteredFile {
    file_name: String,
    size: u64,
    first_seen: DateTime<Utc>,
    source_addr: SocketAddr,
}

/// In-process file provenance: remembers the first sighting of each hash,
/// up to a fixed number of hashes, and scores files by type and size.
#[derive(Debug)]
pub struct LocalProvenance {
    files: DashMap<String, RegisteredFile>,
    capacity: usize,
}

impl LocalProvenance {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_REGISTRY_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            files: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    fn evict_oldest(&self) {
        let oldest = self
            .files
            .iter()
            .min_by_key(|f| f.first_seen)
            .map(|f| f.key().clone());
        if let Some(hash) = oldest {
            self.files.remove(&hash);
            debug!(content_hash = %hash, "provenance registry full, oldest hash forgotten");
        }
    }
}

impl Default for LocalProvenance {
    fn default() -> Self {
        Self::new()
    }
}

fn assess(file_name: &str, size: u64) -> RiskLevel {
    let ext = Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    let by_type = if EXECUTABLE_EXTENSIONS.contains(&ext.as_str()) {
        RiskLevel::High
    } else if ARCHIVE_EXTENSIONS.contains(&ext.as_str()) {
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    };

    if size > LARGE_FILE {
        match by_type {
            RiskLevel::Low => RiskLevel::Medium,
            RiskLevel::Medium => RiskLevel::High,
            _ => RiskLevel::Critical,
        }
    } else {
        by_type
    }
}

#[async_trait]
impl ProvenanceService for LocalProvenance {
    async fn register_file(&self, meta: FileMetadata<'_>) -> Result<RiskLevel, CollaboratorError> {
        let size = meta.payload.len() as u64;
        let risk = assess(meta.file_name, size);
        if !self.files.contains_key(meta.content_hash) && self.files.len() >= self.capacity {
            self.evict_oldest();
        }
        match self.files.entry(meta.content_hash.to_string()) {
            Entry::Occupied(known) => {
                let first = known.get();
                debug!(
                    content_hash = meta.content_hash,
                    first_name = %first.file_name,
                    first_seen = %first.first_seen,
                    first_source = %first.source_addr,
                    "file seen before"
                );
            }
            Entry::Vacant(slot) => {
                slot.insert(RegisteredFile {
                    file_name: meta.file_name.to_string(),
                    size,
                    first_seen: Utc::now(),
                    source_addr: meta.source_addr,
                });
            }
        }
        Ok(risk)
    }

    async fn verify_integrity(
        &self,
        transfer: &FileTransferRecord,
        payload: &[u8],
    ) -> Result<IntegrityVerdict, CollaboratorError> {
        let mut issues = Vec::new();

        let actual = hex::encode(Sha256::digest(payload));
        if actual != transfer.content_hash {
            issues.push(format!(
                "content hash mismatch: recorded {}, computed {actual}",
                transfer.content_hash
            ));
        }
        if payload.len() as u64 != transfer.size {
            issues.push(format!(
                "size mismatch: recorded {}, payload {}",
                transfer.size,
                payload.len()
            ));
        }
        match self.files.get(&transfer.content_hash) {
            Some(known) if known.size != transfer.size => issues.push(format!(
                "registered size {} differs from transfer size {}",
                known.size, transfer.size
            )),
            Some(_) => {}
            None => issues.push("file was never registered".to_string()),
        }

        Ok(IntegrityVerdict {
            valid: issues.is_empty(),
            issues,
        })
    }
}
