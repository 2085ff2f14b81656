//! Side effects of messages that passed the gates: counters, content scans,
//! file provenance and behavioural heuristics.
//!
//! Every collaborator call here is best-effort. A failing audit, threat or
//! provenance service is logged and the message is still forwarded.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use content_scanner::{Finding, Scanner};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::collaborator::{
    AuditEvent, AuditKind, AuditService, FileMetadata, ProvenanceService, ThreatIntelService,
    ThreatType,
};
use crate::message::{Direction, Message};
use crate::session::{FileTransferRecord, SessionEntry};
use crate::settings::Thresholds;
use crate::termination::TerminationReason;

/// Longest redacted text preview kept in evidence.
const PREVIEW_CHARS: usize = 200;

/// Rates are not judged before this much session time has passed.
const RATE_WARMUP: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    Continue,
    Terminate(TerminationReason),
}

pub struct EventProcessor {
    scanner: Arc<Scanner>,
    threat_intel: Arc<dyn ThreatIntelService>,
    provenance: Arc<dyn ProvenanceService>,
    audit: Arc<dyn AuditService>,
    thresholds: Thresholds,
}

impl EventProcessor {
    pub fn new(
        scanner: Arc<Scanner>,
        threat_intel: Arc<dyn ThreatIntelService>,
        provenance: Arc<dyn ProvenanceService>,
        audit: Arc<dyn AuditService>,
        thresholds: Thresholds,
    ) -> Self {
        Self {
            scanner,
            threat_intel,
            provenance,
            audit,
            thresholds,
        }
    }

    /// Count bytes read from either side and check the transfer rate.
    pub fn observe_bytes(&self, entry: &SessionEntry, n: usize) {
        let elapsed = entry.elapsed();
        let rate_exceeded = entry.update(|s| {
            s.counters.bytes_transferred += n as u64;
            if s.reported.transfer_rate || elapsed < RATE_WARMUP {
                return None;
            }
            let rate = s.counters.bytes_transferred / elapsed.as_secs().max(1);
            if rate > self.thresholds.transfer_rate_bytes_per_sec {
                s.reported.transfer_rate = true;
                return Some(rate);
            }
            None
        });
        if let Some(rate) = rate_exceeded {
            warn!(
                session_id = %entry.id,
                bytes_per_sec = rate,
                threshold = self.thresholds.transfer_rate_bytes_per_sec,
                "transfer rate above threshold"
            );
        }
    }

    pub async fn process(
        &self,
        entry: &SessionEntry,
        message: &Message,
        direction: Direction,
    ) -> EventOutcome {
        match message {
            Message::ClientCutText { text } | Message::ServerCutText { text } => {
                self.on_clipboard(entry, text, direction).await;
            }
            Message::FileTransferRequest {
                file_name, payload, ..
            } => {
                return self.on_file_transfer(entry, file_name, payload).await;
            }
            Message::KeyEvent { .. } => self.on_key_event(entry).await,
            Message::PointerEvent { .. } => {
                entry.update(|s| s.counters.pointer_events += 1);
            }
            Message::FramebufferUpdate { .. } => self.on_screenshot(entry),
            Message::FileTransferResponse { .. }
            | Message::SetPixelFormat
            | Message::SetEncodings { .. }
            | Message::FramebufferUpdateRequest { .. }
            | Message::SetColourMapEntries { .. }
            | Message::Bell
            | Message::Unknown { .. } => {}
        }
        EventOutcome::Continue
    }

    // -- clipboard --

    async fn on_clipboard(&self, entry: &SessionEntry, text: &str, direction: Direction) {
        entry.update(|s| s.counters.clipboard_ops += 1);

        let findings = self.scanner.scan(text);
        if findings.is_empty() {
            return;
        }
        info!(
            session_id = %entry.id,
            %direction,
            findings = findings.len(),
            "sensitive clipboard content"
        );
        let evidence = serde_json::json!({
            "direction": direction,
            "matches": matched_texts(&findings),
            "patterns": pattern_names(&findings),
            "length": text.len(),
            "preview": self.preview(text),
        });
        self.report(entry, ThreatType::SensitiveClipboardAccess, evidence)
            .await;
    }

    // -- file transfer --

    async fn on_file_transfer(
        &self,
        entry: &SessionEntry,
        file_name: &str,
        payload: &[u8],
    ) -> EventOutcome {
        let content_hash = hex::encode(Sha256::digest(payload));
        let record = FileTransferRecord {
            file_name: file_name.to_string(),
            size: payload.len() as u64,
            content_hash: content_hash.clone(),
            timestamp: Utc::now(),
        };
        entry.update(|s| s.file_transfers.push(record.clone()));

        info!(
            session_id = %entry.id,
            file_name,
            size = payload.len(),
            %content_hash,
            "file transfer observed"
        );

        let meta = FileMetadata {
            file_name,
            payload,
            content_hash: &content_hash,
            session_id: entry.id,
            source_addr: entry.client_addr,
        };
        match self.provenance.register_file(meta).await {
            Ok(risk_level) => {
                self.record_audit(AuditEvent::for_session(
                    AuditKind::FileRegistered,
                    entry.id,
                    entry.client_addr,
                    serde_json::json!({
                        "file_name": file_name,
                        "size": payload.len(),
                        "content_hash": content_hash,
                        "risk_level": risk_level,
                    }),
                ))
                .await;
                if risk_level.is_elevated() {
                    self.report(
                        entry,
                        ThreatType::SuspiciousFileTransfer,
                        serde_json::json!({
                            "file_name": file_name,
                            "content_hash": content_hash,
                            "risk_level": risk_level,
                        }),
                    )
                    .await;
                }
            }
            Err(err) => warn!(session_id = %entry.id, %err, "file registration failed"),
        }

        let mut findings = self.scanner.scan(file_name);
        findings.extend(self.scanner.scan_bytes(payload));
        if !findings.is_empty() {
            self.report(
                entry,
                ThreatType::SensitiveFileTransfer,
                serde_json::json!({
                    "file_name": file_name,
                    "content_hash": content_hash,
                    "matches": matched_texts(&findings),
                    "patterns": pattern_names(&findings),
                }),
            )
            .await;
        }

        match self.provenance.verify_integrity(&record, payload).await {
            Ok(verdict) if !verdict.valid => {
                warn!(
                    session_id = %entry.id,
                    file_name,
                    issues = ?verdict.issues,
                    "file integrity violation"
                );
                self.report(
                    entry,
                    ThreatType::FileIntegrityViolation,
                    serde_json::json!({
                        "file_name": file_name,
                        "content_hash": content_hash,
                        "issues": verdict.issues,
                    }),
                )
                .await;
                return EventOutcome::Terminate(TerminationReason::IntegrityViolation);
            }
            Ok(_) => {}
            Err(err) => warn!(session_id = %entry.id, %err, "integrity verification failed"),
        }

        EventOutcome::Continue
    }

    // -- input heuristics --

    async fn on_key_event(&self, entry: &SessionEntry) {
        let elapsed = entry.elapsed();
        let threshold = self.thresholds.credential_key_events;
        let within_window = elapsed <= self.thresholds.credential_window;

        let flagged = entry.update(|s| {
            s.counters.key_events += 1;
            if within_window && !s.reported.credential_harvesting && s.counters.key_events > threshold
            {
                s.reported.credential_harvesting = true;
                return Some(s.counters.key_events);
            }
            None
        });

        if let Some(key_events) = flagged {
            warn!(session_id = %entry.id, key_events, "possible credential harvesting");
            self.report(
                entry,
                ThreatType::CredentialHarvesting,
                serde_json::json!({
                    "key_events": key_events,
                    "threshold": threshold,
                    "elapsed_secs": elapsed.as_secs(),
                    "window_secs": self.thresholds.credential_window.as_secs(),
                }),
            )
            .await;
        }
    }

    fn on_screenshot(&self, entry: &SessionEntry) {
        let elapsed = entry.elapsed();
        let limit = self.thresholds.screenshots_per_min;
        let rate = entry.update(|s| {
            s.counters.screenshots += 1;
            if s.reported.screenshot_rate || elapsed < RATE_WARMUP {
                return None;
            }
            let per_min = s.counters.screenshots * 60 / elapsed.as_secs().max(1);
            if per_min > limit {
                s.reported.screenshot_rate = true;
                return Some(per_min);
            }
            None
        });
        if let Some(per_min) = rate {
            warn!(
                session_id = %entry.id,
                per_min,
                threshold = limit,
                "screenshot rate above threshold"
            );
        }
    }

    // -- helpers --

    fn preview(&self, text: &str) -> String {
        let truncated: String = text.chars().take(PREVIEW_CHARS).collect();
        self.scanner.redact(&truncated)
    }

    async fn report(&self, entry: &SessionEntry, threat: ThreatType, evidence: serde_json::Value) {
        if let Err(err) = self.threat_intel.report(entry.id, threat, evidence).await {
            warn!(session_id = %entry.id, %threat, %err, "threat report failed");
        }
    }

    async fn record_audit(&self, event: AuditEvent) {
        if let Err(err) = self.audit.record(event).await {
            warn!(%err, "audit record failed");
        }
    }
}

fn matched_texts(findings: &[Finding]) -> Vec<&str> {
    findings.iter().map(|f| f.matched_text.as_str()).collect()
}

fn pattern_names(findings: &[Finding]) -> Vec<&str> {
    let mut names: Vec<&str> = findings.iter().map(|f| f.pattern_name.as_str()).collect();
    names.dedup();
    names
}
