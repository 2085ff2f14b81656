//! Append-only structured JSON-lines audit logging for rfb-sentry.
//!
//! Every session lifecycle change, preventive block, authorization denial and
//! threat report produced by the proxy ends up here as one newline-terminated
//! JSON object. Producers hold a cheap [`AuditSink`] clone; a single
//! background task owns the file.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use audit_log::{AuditEntry, AuditEventType, AuditSink, AuditSource};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let (sink, _handle) = AuditSink::start("/var/log/rfb-sentry/audit.jsonl").await?;
//!
//! sink.log(AuditEntry::new(
//!     AuditEventType::ProcessStarted,
//!     AuditSource::new("rfb-sentry"),
//!     serde_json::json!({"version": "0.1.0"}),
//! ))
//! .await;
//! # Ok(())
//! # }
//! ```

pub mod entry;
pub mod sink;
pub mod writer;

pub use entry::{AuditEntry, AuditEventType, AuditSource, PolicyDecisionRecord};
pub use sink::{AuditSink, SinkError};
pub use writer::{read_entries, AuditWriteError, AuditWriter};
