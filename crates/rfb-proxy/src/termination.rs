//! Idempotent session teardown.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use net_guard::Blocklist;
use serde::{Serialize, Serializer};
use tracing::{debug, info, warn};

use crate::collaborator::{AuditEvent, AuditKind, AuditService, Broadcaster, SessionEvent};
use crate::risk;
use crate::session::{SessionId, SessionStore};

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    ClientClosed,
    ServerClosed,
    ConnectionError,
    IdleTimeout,
    HandshakeFailed,
    Shutdown,
    /// Declared message length above the decoder limit.
    OversizedMessage,
    IntegrityViolation,
    /// Authorization enforcement; carries the violation code.
    Violation(String),
}

impl TerminationReason {
    pub fn as_str(&self) -> &str {
        match self {
            Self::ClientClosed => "client_closed",
            Self::ServerClosed => "server_closed",
            Self::ConnectionError => "connection_error",
            Self::IdleTimeout => "idle_timeout",
            Self::HandshakeFailed => "handshake_failed",
            Self::Shutdown => "shutdown",
            Self::OversizedMessage => "oversized_message",
            Self::IntegrityViolation => "integrity_violation",
            Self::Violation(code) => code,
        }
    }

    /// Terminations caused by the client's behaviour rather than by the
    /// connection ending.
    pub fn is_violation(&self) -> bool {
        matches!(
            self,
            Self::Violation(_) | Self::IntegrityViolation | Self::OversizedMessage
        )
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for TerminationReason {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(self.as_str())
    }
}

/// Runs the teardown sequence exactly once per session.
pub struct TerminationController {
    store: Arc<SessionStore>,
    audit: Arc<dyn AuditService>,
    broadcaster: Arc<dyn Broadcaster>,
    blocklist: Arc<Blocklist>,
    auto_block: Option<Duration>,
}

impl TerminationController {
    pub fn new(
        store: Arc<SessionStore>,
        audit: Arc<dyn AuditService>,
        broadcaster: Arc<dyn Broadcaster>,
        blocklist: Arc<Blocklist>,
        auto_block: Option<Duration>,
    ) -> Self {
        Self {
            store,
            audit,
            broadcaster,
            blocklist,
            auto_block,
        }
    }

    /// Tear down `id`. Returns `true` only for the caller that performed the
    /// teardown; concurrent and repeated calls return `false` immediately.
    pub async fn terminate(&self, id: SessionId, reason: TerminationReason) -> bool {
        let Some(entry) = self.store.get(&id) else {
            debug!(session_id = %id, %reason, "terminate on unknown session");
            return false;
        };
        if !entry.begin_termination() {
            debug!(session_id = %id, %reason, "session already terminating");
            return false;
        }

        entry.cancel_token().cancel();
        self.store.remove(&id);

        let snapshot = entry.snapshot();
        let risk_score = risk::score(&snapshot);
        let c = snapshot.counters;

        info!(
            session_id = %id,
            client_addr = %entry.client_addr,
            %reason,
            risk_score,
            duration_secs = snapshot.duration.as_secs(),
            bytes = c.bytes_transferred,
            "session terminated"
        );

        let record = AuditEvent::for_session(
            AuditKind::SessionTerminated,
            id,
            entry.client_addr,
            serde_json::json!({
                "reason": reason.as_str(),
                "duration_secs": snapshot.duration.as_secs_f64(),
                "bytes_transferred": c.bytes_transferred,
                "key_events": c.key_events,
                "pointer_events": c.pointer_events,
                "clipboard_ops": c.clipboard_ops,
                "screenshots": c.screenshots,
                "file_transfers": snapshot.file_transfer_count,
                "risk_score": risk_score,
            }),
        );
        if let Err(err) = self.audit.record(record).await {
            warn!(session_id = %id, %err, "failed to record session termination");
        }

        self.broadcaster.emit(SessionEvent::SessionTerminated {
            id,
            reason: reason.clone(),
            timestamp: Utc::now(),
        });

        if reason.is_violation() {
            if let Some(duration) = self.auto_block {
                self.blocklist
                    .block_for(entry.client_addr.ip().to_canonical(), duration, reason.as_str());
            }
        }

        entry.mark_terminated();
        true
    }

    /// Terminate every live session, e.g. on shutdown.
    pub async fn terminate_all(&self, reason: TerminationReason) -> usize {
        let mut count = 0;
        for entry in self.store.entries() {
            if self.terminate(entry.id, reason.clone()).await {
                count += 1;
            }
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborator::{ChannelBroadcaster, SessionEvent};
    use crate::memory::MemoryAudit;
    use crate::session::SessionStatus;

    struct Fixture {
        store: Arc<SessionStore>,
        audit: Arc<MemoryAudit>,
        broadcaster: Arc<ChannelBroadcaster>,
        blocklist: Arc<Blocklist>,
        controller: Arc<TerminationController>,
    }

    fn fixture(auto_block: Option<Duration>) -> Fixture {
        let store = Arc::new(SessionStore::new());
        let audit = Arc::new(MemoryAudit::new());
        let broadcaster = Arc::new(ChannelBroadcaster::new(128));
        let blocklist = Arc::new(Blocklist::new());
        let controller = Arc::new(TerminationController::new(
            Arc::clone(&store),
            audit.clone(),
            broadcaster.clone(),
            Arc::clone(&blocklist),
            auto_block,
        ));
        Fixture {
            store,
            audit,
            broadcaster,
            blocklist,
            controller,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_terminate_produces_one_record_and_one_broadcast() {
        const ROUNDS: usize = 64;
        let f = fixture(None);
        let mut rx = f.broadcaster.subscribe();

        for round in 0..ROUNDS {
            let entry = f.store.open(
                format!("10.0.0.5:{}", 4000 + round).parse().unwrap(),
                "127.0.0.1:5900".parse().unwrap(),
            );
            entry.activate();

            let barrier = Arc::new(tokio::sync::Barrier::new(2));
            let racers: Vec<_> = [TerminationReason::ClientClosed, TerminationReason::ServerClosed]
                .into_iter()
                .map(|reason| {
                    let c = Arc::clone(&f.controller);
                    let barrier = Arc::clone(&barrier);
                    let id = entry.id;
                    tokio::spawn(async move {
                        barrier.wait().await;
                        c.terminate(id, reason).await
                    })
                })
                .collect();

            let mut winners = 0;
            for racer in racers {
                if racer.await.unwrap() {
                    winners += 1;
                }
            }
            assert_eq!(winners, 1, "exactly one caller should win round {round}");
            assert!(f.store.get(&entry.id).is_none());
            assert!(entry.cancel_token().is_cancelled());
            assert_eq!(entry.status(), SessionStatus::Terminated);
        }

        assert_eq!(f.audit.count(AuditKind::SessionTerminated), ROUNDS);
        for _ in 0..ROUNDS {
            assert!(matches!(rx.try_recv(), Ok(SessionEvent::SessionTerminated { .. })));
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn terminate_yields_to_a_teardown_already_in_progress() {
        let f = fixture(None);
        let entry = f.store.open("10.0.0.5:4000".parse().unwrap(), "127.0.0.1:5900".parse().unwrap());
        entry.activate();

        // another caller has won the status transition but not yet removed the entry
        assert!(entry.begin_termination());
        assert!(!f.controller.terminate(entry.id, TerminationReason::ClientClosed).await);

        assert_eq!(f.audit.count(AuditKind::SessionTerminated), 0);
        assert!(f.store.get(&entry.id).is_some());
        assert!(!entry.cancel_token().is_cancelled());
    }

    #[tokio::test]
    async fn final_record_carries_counters_and_reason() {
        let f = fixture(None);
        let entry = f.store.open("8.8.8.8:4000".parse().unwrap(), "127.0.0.1:5900".parse().unwrap());
        entry.activate();
        entry.update(|s| {
            s.counters.clipboard_ops = 2;
            s.counters.bytes_transferred = 512;
        });

        assert!(f.controller.terminate(entry.id, TerminationReason::IdleTimeout).await);

        let events = f.audit.events();
        let details = &events[0].details;
        assert_eq!(details["reason"], "idle_timeout");
        assert_eq!(details["clipboard_ops"], 2);
        assert_eq!(details["bytes_transferred"], 512);
        assert_eq!(details["risk_score"], 30);
    }

    #[tokio::test]
    async fn violation_auto_blocks_client() {
        let f = fixture(Some(Duration::from_secs(3600)));
        let entry = f.store.open("8.8.8.8:4000".parse().unwrap(), "127.0.0.1:5900".parse().unwrap());
        entry.activate();

        f.controller
            .terminate(entry.id, TerminationReason::Violation("view-only-input".into()))
            .await;
        let block = f.blocklist.lookup("8.8.8.8".parse().unwrap()).unwrap();
        assert_eq!(block.reason, "view-only-input");
    }

    #[tokio::test]
    async fn ordinary_close_does_not_block() {
        let f = fixture(Some(Duration::from_secs(3600)));
        let entry = f.store.open("8.8.8.8:4000".parse().unwrap(), "127.0.0.1:5900".parse().unwrap());
        f.controller.terminate(entry.id, TerminationReason::ClientClosed).await;
        assert!(f.blocklist.is_empty());
    }

    #[tokio::test]
    async fn terminate_all_clears_the_store() {
        let f = fixture(None);
        for port in 1..=3 {
            let e = f.store.open(
                format!("10.0.0.1:{port}").parse().unwrap(),
                "127.0.0.1:5900".parse().unwrap(),
            );
            e.activate();
        }
        assert_eq!(f.controller.terminate_all(TerminationReason::Shutdown).await, 3);
        assert!(f.store.is_empty());
        assert_eq!(f.audit.count(AuditKind::SessionTerminated), 3);
    }
}
