use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::entry::{AuditEntry, AuditEventType};
use crate::writer::AuditWriter;

/// Channel buffer size used between producers and the background writer task.
const CHANNEL_BUFFER: usize = 4096;

/// Flush the writer at most every this many seconds when the channel is idle.
const FLUSH_INTERVAL_SECS: u64 = 1;

/// Why [`AuditSink::try_log`] dropped an entry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SinkError {
    #[error("audit channel full, {0:?} entry dropped")]
    Full(AuditEventType),

    #[error("audit writer stopped, {0:?} entry dropped")]
    Closed(AuditEventType),
}

/// Cloneable handle submitting [`AuditEntry`] values to the background
/// writer.
///
/// Session-scoped events come from relay tasks, which must never wait on the
/// log, so they go through [`try_log`](Self::try_log). Process-level events
/// (start, policy load, stop) use [`log`](Self::log) and wait for capacity.
#[derive(Clone)]
pub struct AuditSink {
    tx: mpsc::Sender<AuditEntry>,
    dropped: Arc<AtomicU64>,
}

impl AuditSink {
    /// Spawn the background writer for the JSON-lines file at `path`.
    ///
    /// The writer flushes after about a second without entries and once more
    /// when the last sink clone is dropped. Write errors are logged and the
    /// entry skipped.
    pub async fn start(
        path: impl AsRef<Path>,
    ) -> Result<(Self, JoinHandle<()>), crate::writer::AuditWriteError> {
        Self::start_with_capacity(path, CHANNEL_BUFFER).await
    }

    pub async fn start_with_capacity(
        path: impl AsRef<Path>,
        capacity: usize,
    ) -> Result<(Self, JoinHandle<()>), crate::writer::AuditWriteError> {
        let (tx, rx) = mpsc::channel::<AuditEntry>(capacity);
        let mut writer = AuditWriter::new(path).await?;
        let handle = tokio::spawn(async move {
            run_writer_loop(&mut writer, rx).await;
        });
        let sink = Self {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        };
        Ok((sink, handle))
    }

    /// Submit a process-level entry, waiting for channel capacity.
    pub async fn log(&self, entry: AuditEntry) {
        if let Err(err) = self.tx.send(entry).await {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(event_type = ?err.0.event_type, "audit writer stopped, entry dropped");
        }
    }

    /// Submit a session-scoped entry without waiting.
    pub fn try_log(&self, entry: AuditEntry) -> Result<(), SinkError> {
        let err = match self.tx.try_send(entry) {
            Ok(()) => return Ok(()),
            Err(mpsc::error::TrySendError::Full(entry)) => SinkError::Full(entry.event_type),
            Err(mpsc::error::TrySendError::Closed(entry)) => SinkError::Closed(entry.event_type),
        };
        self.dropped.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(%err, "audit entry dropped");
        Err(err)
    }

    /// Entries dropped so far across every clone of this sink.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Core loop executed inside the background task.
async fn run_writer_loop(writer: &mut AuditWriter, mut rx: mpsc::Receiver<AuditEntry>) {
    let flush_interval = tokio::time::Duration::from_secs(FLUSH_INTERVAL_SECS);
    let mut dirty = false;

    loop {
        match tokio::time::timeout(flush_interval, rx.recv()).await {
            Ok(Some(entry)) => {
                if let Err(err) = writer.write(&entry).await {
                    tracing::error!(%err, "failed to write audit entry");
                } else {
                    dirty = true;
                }
            }
            Ok(None) => {
                if dirty {
                    if let Err(err) = writer.flush().await {
                        tracing::error!(%err, "failed to flush audit log on shutdown");
                    }
                }
                tracing::debug!("audit writer background task shutting down");
                return;
            }
            Err(_) => {
                if dirty {
                    if let Err(err) = writer.flush().await {
                        tracing::error!(%err, "periodic audit log flush failed");
                    } else {
                        dirty = false;
                    }
                }
            }
        }
    }
}
