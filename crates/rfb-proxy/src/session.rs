//! Session state and the store that owns it.
//!
//! The store is the only place a session lives. Relay tasks hold an
//! `Arc<SessionEntry>` and mutate counters through [`SessionEntry::update`];
//! lifecycle transitions are atomic compare-and-set operations so exactly one
//! caller wins a termination.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub type SessionId = Uuid;

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum SessionStatus {
    Created = 0,
    Active = 1,
    Terminating = 2,
    Terminated = 3,
}

impl SessionStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Created,
            1 => Self::Active,
            2 => Self::Terminating,
            _ => Self::Terminated,
        }
    }
}

// ---------------------------------------------------------------------------
// Data model
// ---------------------------------------------------------------------------

/// Monotonic per-session counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    pub bytes_transferred: u64,
    pub key_events: u64,
    pub pointer_events: u64,
    pub clipboard_ops: u64,
    pub screenshots: u64,
}

/// One observed file transfer. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileTransferRecord {
    pub file_name: String,
    pub size: u64,
    /// SHA-256 of the payload, lowercase hex.
    pub content_hash: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    ViewOnly,
    RemoteControl,
}

impl Permission {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ViewOnly => "view_only",
            Self::RemoteControl => "remote_control",
        }
    }
}

/// Capability issued by the authorization service, cached for the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessToken {
    pub value: String,
    pub permissions: Vec<Permission>,
    pub issued_at: DateTime<Utc>,
}

/// Heuristics that fire at most once per session.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReportedFlags {
    pub credential_harvesting: bool,
    pub screenshot_rate: bool,
    pub transfer_rate: bool,
}

/// Mutable part of a session, guarded by the entry mutex.
#[derive(Debug, Default)]
pub struct SessionState {
    pub counters: Counters,
    pub file_transfers: Vec<FileTransferRecord>,
    pub reported: ReportedFlags,
}

/// Owned read-only copy used by the risk scorer, authorization and audit.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub client_addr: SocketAddr,
    pub server_addr: SocketAddr,
    pub started_at: DateTime<Utc>,
    #[serde(with = "duration_secs")]
    pub duration: Duration,
    pub counters: Counters,
    pub file_transfer_count: usize,
    pub status: SessionStatus,
}

mod duration_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }
}

// ---------------------------------------------------------------------------
// SessionEntry
// ---------------------------------------------------------------------------

pub struct SessionEntry {
    pub id: SessionId,
    pub client_addr: SocketAddr,
    pub server_addr: SocketAddr,
    pub started_at: DateTime<Utc>,
    started: Instant,
    status: AtomicU8,
    /// Milliseconds since `started` at the last byte seen in either direction.
    last_activity_ms: AtomicU64,
    state: Mutex<SessionState>,
    token: OnceCell<AccessToken>,
    /// Cancelling this closes both half-connections.
    cancel: CancellationToken,
}

impl std::fmt::Debug for SessionEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionEntry")
            .field("id", &self.id)
            .field("client_addr", &self.client_addr)
            .field("status", &self.status())
            .finish()
    }
}

impl SessionEntry {
    pub fn new(client_addr: SocketAddr, server_addr: SocketAddr) -> Self {
        Self {
            id: Uuid::new_v4(),
            client_addr,
            server_addr,
            started_at: Utc::now(),
            started: Instant::now(),
            status: AtomicU8::new(SessionStatus::Created as u8),
            last_activity_ms: AtomicU64::new(0),
            state: Mutex::new(SessionState::default()),
            token: OnceCell::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn is_active(&self) -> bool {
        self.status() == SessionStatus::Active
    }

    /// CREATED -> ACTIVE once the handshake completed.
    pub fn activate(&self) -> bool {
        self.transition(SessionStatus::Created, SessionStatus::Active)
    }

    /// Claim the right to tear the session down. Only one caller ever gets
    /// `true`; a session that never reached ACTIVE can still be claimed.
    pub fn begin_termination(&self) -> bool {
        self.transition(SessionStatus::Active, SessionStatus::Terminating)
            || self.transition(SessionStatus::Created, SessionStatus::Terminating)
    }

    pub(crate) fn mark_terminated(&self) {
        self.status
            .store(SessionStatus::Terminated as u8, Ordering::Release);
    }

    fn transition(&self, from: SessionStatus, to: SessionStatus) -> bool {
        self.status
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Record traffic in either direction for idle detection.
    pub fn touch(&self) {
        let now = self.started.elapsed().as_millis() as u64;
        self.last_activity_ms.fetch_max(now, Ordering::Relaxed);
    }

    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_activity_ms.load(Ordering::Relaxed));
        self.started.elapsed().saturating_sub(last)
    }

    /// Run `f` with exclusive access to the mutable state. Never hold across
    /// an await point.
    pub fn update<R>(&self, f: impl FnOnce(&mut SessionState) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let (counters, file_transfer_count) =
            self.update(|s| (s.counters, s.file_transfers.len()));
        SessionSnapshot {
            id: self.id,
            client_addr: self.client_addr,
            server_addr: self.server_addr,
            started_at: self.started_at,
            duration: self.elapsed(),
            counters,
            file_transfer_count,
            status: self.status(),
        }
    }

    pub fn token(&self) -> &OnceCell<AccessToken> {
        &self.token
    }

    pub fn file_transfers(&self) -> Vec<FileTransferRecord> {
        self.update(|s| s.file_transfers.clone())
    }
}

// ---------------------------------------------------------------------------
// SessionStore
// ---------------------------------------------------------------------------

/// Concurrent map of live sessions.
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: DashMap<SessionId, Arc<SessionEntry>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and insert a session for a freshly accepted client.
    pub fn open(&self, client_addr: SocketAddr, server_addr: SocketAddr) -> Arc<SessionEntry> {
        let entry = Arc::new(SessionEntry::new(client_addr, server_addr));
        self.insert(Arc::clone(&entry));
        entry
    }

    pub fn insert(&self, entry: Arc<SessionEntry>) {
        self.sessions.insert(entry.id, entry);
    }

    pub fn get(&self, id: &SessionId) -> Option<Arc<SessionEntry>> {
        self.sessions.get(id).map(|e| Arc::clone(e.value()))
    }

    /// Mutate a session's state; `None` if it is gone.
    pub fn update<R>(&self, id: &SessionId, f: impl FnOnce(&mut SessionState) -> R) -> Option<R> {
        self.get(id).map(|entry| entry.update(f))
    }

    pub fn remove(&self, id: &SessionId) -> Option<Arc<SessionEntry>> {
        self.sessions.remove(id).map(|(_, entry)| entry)
    }

    pub fn snapshot(&self, id: &SessionId) -> Option<SessionSnapshot> {
        self.get(id).map(|entry| entry.snapshot())
    }

    pub fn snapshots(&self) -> Vec<SessionSnapshot> {
        self.entries().iter().map(|e| e.snapshot()).collect()
    }

    /// Clone out every entry so callers never hold a shard lock.
    pub fn entries(&self) -> Vec<Arc<SessionEntry>> {
        self.sessions.iter().map(|e| Arc::clone(e.value())).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn store_with_session() -> (SessionStore, Arc<SessionEntry>) {
        let store = SessionStore::new();
        let entry = store.open(addr("10.0.0.5:50000"), addr("127.0.0.1:5900"));
        (store, entry)
    }

    // -- lifecycle --

    #[test]
    fn lifecycle_transitions_are_one_way() {
        let (_store, entry) = store_with_session();
        assert_eq!(entry.status(), SessionStatus::Created);
        assert!(entry.activate());
        assert!(!entry.activate());
        assert!(entry.begin_termination());
        assert!(!entry.begin_termination());
        assert_eq!(entry.status(), SessionStatus::Terminating);
        entry.mark_terminated();
        assert!(!entry.activate());
        assert!(!entry.begin_termination());
    }

    #[test]
    fn created_session_can_be_terminated() {
        let (_store, entry) = store_with_session();
        assert!(entry.begin_termination());
        assert!(!entry.activate());
    }

    #[test]
    fn concurrent_termination_has_one_winner() {
        let (_store, entry) = store_with_session();
        entry.activate();
        let winners: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| scope.spawn(|| entry.begin_termination() as usize))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });
        assert_eq!(winners, 1);
    }

    // -- store operations --

    #[test]
    fn update_and_snapshot() {
        let (store, entry) = store_with_session();
        store
            .update(&entry.id, |s| {
                s.counters.key_events += 3;
                s.counters.bytes_transferred += 100;
            })
            .unwrap();

        let snap = store.snapshot(&entry.id).unwrap();
        assert_eq!(snap.counters.key_events, 3);
        assert_eq!(snap.counters.bytes_transferred, 100);
        assert_eq!(snap.client_addr, addr("10.0.0.5:50000"));
        assert_eq!(store.snapshots().len(), 1);
    }

    #[test]
    fn removed_session_is_gone() {
        let (store, entry) = store_with_session();
        assert!(store.remove(&entry.id).is_some());
        assert!(store.remove(&entry.id).is_none());
        assert!(store.update(&entry.id, |_| ()).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn idle_time_resets_on_touch() {
        let (_store, entry) = store_with_session();
        std::thread::sleep(Duration::from_millis(20));
        assert!(entry.idle_for() >= Duration::from_millis(20));
        entry.touch();
        assert!(entry.idle_for() < Duration::from_millis(20));
    }

    #[test]
    fn snapshot_serializes_duration_as_seconds() {
        let (_store, entry) = store_with_session();
        let json = serde_json::to_value(entry.snapshot()).unwrap();
        assert!(json["duration"].is_f64());
        assert_eq!(json["status"], "created");
    }
}
