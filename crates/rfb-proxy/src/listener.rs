use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use content_scanner::Scanner;
use net_guard::Blocklist;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::collaborator::{AuditEvent, AuditKind, Collaborators, SessionEvent, ThreatType};
use crate::handshake;
use crate::interceptor::Interceptor;
use crate::message::Direction;
use crate::relay::relay;
use crate::session::SessionEntry;
use crate::settings::ProxySettings;
use crate::termination::TerminationReason;

/// Pause after a failed `accept` so a persistent error (e.g. fd exhaustion)
/// does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("no listener could be bound for monitored ports {0:?}")]
    NoListeners(Vec<u16>),
}

/// The RFB interception proxy.
///
/// Binds one listener per monitored port at `port + port_offset`, opens a
/// matching upstream connection per accepted client, passes the handshake
/// through untouched and then relays both directions through the
/// [`Interceptor`].
#[derive(Clone)]
pub struct Proxy {
    interceptor: Arc<Interceptor>,
    blocklist: Arc<Blocklist>,
    suspicious: Arc<HashSet<IpAddr>>,
    connections: TaskTracker,
}

impl Proxy {
    pub fn new(
        settings: ProxySettings,
        collaborators: Collaborators,
        scanner: Arc<Scanner>,
        blocklist: Arc<Blocklist>,
        suspicious: HashSet<IpAddr>,
    ) -> Self {
        let interceptor = Interceptor::new(
            Arc::new(settings),
            collaborators,
            scanner,
            Arc::clone(&blocklist),
        );
        Self {
            interceptor: Arc::new(interceptor),
            blocklist,
            suspicious: Arc::new(suspicious),
            connections: TaskTracker::new(),
        }
    }

    pub fn interceptor(&self) -> &Arc<Interceptor> {
        &self.interceptor
    }

    /// Bind every monitored port and serve until `shutdown` fires, then
    /// terminate all live sessions and wait for every connection task.
    ///
    /// A port that cannot be bound is logged and audited; the others keep
    /// running. Fails only when no port could be bound at all.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), ProxyError> {
        let settings = self.interceptor.settings();
        let mut listeners = JoinSet::new();

        for &port in &settings.monitored_ports {
            let Some(listen_port) = settings.listen_port(port) else {
                tracing::error!(port, offset = settings.port_offset, "listen port out of range");
                self.listener_failed(port, None, "listen port out of range".to_string())
                    .await;
                continue;
            };
            let addr = format!("{}:{}", settings.listen_host, listen_port);
            match TcpListener::bind(&addr).await {
                Ok(listener) => {
                    tracing::info!(%addr, upstream_port = port, "rfb-proxy listening");
                    let proxy = self.clone();
                    let shutdown = shutdown.clone();
                    listeners.spawn(async move { proxy.serve(listener, port, shutdown).await });
                }
                Err(err) => {
                    tracing::error!(%addr, %err, "failed to bind listener");
                    self.listener_failed(port, Some(&addr), err.to_string()).await;
                }
            }
        }

        if listeners.is_empty() {
            return Err(ProxyError::NoListeners(settings.monitored_ports.clone()));
        }

        while let Some(result) = listeners.join_next().await {
            if let Err(err) = result {
                tracing::error!(%err, "listener task failed");
            }
        }

        let terminated = self.drain().await;
        tracing::info!(sessions = terminated, "rfb-proxy stopped");
        Ok(())
    }

    /// Terminate every live session and wait for all connection tasks.
    ///
    /// Call once the accept loops have stopped. Returns how many sessions
    /// were terminated by the sweep.
    pub async fn drain(&self) -> usize {
        let terminated = self
            .interceptor
            .terminate_all(TerminationReason::Shutdown)
            .await;
        self.connections.close();
        self.connections.wait().await;
        terminated
    }

    /// Accept loop for one bound listener, relaying to `upstream_port`.
    pub async fn serve(&self, listener: TcpListener, upstream_port: u16, shutdown: CancellationToken) {
        loop {
            let (stream, client_addr) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        tracing::warn!(%err, "accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                        continue;
                    }
                },
            };

            if let Some(block) = self.blocklist.lookup(client_addr.ip().to_canonical()) {
                tracing::info!(%client_addr, reason = %block.reason, "connection rejected by blocklist");
                self.interceptor
                    .audit(AuditEvent::new(
                        AuditKind::ConnectionRejected,
                        serde_json::json!({
                            "client_addr": client_addr,
                            "reason": block.reason,
                        }),
                    ))
                    .await;
                drop(stream);
                continue;
            }

            let proxy = self.clone();
            let shutdown = shutdown.clone();
            self.connections.spawn(async move {
                proxy
                    .handle_connection(stream, client_addr, upstream_port, shutdown)
                    .await;
            });
        }
        tracing::debug!(upstream_port, "listener stopped");
    }

    async fn handle_connection(
        &self,
        mut client: TcpStream,
        client_addr: SocketAddr,
        upstream_port: u16,
        shutdown: CancellationToken,
    ) {
        let settings = self.interceptor.settings();

        // ------------------------------------------------------------------
        // 1. Upstream connection.
        // ------------------------------------------------------------------
        let upstream_addr = format!("{}:{}", settings.upstream_host, upstream_port);
        let connect = tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::debug!(%client_addr, "shutdown during upstream connect");
                return;
            }
            connect = tokio::time::timeout(settings.connect_timeout, TcpStream::connect(&upstream_addr)) => connect,
        };
        let mut upstream = match connect {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                self.upstream_failed(client_addr, &upstream_addr, err.to_string()).await;
                return;
            }
            Err(_) => {
                self.upstream_failed(client_addr, &upstream_addr, "connect timed out".to_string())
                    .await;
                return;
            }
        };
        let server_addr = match upstream.peer_addr() {
            Ok(addr) => addr,
            Err(err) => {
                self.upstream_failed(client_addr, &upstream_addr, err.to_string()).await;
                return;
            }
        };
        let _ = client.set_nodelay(true);
        let _ = upstream.set_nodelay(true);

        // ------------------------------------------------------------------
        // 2. Session registration.
        // ------------------------------------------------------------------
        if shutdown.is_cancelled() {
            tracing::debug!(%client_addr, "shutdown before session registration");
            return;
        }
        let entry = self.interceptor.store().open(client_addr, server_addr);
        // terminate_all may have swept the store between the check and open
        if shutdown.is_cancelled() {
            self.interceptor
                .terminate(entry.id, TerminationReason::Shutdown)
                .await;
            return;
        }
        self.session_started(&entry).await;

        // ------------------------------------------------------------------
        // 3. Handshake passthrough.
        // ------------------------------------------------------------------
        let handshake = tokio::select! {
            _ = entry.cancel_token().cancelled() => return,
            hs = handshake::passthrough_within(
                settings.handshake_timeout,
                &mut client,
                &mut upstream,
            ) => hs,
        };
        match handshake {
            Ok(summary) => {
                tracing::debug!(
                    session_id = %entry.id,
                    version = ?summary.version,
                    security_type = summary.security_type,
                    width = summary.width,
                    height = summary.height,
                    desktop = %summary.desktop_name,
                    "handshake complete"
                );
            }
            Err(err) => {
                tracing::warn!(session_id = %entry.id, %err, "handshake failed");
                self.interceptor
                    .terminate(entry.id, TerminationReason::HandshakeFailed)
                    .await;
                return;
            }
        }

        if !entry.activate() {
            // terminated while the handshake was finishing
            return;
        }
        entry.touch();

        // ------------------------------------------------------------------
        // 4. Bidirectional relay.
        // ------------------------------------------------------------------
        let (client_read, client_write) = client.into_split();
        let (server_read, server_write) = upstream.into_split();

        let mut halves = JoinSet::new();
        halves.spawn(relay(
            Arc::clone(&self.interceptor),
            Arc::clone(&entry),
            client_read,
            server_write,
            Direction::ClientToServer,
        ));
        halves.spawn(relay(
            Arc::clone(&self.interceptor),
            Arc::clone(&entry),
            server_read,
            client_write,
            Direction::ServerToClient,
        ));

        // The first half to stop decides the reason; terminating cancels the
        // other half.
        while let Some(result) = halves.join_next().await {
            let reason = match result {
                Ok(Some(reason)) => reason,
                Ok(None) => continue,
                Err(err) => {
                    tracing::error!(session_id = %entry.id, %err, "relay task failed");
                    TerminationReason::ConnectionError
                }
            };
            self.interceptor.terminate(entry.id, reason).await;
        }
    }

    // -- helpers --

    async fn session_started(&self, entry: &SessionEntry) {
        tracing::info!(
            session_id = %entry.id,
            client_addr = %entry.client_addr,
            server_addr = %entry.server_addr,
            "session started"
        );
        self.interceptor
            .audit(AuditEvent::for_session(
                AuditKind::SessionStarted,
                entry.id,
                entry.client_addr,
                serde_json::json!({ "server_addr": entry.server_addr }),
            ))
            .await;
        self.interceptor
            .collaborators()
            .broadcaster
            .emit(SessionEvent::SessionStarted {
                id: entry.id,
                client_addr: entry.client_addr,
                timestamp: Utc::now(),
            });

        if self.suspicious.contains(&entry.client_addr.ip().to_canonical()) {
            tracing::warn!(session_id = %entry.id, client_addr = %entry.client_addr, "connection from suspicious address");
            let reported = self
                .interceptor
                .collaborators()
                .threat_intel
                .report(
                    entry.id,
                    ThreatType::SuspiciousSource,
                    serde_json::json!({ "client_addr": entry.client_addr }),
                )
                .await;
            if let Err(err) = reported {
                tracing::warn!(session_id = %entry.id, %err, "threat report failed");
            }
        }
    }

    async fn upstream_failed(&self, client_addr: SocketAddr, upstream_addr: &str, error: String) {
        tracing::warn!(%client_addr, upstream = upstream_addr, %error, "upstream connection failed");
        self.interceptor
            .audit(AuditEvent::new(
                AuditKind::ConnectionRejected,
                serde_json::json!({
                    "client_addr": client_addr,
                    "upstream": upstream_addr,
                    "reason": "upstream_unreachable",
                    "error": error,
                }),
            ))
            .await;
    }

    async fn listener_failed(&self, port: u16, addr: Option<&str>, error: String) {
        self.interceptor
            .audit(AuditEvent::new(
                AuditKind::ListenerFailed,
                serde_json::json!({
                    "monitored_port": port,
                    "listen_addr": addr,
                    "error": error,
                }),
            ))
            .await;
    }
}
