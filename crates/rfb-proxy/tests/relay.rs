//! End-to-end: viewer -> proxy -> fake VNC server over loopback TCP.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use content_scanner::Scanner;
use net_guard::Blocklist;
use rfb_proxy::memory::{MemoryAudit, MemoryThreatIntel, StaticAuthorization, StaticProvenance};
use rfb_proxy::{
    AuditKind, ChannelBroadcaster, Collaborators, PreventionConfig, Proxy, ProxySettings,
    SessionEvent, TerminationReason, ThreatType,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

const BANNER: &[u8] = b"RFB 003.008\n";
const DESKTOP: &str = "test-desktop";

fn server_init() -> Vec<u8> {
    let mut s = Vec::new();
    s.extend_from_slice(&1024u16.to_be_bytes());
    s.extend_from_slice(&768u16.to_be_bytes());
    s.extend_from_slice(&[0u8; 16]);
    s.extend_from_slice(&(DESKTOP.len() as u32).to_be_bytes());
    s.extend_from_slice(DESKTOP.as_bytes());
    s
}

fn key_event() -> Vec<u8> {
    vec![4, 1, 0, 0, 0, 0, 0, 0x61]
}

fn pointer_event() -> Vec<u8> {
    vec![5, 1, 0, 10, 0, 20]
}

fn client_cut_text(text: &str) -> Vec<u8> {
    let mut b = vec![6, 0, 0, 0];
    b.extend_from_slice(&(text.len() as u32).to_be_bytes());
    b.extend_from_slice(text.as_bytes());
    b
}

/// Accept one connection, run the server side of a 3.8 / None handshake,
/// collect `expect` bytes of client traffic, send a Bell and wait for close.
async fn fake_server(listener: TcpListener, expect: usize) -> Vec<u8> {
    let (mut s, _) = listener.accept().await.unwrap();
    s.write_all(BANNER).await.unwrap();
    let mut banner = [0u8; 12];
    s.read_exact(&mut banner).await.unwrap();
    s.write_all(&[1, 1]).await.unwrap();
    let mut chosen = [0u8; 1];
    s.read_exact(&mut chosen).await.unwrap();
    s.write_all(&0u32.to_be_bytes()).await.unwrap();
    let mut client_init = [0u8; 1];
    s.read_exact(&mut client_init).await.unwrap();
    s.write_all(&server_init()).await.unwrap();

    let mut received = vec![0u8; expect];
    s.read_exact(&mut received).await.unwrap();
    s.write_all(&[2]).await.unwrap();

    let mut rest = Vec::new();
    let _ = s.read_to_end(&mut rest).await;
    received
}

async fn viewer_handshake(c: &mut TcpStream) {
    let mut banner = [0u8; 12];
    c.read_exact(&mut banner).await.unwrap();
    assert_eq!(&banner, BANNER);
    c.write_all(BANNER).await.unwrap();
    let mut types = [0u8; 2];
    c.read_exact(&mut types).await.unwrap();
    c.write_all(&[1]).await.unwrap();
    let mut result = [0u8; 4];
    c.read_exact(&mut result).await.unwrap();
    assert_eq!(result, [0, 0, 0, 0]);
    c.write_all(&[1]).await.unwrap();
    let mut init = vec![0u8; server_init().len()];
    c.read_exact(&mut init).await.unwrap();
    assert_eq!(init, server_init());
}

#[tokio::test]
async fn blocked_key_event_is_dropped_and_the_rest_is_relayed() {
    let audit = Arc::new(MemoryAudit::new());
    let threats = Arc::new(MemoryThreatIntel::new());
    let broadcaster = Arc::new(ChannelBroadcaster::new(16));
    let mut events = broadcaster.subscribe();

    let settings = ProxySettings {
        upstream_host: "127.0.0.1".to_string(),
        prevention: PreventionConfig {
            block_key_event: true,
            ..Default::default()
        },
        ..Default::default()
    };
    let proxy = Proxy::new(
        settings,
        Collaborators {
            authorization: Arc::new(StaticAuthorization::allow_all()),
            audit: audit.clone(),
            threat_intel: threats.clone(),
            provenance: Arc::new(StaticProvenance::default()),
            broadcaster: broadcaster.clone(),
        },
        Arc::new(Scanner::new().unwrap()),
        Arc::new(Blocklist::new()),
        HashSet::new(),
    );

    let cut = client_cut_text("password: hunter2");
    let mut expected = pointer_event();
    expected.extend_from_slice(&cut);

    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_port = upstream.local_addr().unwrap().port();
    let server = tokio::spawn(fake_server(upstream, expected.len()));

    let front = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let front_addr = front.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    let serving = tokio::spawn({
        let proxy = proxy.clone();
        let shutdown = shutdown.clone();
        async move { proxy.serve(front, upstream_port, shutdown).await }
    });

    let mut viewer = TcpStream::connect(front_addr).await.unwrap();
    viewer_handshake(&mut viewer).await;

    let mut traffic = key_event();
    traffic.extend(pointer_event());
    traffic.extend_from_slice(&cut);
    viewer.write_all(&traffic).await.unwrap();

    let mut bell = [0u8; 1];
    tokio::time::timeout(Duration::from_secs(5), viewer.read_exact(&mut bell))
        .await
        .expect("bell in time")
        .unwrap();
    assert_eq!(bell, [2]);
    drop(viewer);

    let received = tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .expect("server finished")
        .unwrap();
    assert_eq!(received, expected);

    assert!(matches!(events.recv().await, Ok(SessionEvent::SessionStarted { .. })));
    let terminated = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("termination broadcast")
        .unwrap();
    let SessionEvent::SessionTerminated { reason, .. } = terminated else {
        panic!("unexpected event {terminated:?}");
    };
    assert!(matches!(
        reason,
        TerminationReason::ClientClosed | TerminationReason::ServerClosed
    ));

    assert_eq!(audit.count(AuditKind::SessionStarted), 1);
    assert_eq!(audit.count(AuditKind::PreventiveAction), 1);
    assert_eq!(audit.count(AuditKind::SessionTerminated), 1);
    assert_eq!(threats.count(ThreatType::SensitiveClipboardAccess), 1);
    assert!(proxy.interceptor().store().is_empty());

    shutdown.cancel();
    serving.await.unwrap();
}
