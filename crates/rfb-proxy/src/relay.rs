//! One half-connection: read, decode, inspect, forward.
//!
//! Each direction runs this loop in its own task. Within a direction one
//! read is fully decided and written before the next read starts, so bytes
//! leave in arrival order.

use std::sync::Arc;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace, warn};

use crate::interceptor::{Interceptor, Verdict};
use crate::message::Direction;
use crate::session::SessionEntry;
use crate::termination::TerminationReason;

const READ_CHUNK: usize = 16 * 1024;

/// Relay `reader` into `writer` until the stream ends, the session is
/// cancelled or a message requires termination.
///
/// Returns the reason this direction wants the session torn down, or `None`
/// when it stopped because the session was already being terminated.
pub async fn relay<R, W>(
    interceptor: Arc<Interceptor>,
    entry: Arc<SessionEntry>,
    mut reader: R,
    mut writer: W,
    direction: Direction,
) -> Option<TerminationReason>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let cancel = entry.cancel_token().clone();
    let idle_timeout = interceptor.settings().idle_timeout;
    let partial_flush = interceptor.settings().partial_flush;
    let mut buf = BytesMut::with_capacity(READ_CHUNK);

    let reason = loop {
        // Server tails may be false framing inside pixel data, except cut
        // text and file responses, which always wait to be inspected. Client
        // tails wait for the rest of the message no matter how long it takes.
        let flush_pending = direction == Direction::ServerToClient
            && !buf.is_empty()
            && !interceptor.decoder().holds_server_tail(&buf);
        let wait = if flush_pending {
            partial_flush
        } else {
            idle_timeout.saturating_sub(entry.idle_for())
        };

        buf.reserve(READ_CHUNK);
        let read = tokio::select! {
            _ = cancel.cancelled() => break None,
            read = tokio::time::timeout(wait, reader.read_buf(&mut buf)) => read,
        };

        let n = match read {
            Err(_) if flush_pending => {
                trace!(session_id = %entry.id, len = buf.len(), "flushing partial server data");
                if let Err(reason) = write_out(&mut writer, &buf, &entry).await {
                    break Some(reason);
                }
                buf.clear();
                continue;
            }
            Err(_) => {
                if entry.idle_for() >= idle_timeout {
                    break Some(TerminationReason::IdleTimeout);
                }
                continue;
            }
            Ok(Ok(0)) => {
                if direction == Direction::ServerToClient
                    && !buf.is_empty()
                    && !interceptor.decoder().holds_server_tail(&buf)
                {
                    let _ = write_out(&mut writer, &buf, &entry).await;
                }
                break Some(closed_by(direction));
            }
            Ok(Ok(n)) => n,
            Ok(Err(err)) => {
                debug!(session_id = %entry.id, %direction, %err, "read failed");
                break Some(TerminationReason::ConnectionError);
            }
        };

        entry.touch();
        interceptor.events().observe_bytes(&entry, n);

        let outcome = match interceptor.decoder().decode(&buf, direction) {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(session_id = %entry.id, %direction, %err, "rejecting oversized message");
                break Some(TerminationReason::OversizedMessage);
            }
        };

        let mut out = BytesMut::with_capacity(outcome.consumed);
        let mut terminate = None;
        for parsed in &outcome.messages {
            match interceptor.inspect(&entry, &parsed.message, direction).await {
                Verdict::Forward => out.extend_from_slice(&buf[parsed.range()]),
                Verdict::Suppress => {}
                Verdict::Terminate(reason) => {
                    terminate = Some(reason);
                    break;
                }
            }
        }
        buf.advance(outcome.consumed);

        if terminate.is_none() && cancel.is_cancelled() {
            break None;
        }
        // Messages allowed ahead of a terminating one still go out.
        if !out.is_empty() {
            if let Err(reason) = write_out(&mut writer, &out, &entry).await {
                break Some(terminate.unwrap_or(reason));
            }
        }
        if terminate.is_some() {
            break terminate;
        }
    };

    let _ = writer.shutdown().await;
    reason
}

async fn write_out<W>(writer: &mut W, bytes: &[u8], entry: &SessionEntry) -> Result<(), TerminationReason>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(bytes).await.map_err(|err| {
        debug!(session_id = %entry.id, %err, "write failed");
        TerminationReason::ConnectionError
    })
}

fn closed_by(direction: Direction) -> TerminationReason {
    match direction {
        Direction::ClientToServer => TerminationReason::ClientClosed,
        Direction::ServerToClient => TerminationReason::ServerClosed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborator::{ChannelBroadcaster, Collaborators, EnforcementAction};
    use crate::memory::{MemoryAudit, MemoryThreatIntel, StaticAuthorization, StaticProvenance};
    use crate::message::MessageKind;
    use crate::settings::{PreventionConfig, ProxySettings};
    use content_scanner::Scanner;
    use net_guard::Blocklist;
    use std::time::Duration;
    use tokio::io::duplex;

    fn interceptor(settings: ProxySettings, auth: StaticAuthorization) -> Arc<Interceptor> {
        let collaborators = Collaborators {
            authorization: Arc::new(auth),
            audit: Arc::new(MemoryAudit::new()),
            threat_intel: Arc::new(MemoryThreatIntel::new()),
            provenance: Arc::new(StaticProvenance::default()),
            broadcaster: Arc::new(ChannelBroadcaster::new(8)),
        };
        Arc::new(Interceptor::new(
            Arc::new(settings),
            collaborators,
            Arc::new(Scanner::new().unwrap()),
            Arc::new(Blocklist::new()),
        ))
    }

    fn open(i: &Interceptor) -> Arc<SessionEntry> {
        let entry = i.store().open(
            "10.0.0.5:4000".parse().unwrap(),
            "127.0.0.1:5900".parse().unwrap(),
        );
        entry.activate();
        entry
    }

    fn key_event(key: u32) -> Vec<u8> {
        let mut b = vec![4, 1, 0, 0];
        b.extend_from_slice(&key.to_be_bytes());
        b
    }

    fn pointer_event() -> Vec<u8> {
        vec![5, 0, 0, 10, 0, 20]
    }

    /// Feed `input` through a client -> server relay and return what came out.
    async fn run_client_side(
        i: Arc<Interceptor>,
        entry: Arc<SessionEntry>,
        input: Vec<u8>,
    ) -> (Option<TerminationReason>, Vec<u8>) {
        let (mut client, relay_in) = duplex(64 * 1024);
        let (relay_out, mut server) = duplex(64 * 1024);

        client.write_all(&input).await.unwrap();
        client.shutdown().await.unwrap();

        let reason = relay(i, entry, relay_in, relay_out, Direction::ClientToServer).await;
        let mut forwarded = Vec::new();
        server.read_to_end(&mut forwarded).await.unwrap();
        (reason, forwarded)
    }

    #[tokio::test]
    async fn forwards_bytes_unchanged_and_reports_close() {
        let i = interceptor(ProxySettings::default(), StaticAuthorization::allow_all());
        let entry = open(&i);
        let mut input = key_event(0x61);
        input.extend(pointer_event());

        let (reason, forwarded) = run_client_side(i, Arc::clone(&entry), input.clone()).await;
        assert_eq!(reason, Some(TerminationReason::ClientClosed));
        assert_eq!(forwarded, input);
        let c = entry.snapshot().counters;
        assert_eq!(c.key_events, 1);
        assert_eq!(c.pointer_events, 1);
        assert_eq!(c.bytes_transferred, input.len() as u64);
    }

    #[tokio::test]
    async fn suppression_drops_only_the_blocked_message() {
        let settings = ProxySettings {
            prevention: PreventionConfig {
                block_key_event: true,
                ..Default::default()
            },
            ..Default::default()
        };
        let i = interceptor(settings, StaticAuthorization::allow_all());
        let entry = open(&i);
        let mut input = key_event(0x61);
        input.extend(pointer_event());

        let (_, forwarded) = run_client_side(i, entry, input).await;
        assert_eq!(forwarded, pointer_event());
    }

    #[tokio::test]
    async fn terminate_enforcement_stops_the_relay() {
        let auth = StaticAuthorization::allow_all().deny(
            MessageKind::KeyEvent,
            "view_only_input",
            EnforcementAction::Terminate,
        );
        let i = interceptor(ProxySettings::default(), auth);
        let entry = open(&i);
        let mut input = pointer_event();
        input.extend(key_event(0x61));
        input.extend(pointer_event());

        let (reason, forwarded) = run_client_side(i, entry, input).await;
        assert_eq!(
            reason,
            Some(TerminationReason::Violation("view_only_input".into()))
        );
        // the pointer event ahead of the violation was allowed
        assert_eq!(forwarded, pointer_event());
    }

    #[tokio::test]
    async fn oversized_client_message_terminates() {
        let settings = ProxySettings {
            max_message_len: 64,
            ..Default::default()
        };
        let i = interceptor(settings, StaticAuthorization::allow_all());
        let entry = open(&i);
        // ClientCutText declaring 1 KiB of text
        let input = vec![6, 0, 0, 0, 0, 0, 4, 0];

        let (reason, _) = run_client_side(i, entry, input).await;
        assert_eq!(reason, Some(TerminationReason::OversizedMessage));
    }

    #[tokio::test]
    async fn split_message_is_reassembled() {
        let i = interceptor(ProxySettings::default(), StaticAuthorization::allow_all());
        let entry = open(&i);
        let (mut client, relay_in) = duplex(1024);
        let (relay_out, mut server) = duplex(1024);

        let task = tokio::spawn(relay(
            Arc::clone(&i),
            Arc::clone(&entry),
            relay_in,
            relay_out,
            Direction::ClientToServer,
        ));

        let key = key_event(0x62);
        client.write_all(&key[..3]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        client.write_all(&key[3..]).await.unwrap();
        client.shutdown().await.unwrap();

        let mut forwarded = Vec::new();
        server.read_to_end(&mut forwarded).await.unwrap();
        assert_eq!(forwarded, key);
        assert_eq!(task.await.unwrap(), Some(TerminationReason::ClientClosed));
        assert_eq!(entry.snapshot().counters.key_events, 1);
    }

    #[tokio::test]
    async fn partial_server_tail_is_flushed_opaquely() {
        let i = interceptor(ProxySettings::default(), StaticAuthorization::allow_all());
        let entry = open(&i);
        let (mut upstream, relay_in) = duplex(1024);
        let (relay_out, mut client) = duplex(1024);

        let task = tokio::spawn(relay(
            Arc::clone(&i),
            Arc::clone(&entry),
            relay_in,
            relay_out,
            Direction::ServerToClient,
        ));

        // a FramebufferUpdate header cut short inside pixel data
        let tail = [0u8, 0, 0];
        upstream.write_all(&tail).await.unwrap();

        let mut got = vec![0u8; tail.len()];
        tokio::time::timeout(Duration::from_secs(2), client.read_exact(&mut got))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, tail);

        entry.cancel_token().cancel();
        assert_eq!(task.await.unwrap(), None);
    }

    fn server_cut_text(text: &[u8]) -> Vec<u8> {
        let mut b = vec![3, 0, 0, 0];
        b.extend_from_slice(&(text.len() as u32).to_be_bytes());
        b.extend_from_slice(text);
        b
    }

    #[tokio::test]
    async fn split_blocked_server_clipboard_is_never_flushed() {
        let settings = ProxySettings {
            prevention: PreventionConfig {
                block_clipboard: true,
                ..Default::default()
            },
            ..Default::default()
        };
        let i = interceptor(settings, StaticAuthorization::allow_all());
        let entry = open(&i);
        let (mut upstream, relay_in) = duplex(1024);
        let (relay_out, mut client) = duplex(1024);

        let task = tokio::spawn(relay(
            Arc::clone(&i),
            Arc::clone(&entry),
            relay_in,
            relay_out,
            Direction::ServerToClient,
        ));

        let cut = server_cut_text(b"secret launch codes 4111 1111 1111 1111");
        upstream.write_all(&cut[..12]).await.unwrap();
        // well past the partial flush interval
        tokio::time::sleep(Duration::from_millis(150)).await;
        upstream.write_all(&cut[12..]).await.unwrap();
        // Bell
        upstream.write_all(&[2]).await.unwrap();
        upstream.shutdown().await.unwrap();

        let mut got = Vec::new();
        tokio::time::timeout(Duration::from_secs(2), client.read_to_end(&mut got))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, vec![2]);
        assert_eq!(task.await.unwrap(), Some(TerminationReason::ServerClosed));
    }

    #[tokio::test]
    async fn split_server_clipboard_is_inspected_once_complete() {
        let i = interceptor(ProxySettings::default(), StaticAuthorization::allow_all());
        let entry = open(&i);
        let (mut upstream, relay_in) = duplex(1024);
        let (relay_out, mut client) = duplex(1024);

        let task = tokio::spawn(relay(
            Arc::clone(&i),
            Arc::clone(&entry),
            relay_in,
            relay_out,
            Direction::ServerToClient,
        ));

        let cut = server_cut_text(b"meeting at noon");
        upstream.write_all(&cut[..5]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        upstream.write_all(&cut[5..]).await.unwrap();
        upstream.shutdown().await.unwrap();

        let mut got = Vec::new();
        tokio::time::timeout(Duration::from_secs(2), client.read_to_end(&mut got))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, cut);
        assert_eq!(task.await.unwrap(), Some(TerminationReason::ServerClosed));
        assert_eq!(entry.snapshot().counters.clipboard_ops, 1);
    }

    #[tokio::test]
    async fn idle_session_times_out() {
        let settings = ProxySettings {
            idle_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let i = interceptor(settings, StaticAuthorization::allow_all());
        let entry = open(&i);
        let (_client, relay_in) = duplex(64);
        let (relay_out, _server) = duplex(64);

        let reason = tokio::time::timeout(
            Duration::from_secs(2),
            relay(i, entry, relay_in, relay_out, Direction::ClientToServer),
        )
        .await
        .unwrap();
        assert_eq!(reason, Some(TerminationReason::IdleTimeout));
    }
}
