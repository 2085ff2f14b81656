//! Session risk score.

use std::time::Duration;

use crate::session::SessionSnapshot;

const MIB: u64 = 1024 * 1024;

/// Score a session from 0 (benign) to 100. Pure and deterministic.
///
/// | signal                         | weight |
/// |--------------------------------|--------|
/// | client outside private ranges  | 30     |
/// | > 100 MiB moved (else > 50 MiB)| 25 (15)|
/// | > 10 file transfers            | 20     |
/// | session longer than 8 h        | 15     |
/// | > 20 clipboard operations      | 10     |
/// | > 1000 key events              | 15     |
/// | > 5000 pointer events          | 10     |
/// | > 100 framebuffer updates      | 15     |
pub fn score(snapshot: &SessionSnapshot) -> u8 {
    let c = &snapshot.counters;
    let mut total: u32 = 0;

    if !net_guard::is_internal(snapshot.client_addr.ip()) {
        total += 30;
    }

    if c.bytes_transferred > 100 * MIB {
        total += 25;
    } else if c.bytes_transferred > 50 * MIB {
        total += 15;
    }

    if snapshot.file_transfer_count > 10 {
        total += 20;
    }
    if snapshot.duration > Duration::from_secs(8 * 3600) {
        total += 15;
    }
    if c.clipboard_ops > 20 {
        total += 10;
    }
    if c.key_events > 1000 {
        total += 15;
    }
    if c.pointer_events > 5000 {
        total += 10;
    }
    if c.screenshots > 100 {
        total += 15;
    }

    total.min(100) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Counters, SessionStatus};
    use chrono::Utc;
    use proptest::prelude::*;
    use uuid::Uuid;

    fn snapshot(client: &str, counters: Counters, files: usize, duration: Duration) -> SessionSnapshot {
        SessionSnapshot {
            id: Uuid::nil(),
            client_addr: client.parse().unwrap(),
            server_addr: "127.0.0.1:5900".parse().unwrap(),
            started_at: Utc::now(),
            duration,
            counters,
            file_transfer_count: files,
            status: SessionStatus::Active,
        }
    }

    #[test]
    fn quiet_internal_session_scores_zero() {
        let s = snapshot("10.0.0.5:1", Counters::default(), 0, Duration::ZERO);
        assert_eq!(score(&s), 0);
    }

    #[test]
    fn quiet_external_session_scores_thirty() {
        let s = snapshot("8.8.8.8:1", Counters::default(), 0, Duration::ZERO);
        assert_eq!(score(&s), 30);
    }

    #[test]
    fn volume_tiers() {
        let mut c = Counters {
            bytes_transferred: 60 * MIB,
            ..Default::default()
        };
        assert_eq!(score(&snapshot("10.0.0.1:1", c, 0, Duration::ZERO)), 15);
        c.bytes_transferred = 101 * MIB;
        assert_eq!(score(&snapshot("10.0.0.1:1", c, 0, Duration::ZERO)), 25);
    }

    #[test]
    fn everything_over_threshold_clamps_to_100() {
        let c = Counters {
            bytes_transferred: 200 * MIB,
            key_events: 5000,
            pointer_events: 10_000,
            clipboard_ops: 50,
            screenshots: 500,
        };
        let s = snapshot("8.8.8.8:1", c, 20, Duration::from_secs(9 * 3600));
        assert_eq!(score(&s), 100);
    }

    fn arb_counters() -> impl Strategy<Value = Counters> {
        (0u64..300 * MIB, 0u64..3000, 0u64..12_000, 0u64..60, 0u64..300).prop_map(
            |(bytes_transferred, key_events, pointer_events, clipboard_ops, screenshots)| Counters {
                bytes_transferred,
                key_events,
                pointer_events,
                clipboard_ops,
                screenshots,
            },
        )
    }

    proptest! {
        #[test]
        fn score_is_bounded(c in arb_counters(), files in 0usize..30, secs in 0u64..40_000, ext in any::<bool>()) {
            let client = if ext { "8.8.8.8:1" } else { "192.168.0.1:1" };
            let s = score(&snapshot(client, c, files, Duration::from_secs(secs)));
            prop_assert!(s <= 100);
            if c == Counters::default() && files == 0 && secs <= 8 * 3600 {
                prop_assert!(s <= 30);
            }
        }

        #[test]
        fn score_is_monotone_in_every_counter(
            c in arb_counters(),
            files in 0usize..30,
            secs in 0u64..40_000,
            bump in 0u64..10_000,
            which in 0usize..7,
        ) {
            let base = snapshot("8.8.8.8:1", c, files, Duration::from_secs(secs));
            let mut more = base.clone();
            match which {
                0 => more.counters.bytes_transferred += bump * MIB / 100,
                1 => more.counters.key_events += bump,
                2 => more.counters.pointer_events += bump,
                3 => more.counters.clipboard_ops += bump,
                4 => more.counters.screenshots += bump,
                5 => more.file_transfer_count += bump as usize,
                _ => more.duration += Duration::from_secs(bump * 10),
            }
            prop_assert!(score(&more) >= score(&base));
        }
    }
}
