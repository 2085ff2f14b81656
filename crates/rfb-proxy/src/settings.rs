//! Runtime settings for the proxy core.
//!
//! The binary maps its YAML configuration onto these types; tests build them
//! directly.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::DEFAULT_MAX_MESSAGE_LEN;
use crate::message::MessageKind;
use crate::session::Permission;

/// Static blocking switches evaluated before authorization.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreventionConfig {
    pub block_key_event: bool,
    pub block_pointer_event: bool,
    /// Both file-transfer directions.
    pub block_file_transfer: bool,
    /// Cut-text in both directions.
    pub block_clipboard: bool,
}

impl PreventionConfig {
    pub fn blocks(&self, kind: MessageKind) -> bool {
        match kind {
            MessageKind::KeyEvent => self.block_key_event,
            MessageKind::PointerEvent => self.block_pointer_event,
            k if k.is_clipboard() => self.block_clipboard,
            k if k.is_file_transfer() => self.block_file_transfer,
            _ => false,
        }
    }
}

/// Behavioural thresholds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Thresholds {
    /// Key events above this count inside `credential_window` are reported.
    pub credential_key_events: u64,
    /// Measured from session start.
    pub credential_window: Duration,
    /// Logged, not enforced.
    pub transfer_rate_bytes_per_sec: u64,
    /// Logged, not enforced.
    pub screenshots_per_min: u64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            credential_key_events: 100,
            credential_window: Duration::from_secs(300),
            transfer_rate_bytes_per_sec: 10 * 1024 * 1024,
            screenshots_per_min: 60,
        }
    }
}

/// What to do with a message when the authorization service cannot answer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    /// Allow and warn.
    Open,
    /// Deny and audit.
    #[default]
    Closed,
}

#[derive(Debug, Clone)]
pub struct ProxySettings {
    pub listen_host: String,
    pub upstream_host: String,
    /// One listener per entry, on `port + port_offset`.
    pub monitored_ports: Vec<u16>,
    pub port_offset: u16,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    pub idle_timeout: Duration,
    /// Server-side tails older than this are forwarded unparsed.
    pub partial_flush: Duration,
    pub max_message_len: usize,
    pub requested_permissions: Vec<Permission>,
    pub auth_failure_mode: FailureMode,
    /// Block the client address after a violation-driven termination.
    pub auto_block: Option<Duration>,
    pub prevention: PreventionConfig,
    pub thresholds: Thresholds,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            listen_host: "0.0.0.0".to_string(),
            upstream_host: "127.0.0.1".to_string(),
            monitored_ports: vec![5900],
            port_offset: 1000,
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(1800),
            partial_flush: Duration::from_millis(50),
            max_message_len: DEFAULT_MAX_MESSAGE_LEN,
            requested_permissions: vec![Permission::ViewOnly, Permission::RemoteControl],
            auth_failure_mode: FailureMode::Closed,
            auto_block: Some(Duration::from_secs(60 * 60)),
            prevention: PreventionConfig::default(),
            thresholds: Thresholds::default(),
        }
    }
}

impl ProxySettings {
    /// Listening port for a monitored port, `None` on overflow.
    pub fn listen_port(&self, monitored: u16) -> Option<u16> {
        monitored.checked_add(self.port_offset)
    }
}
