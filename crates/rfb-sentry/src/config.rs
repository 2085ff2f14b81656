use std::collections::HashSet;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{ensure, Context};
use rfb_proxy::{FailureMode, Permission, PreventionConfig, ProxySettings, Thresholds};
use serde::Deserialize;
use tracing::warn;

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub prevention: PreventionConfig,
    #[serde(default)]
    pub thresholds: ThresholdConfig,
    #[serde(default)]
    pub authorization: AuthorizationConfig,
    #[serde(default)]
    pub net: NetConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default = "default_policy_file")]
    pub policy_file: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            proxy: ProxyConfig::default(),
            prevention: PreventionConfig::default(),
            thresholds: ThresholdConfig::default(),
            authorization: AuthorizationConfig::default(),
            net: NetConfig::default(),
            logging: LoggingConfig::default(),
            policy_file: default_policy_file(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_listen_host")]
    pub listen_host: String,
    #[serde(default = "default_upstream_host")]
    pub upstream_host: String,
    #[serde(default = "default_monitored_ports")]
    pub monitored_ports: Vec<u16>,
    #[serde(default = "default_port_offset")]
    pub port_offset: u16,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_partial_flush")]
    pub partial_flush_ms: u64,
    #[serde(default = "default_max_message_len")]
    pub max_message_len: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_host: default_listen_host(),
            upstream_host: default_upstream_host(),
            monitored_ports: default_monitored_ports(),
            port_offset: default_port_offset(),
            connect_timeout_secs: default_connect_timeout(),
            handshake_timeout_secs: default_handshake_timeout(),
            idle_timeout_secs: default_idle_timeout(),
            partial_flush_ms: default_partial_flush(),
            max_message_len: default_max_message_len(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ThresholdConfig {
    #[serde(default = "default_credential_key_events")]
    pub credential_key_events: u64,
    #[serde(default = "default_credential_window")]
    pub credential_window_secs: u64,
    #[serde(default = "default_transfer_rate")]
    pub transfer_rate_bytes_per_sec: u64,
    #[serde(default = "default_screenshots_per_min")]
    pub screenshots_per_min: u64,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            credential_key_events: default_credential_key_events(),
            credential_window_secs: default_credential_window(),
            transfer_rate_bytes_per_sec: default_transfer_rate(),
            screenshots_per_min: default_screenshots_per_min(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct AuthorizationConfig {
    #[serde(default)]
    pub failure_mode: FailureMode,
    #[serde(default = "default_permissions")]
    pub requested_permissions: Vec<Permission>,
}

impl Default for AuthorizationConfig {
    fn default() -> Self {
        Self {
            failure_mode: FailureMode::default(),
            requested_permissions: default_permissions(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct NetConfig {
    /// Addresses refused at accept time, permanently.
    #[serde(default)]
    pub blocklist: Vec<String>,
    /// Addresses reported to threat intelligence when they connect.
    #[serde(default)]
    pub suspicious: Vec<String>,
    /// Block duration after a violation; 0 disables auto-blocking.
    #[serde(default = "default_auto_block_minutes")]
    pub auto_block_minutes: u64,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            blocklist: Vec::new(),
            suspicious: Vec::new(),
            auto_block_minutes: default_auto_block_minutes(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_audit_path")]
    pub audit_log_path: PathBuf,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            audit_log_path: default_audit_path(),
        }
    }
}

// ---------------------------------------------------------------------------
// Default-value functions used by serde
// ---------------------------------------------------------------------------

fn default_policy_file() -> PathBuf {
    PathBuf::from("policy.yaml")
}

fn default_listen_host() -> String {
    "0.0.0.0".to_string()
}

fn default_upstream_host() -> String {
    "127.0.0.1".to_string()
}

fn default_monitored_ports() -> Vec<u16> {
    vec![5900]
}

fn default_port_offset() -> u16 {
    1000
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_handshake_timeout() -> u64 {
    30
}

fn default_idle_timeout() -> u64 {
    1800
}

fn default_partial_flush() -> u64 {
    50
}

fn default_max_message_len() -> usize {
    rfb_proxy::DEFAULT_MAX_MESSAGE_LEN
}

fn default_credential_key_events() -> u64 {
    100
}

fn default_credential_window() -> u64 {
    300
}

fn default_transfer_rate() -> u64 {
    10 * 1024 * 1024
}

fn default_screenshots_per_min() -> u64 {
    60
}

fn default_permissions() -> Vec<Permission> {
    vec![Permission::ViewOnly, Permission::RemoteControl]
}

fn default_auto_block_minutes() -> u64 {
    60
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_audit_path() -> PathBuf {
    PathBuf::from("audit.jsonl")
}

// ---------------------------------------------------------------------------
// Conversion
// ---------------------------------------------------------------------------

impl Config {
    /// Map the file configuration onto the proxy core's settings.
    pub fn proxy_settings(&self) -> anyhow::Result<ProxySettings> {
        let p = &self.proxy;
        ensure!(!p.monitored_ports.is_empty(), "proxy.monitored_ports is empty");
        ensure!(p.idle_timeout_secs > 0, "proxy.idle_timeout_secs must be positive");
        ensure!(p.max_message_len > 0, "proxy.max_message_len must be positive");

        let auto_block = match self.net.auto_block_minutes {
            0 => None,
            minutes => Some(Duration::from_secs(minutes * 60)),
        };

        Ok(ProxySettings {
            listen_host: p.listen_host.clone(),
            upstream_host: p.upstream_host.clone(),
            monitored_ports: p.monitored_ports.clone(),
            port_offset: p.port_offset,
            connect_timeout: Duration::from_secs(p.connect_timeout_secs),
            handshake_timeout: Duration::from_secs(p.handshake_timeout_secs),
            idle_timeout: Duration::from_secs(p.idle_timeout_secs),
            partial_flush: Duration::from_millis(p.partial_flush_ms),
            max_message_len: p.max_message_len,
            requested_permissions: self.authorization.requested_permissions.clone(),
            auth_failure_mode: self.authorization.failure_mode,
            auto_block,
            prevention: self.prevention,
            thresholds: Thresholds {
                credential_key_events: self.thresholds.credential_key_events,
                credential_window: Duration::from_secs(self.thresholds.credential_window_secs),
                transfer_rate_bytes_per_sec: self.thresholds.transfer_rate_bytes_per_sec,
                screenshots_per_min: self.thresholds.screenshots_per_min,
            },
        })
    }

    pub fn blocklist(&self) -> anyhow::Result<HashSet<IpAddr>> {
        net_guard::parse_addresses(&self.net.blocklist).context("invalid net.blocklist entry")
    }

    pub fn suspicious(&self) -> anyhow::Result<HashSet<IpAddr>> {
        net_guard::parse_addresses(&self.net.suspicious).context("invalid net.suspicious entry")
    }
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load configuration from a YAML file.
///
/// A missing file yields the default configuration and a warning.
pub fn load(path: &Path) -> anyhow::Result<Config> {
    if !path.exists() {
        warn!(
            path = %path.display(),
            "configuration file not found; using defaults"
        );
        return Ok(Config::default());
    }

    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;

    serde_yml::from_str(&contents)
        .with_context(|| format!("failed to parse config file {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = load(&dir.path().join("absent.yaml")).unwrap();
        let settings = cfg.proxy_settings().unwrap();
        assert_eq!(settings.monitored_ports, vec![5900]);
        assert_eq!(settings.port_offset, 1000);
        assert_eq!(settings.auth_failure_mode, FailureMode::Closed);
        assert_eq!(settings.auto_block, Some(Duration::from_secs(3600)));
        assert_eq!(settings.thresholds, Thresholds::default());
    }

    #[test]
    fn yaml_sections_map_onto_settings() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
proxy:
  upstream_host: 10.0.0.2
  monitored_ports: [5900, 5901]
  port_offset: 100
  idle_timeout_secs: 60
prevention:
  block_clipboard: true
thresholds:
  credential_key_events: 50
authorization:
  failure_mode: open
  requested_permissions: [view_only]
net:
  blocklist: ["198.51.100.7"]
  suspicious: ["203.0.113.0"]
  auto_block_minutes: 0
logging:
  level: debug
policy_file: /etc/rfb-sentry/policy.yaml
"#
        )
        .unwrap();

        let cfg = load(file.path()).unwrap();
        let s = cfg.proxy_settings().unwrap();
        assert_eq!(s.upstream_host, "10.0.0.2");
        assert_eq!(s.monitored_ports, vec![5900, 5901]);
        assert_eq!(s.listen_port(5901), Some(6001));
        assert_eq!(s.idle_timeout, Duration::from_secs(60));
        assert!(s.prevention.block_clipboard);
        assert!(!s.prevention.block_key_event);
        assert_eq!(s.thresholds.credential_key_events, 50);
        assert_eq!(s.auth_failure_mode, FailureMode::Open);
        assert_eq!(s.requested_permissions, vec![Permission::ViewOnly]);
        assert_eq!(s.auto_block, None);
        assert_eq!(cfg.logging.level, "debug");
        assert_eq!(cfg.policy_file, PathBuf::from("/etc/rfb-sentry/policy.yaml"));
        assert!(cfg.blocklist().unwrap().contains(&"198.51.100.7".parse::<IpAddr>().unwrap()));
        assert_eq!(cfg.suspicious().unwrap().len(), 1);
    }

    #[test]
    fn bad_address_is_rejected() {
        let cfg = Config {
            net: NetConfig {
                blocklist: vec!["not-an-ip".to_string()],
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(cfg.blocklist().is_err());
    }

    #[test]
    fn empty_port_list_is_rejected() {
        let cfg = Config {
            proxy: ProxyConfig {
                monitored_ports: Vec::new(),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(cfg.proxy_settings().is_err());
    }
}
