mod cli;
mod collaborators;
mod config;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use audit_log::{AuditEntry, AuditEventType, AuditSink, AuditSource};
use content_scanner::Scanner;
use net_guard::Blocklist;
use policy_engine::PolicyEngine;
use rfb_proxy::{ChannelBroadcaster, Collaborators, Proxy, SessionEvent};

use crate::cli::Cli;
use crate::collaborators::{AuditLogService, AuditThreatIntel, LocalProvenance, PolicyAuthorizer};

const COMPONENT: &str = "rfb-sentry";

/// Capacity of the session lifecycle channel.
const LIFECYCLE_CAPACITY: usize = 256;

/// How often expired blocklist entries are purged.
const BLOCKLIST_PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// How long to wait for the audit writer to drain on exit.
const AUDIT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Parse CLI args.
    let cli = Cli::parse();

    // 2. Load config, then merge CLI overrides.
    let mut cfg = config::load(&cli.config)?;

    if let Some(ref policy) = cli.policy {
        cfg.policy_file = policy.clone();
    }
    if let Some(ref host) = cli.upstream_host {
        cfg.proxy.upstream_host = host.clone();
    }
    if !cli.ports.is_empty() {
        cfg.proxy.monitored_ports = cli.ports.clone();
    }
    if let Some(offset) = cli.offset {
        cfg.proxy.port_offset = offset;
    }

    // 3. Init tracing-subscriber with JSON format.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.logging.level));

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let settings = cfg.proxy_settings().context("invalid proxy configuration")?;

    info!(
        config_file = %cli.config.display(),
        policy_file = %cfg.policy_file.display(),
        upstream_host = %settings.upstream_host,
        ports = ?settings.monitored_ports,
        offset = settings.port_offset,
        "rfb-sentry starting"
    );

    // 4. Start audit logger.
    let (audit, audit_handle) = AuditSink::start(&cfg.logging.audit_log_path)
        .await
        .context("failed to start audit logger")?;

    audit
        .log(AuditEntry::new(
            AuditEventType::ProcessStarted,
            AuditSource::new(COMPONENT),
            serde_json::json!({
                "version": env!("CARGO_PKG_VERSION"),
                "config_file": cli.config.display().to_string(),
                "monitored_ports": settings.monitored_ports,
                "port_offset": settings.port_offset,
            }),
        ))
        .await;

    // 5. Load access policy.
    let engine = if cfg.policy_file.exists() {
        let policy = policy_engine::loader::load_policy(&cfg.policy_file)
            .context("failed to load policy file")?;
        PolicyEngine::new(policy).context("failed to initialize policy engine")?
    } else {
        warn!(
            policy_file = %cfg.policy_file.display(),
            "policy file not found; every message is allowed"
        );
        PolicyEngine::allow_all()
    };
    let engine = Arc::new(engine);

    info!(
        policy_file = %cfg.policy_file.display(),
        rules = engine.rule_count(),
        grants = engine.config().grants.len(),
        "policy engine loaded"
    );

    audit
        .log(AuditEntry::new(
            AuditEventType::PolicyLoaded,
            AuditSource::new(COMPONENT),
            serde_json::json!({
                "policy_file": cfg.policy_file.display().to_string(),
                "rules": engine.rule_count(),
                "default_action": engine.config().default_action,
            }),
        ))
        .await;

    // 6. Content scanner and address lists.
    let scanner = Arc::new(Scanner::new().context("failed to compile content patterns")?);
    let blocklist = Arc::new(Blocklist::with_permanent(cfg.blocklist()?));
    let suspicious = cfg.suspicious()?;

    info!(
        patterns = scanner.pattern_count(),
        blocked = blocklist.len(),
        suspicious = suspicious.len(),
        "detection configured"
    );

    // 7. Collaborators.
    let broadcaster = Arc::new(ChannelBroadcaster::new(LIFECYCLE_CAPACITY));
    tokio::spawn(log_lifecycle(broadcaster.subscribe()));

    let collaborators = Collaborators {
        authorization: Arc::new(PolicyAuthorizer::new(Arc::clone(&engine))),
        audit: Arc::new(AuditLogService::new(audit.clone())),
        threat_intel: Arc::new(AuditThreatIntel::new(audit.clone())),
        provenance: Arc::new(LocalProvenance::new()),
        broadcaster,
    };

    // 8. Shutdown signal (ctrl_c + SIGTERM).
    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    // 9. Background blocklist maintenance.
    tokio::spawn({
        let blocklist = Arc::clone(&blocklist);
        let shutdown = shutdown.clone();
        async move {
            let mut ticker = tokio::time::interval(BLOCKLIST_PURGE_INTERVAL);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let purged = blocklist.purge_expired();
                        if purged > 0 {
                            info!(purged, "expired blocklist entries removed");
                        }
                    }
                }
            }
        }
    });

    // 10. Run the proxy until shutdown.
    let proxy = Proxy::new(settings, collaborators, scanner, blocklist, suspicious);
    let proxy_result = proxy.run(shutdown.clone()).await;
    shutdown.cancel();

    // 11. Log shutdown.
    info!("rfb-sentry shutting down");

    audit
        .log(AuditEntry::new(
            AuditEventType::ProcessStopped,
            AuditSource::new(COMPONENT),
            serde_json::json!({
                "proxy_result": format!("{:?}", proxy_result),
            }),
        ))
        .await;

    let dropped = audit.dropped();
    if dropped > 0 {
        warn!(dropped, "audit entries were dropped while the log was saturated");
    }

    drop(proxy);
    drop(audit);
    if tokio::time::timeout(AUDIT_DRAIN_TIMEOUT, audit_handle)
        .await
        .is_err()
    {
        warn!("audit writer did not drain in time");
    }

    proxy_result.context("proxy failed")?;
    Ok(())
}

/// Cancel `shutdown` on SIGINT or SIGTERM.
async fn wait_for_signal(shutdown: CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("received SIGINT (ctrl-c)"),
                    _ = sigterm.recv() => info!("received SIGTERM"),
                }
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler; only ctrl-c stops the proxy");
                if ctrl_c.await.is_ok() {
                    info!("received SIGINT (ctrl-c)");
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        if ctrl_c.await.is_ok() {
            info!("received SIGINT (ctrl-c)");
        }
    }

    shutdown.cancel();
}

/// Log every session lifecycle event.
async fn log_lifecycle(mut rx: broadcast::Receiver<SessionEvent>) {
    loop {
        match rx.recv().await {
            Ok(SessionEvent::SessionStarted { id, client_addr, .. }) => {
                info!(session_id = %id, %client_addr, "lifecycle: session started");
            }
            Ok(SessionEvent::SessionTerminated { id, reason, .. }) => {
                info!(session_id = %id, %reason, "lifecycle: session terminated");
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "lifecycle subscriber lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
