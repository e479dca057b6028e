//! Identity pool server
//!
//! Single-binary service that:
//! 1. Opens the file-backed identity store with field encryption
//! 2. Serves the public API (select identity, report status, health, metrics)
//! 3. Serves the admin API on a separate listener
//! 4. Runs proxy expiry and rate-limit reset on independent timers
//!
//! `--generate-key` reads a password from stdin, prints a derived encryption
//! key and exits.

mod admin;
mod api;
mod config;
mod error;
mod metrics;

use std::io::{BufRead, IsTerminal};
use std::sync::Arc;

use anyhow::{Context, Result};
use dialoguer::Password;
use field_crypto::FieldCipher;
use identity_pool::{
    Allocator, Clock, FileStore, IdentityStore, ProxyLifecycle, Scheduler, StatusReconciler,
    SystemClock,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::admin::AdminState;
use crate::api::AppState;
use crate::config::{Config, ScheduleConfig};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "--generate-key") {
        return generate_key();
    }

    info!("starting identity-pool-server");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle =
        metrics::install_recorder().context("failed to install Prometheus recorder")?;

    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.server.listen_addr,
        admin_addr = %config.server.admin_addr,
        store = %config.store.path.display(),
        scheduler_enabled = config.schedule.enabled,
        "configuration loaded"
    );

    let key = config
        .encryption
        .key
        .as_ref()
        .context("encryption key missing after config load")?;
    let codec =
        Arc::new(FieldCipher::from_base64_key(key.expose()).context("invalid encryption key")?);

    let store: Arc<dyn IdentityStore> = Arc::new(
        FileStore::open(config.store.path.clone(), codec)
            .await
            .with_context(|| format!("failed to open store {}", config.store.path.display()))?,
    );
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let allocator = Arc::new(Allocator::new(store.clone(), clock.clone()));

    let scheduler = Arc::new(
        build_scheduler(&config.schedule, store, clock).context("failed to register jobs")?,
    );
    if config.schedule.enabled {
        scheduler.start();
    } else {
        info!("scheduler disabled by configuration");
    }

    let app = api::build_router(
        AppState::new(allocator.clone(), prometheus_handle),
        config.server.max_connections,
    );
    let admin_app = admin::build_admin_router(AdminState::new(allocator, scheduler.clone()));

    let listener = TcpListener::bind(config.server.listen_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.server.listen_addr))?;
    let admin_listener = TcpListener::bind(config.server.admin_addr)
        .await
        .with_context(|| format!("failed to bind admin to {}", config.server.admin_addr))?;

    info!(
        addr = %config.server.listen_addr,
        admin_addr = %config.server.admin_addr,
        "accepting requests"
    );

    let shutdown = CancellationToken::new();
    let public_signal = shutdown.clone();
    let public_server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(public_signal.cancelled_owned())
            .await
    });
    let admin_signal = shutdown.clone();
    let admin_server = tokio::spawn(async move {
        axum::serve(admin_listener, admin_app)
            .with_graceful_shutdown(admin_signal.cancelled_owned())
            .await
    });

    shutdown_signal().await;

    // Stop accepting connections, then give jobs and in-flight requests the
    // same grace period
    shutdown.cancel();
    let grace = config.schedule.shutdown_grace();

    let drain = async {
        for (name, handle) in [("public", public_server), ("admin", admin_server)] {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(server = name, error = %e, "server error during shutdown"),
                Err(e) => error!(server = name, error = %e, "server task panicked"),
            }
        }
    };

    let (report, drained) = tokio::join!(
        scheduler.stop(grace),
        tokio::time::timeout(grace, drain)
    );

    if !report.aborted.is_empty() {
        warn!(aborted = ?report.aborted, "background jobs aborted at shutdown");
    }
    match drained {
        Ok(()) => info!("all in-flight requests drained"),
        Err(_) => warn!(
            drain_timeout_secs = grace.as_secs(),
            "drain timeout exceeded, forcing shutdown"
        ),
    }

    info!("shutdown complete");
    Ok(())
}

/// Register the expiry and reset jobs with their intervals.
fn build_scheduler(
    schedule: &ScheduleConfig,
    store: Arc<dyn IdentityStore>,
    clock: Arc<dyn Clock>,
) -> identity_pool::Result<Scheduler> {
    let mut scheduler = Scheduler::new();
    scheduler.add_job(
        Arc::new(ProxyLifecycle::new(store.clone(), clock.clone())),
        schedule.expire_interval(),
    )?;
    scheduler.add_job(
        Arc::new(StatusReconciler::new(store, clock, schedule.cooldown())),
        schedule.reconcile_interval(),
    )?;
    Ok(scheduler)
}

/// Read a password and print a derived key.
///
/// On a terminal the password is read without echo. Piped input is read as
/// a single line so the mode can be scripted.
fn generate_key() -> Result<()> {
    let password = if std::io::stdin().is_terminal() {
        Password::new()
            .with_prompt("Password (input hidden)")
            .interact()
            .context("failed to read password")?
    } else {
        let mut line = String::new();
        std::io::stdin()
            .lock()
            .read_line(&mut line)
            .context("failed to read password from stdin")?;
        line.trim_end_matches(['\r', '\n']).to_string()
    };

    let key = field_crypto::derive_key(&password).context("failed to derive key")?;
    println!("{key}");
    Ok(())
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, Utc};
    use identity_pool::{HealthStatus, NewIdentity, NewProxy, RunOutcome};

    #[tokio::test]
    async fn scheduler_registers_both_jobs() {
        let codec =
            Arc::new(FieldCipher::from_base64_key(&field_crypto::generate_key()).unwrap());
        let store: Arc<dyn IdentityStore> = Arc::new(FileStore::in_memory(codec));
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let scheduler =
            build_scheduler(&ScheduleConfig::default(), store.clone(), clock).unwrap();
        assert_eq!(
            scheduler.job_names(),
            vec!["expire_proxies".to_string(), "reset_rate_limited".to_string()]
        );

        let proxy = store
            .create_proxy(NewProxy {
                url: None,
                expire_at: Some(Utc::now() + TimeDelta::days(1)),
            })
            .await
            .unwrap();
        let ua = store.create_user_agent("UA".into()).await.unwrap();
        store
            .create_identity(
                NewIdentity {
                    proxy_id: proxy.id,
                    user_agent_id: ua.id,
                    status: HealthStatus::RateLimited,
                },
                Utc::now() - TimeDelta::minutes(5),
            )
            .await
            .unwrap();

        assert_eq!(
            scheduler.run_now("reset_rate_limited").await.unwrap(),
            RunOutcome::Completed { count: 1 }
        );
        assert_eq!(
            scheduler.run_now("expire_proxies").await.unwrap(),
            RunOutcome::Completed { count: 0 }
        );
    }
}
