//! relayd — udrop relay daemon.
//!
//! Bootstraps config, the filesystem store, every service in
//! `relay-services`, and the HTTP surface, then runs until SIGINT/SIGTERM.
//! Shutdown gives in-flight requests a 10s deadline to finish, then stops
//! the sweeper (§5).

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use relay_core::config::RelayConfig;
use relay_core::{NullScanner, SystemClock};
use relay_services::store::{FilesystemStore, Store};
use relay_services::{
    CapabilityService, QuotaTracker, RateLimiter, ScanEngine, SessionManager, SignalingService,
    Sweeper, ThrottleManager, TransferEngine,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    RelayConfig::write_default_if_missing().context("writing default config")?;
    let config = RelayConfig::load().context("loading configuration")?;

    tracing::info!(listen = %config.network.listen_addr, "relayd starting");

    let secret = CapabilityService::load_or_generate_secret(&config.data.secret_path)
        .context("loading capability secret")?;

    let store: Arc<dyn Store> =
        Arc::new(FilesystemStore::new(&config.data.data_dir).context("opening data directory")?);
    let clock: Arc<dyn relay_core::Clock> = Arc::new(SystemClock);
    let scanner: Arc<dyn relay_core::Scanner> = Arc::new(NullScanner);
    let metrics = Arc::new(relay_services::Metrics::new());

    let capabilities = Arc::new(CapabilityService::new(secret, clock.clone()));
    let quota = Arc::new(QuotaTracker::new(clock.clone()));
    let rate_limiter = Arc::new(RateLimiter::new(clock.clone()));
    let throttle = Arc::new(ThrottleManager::new(
        config.bandwidth.per_transfer_bps,
        config.bandwidth.global_bps,
    ));

    let sessions = Arc::new(SessionManager::new(
        store.clone(),
        capabilities.clone(),
        clock.clone(),
        chrono::Duration::seconds(config.ttl.claim_ttl_secs as i64),
    ));

    let transfers = Arc::new(TransferEngine::new(
        store.clone(),
        capabilities.clone(),
        quota.clone(),
        throttle,
        metrics.clone(),
        clock.clone(),
        chrono::Duration::seconds(config.ttl.transfer_ttl_secs as i64),
        chrono::Duration::seconds(config.ttl.download_token_ttl_secs as i64),
    ));

    let scans = Arc::new(ScanEngine::new(
        store.clone(),
        scanner,
        clock.clone(),
        metrics.clone(),
        chrono::Duration::seconds(config.scan.scan_session_ttl_secs as i64),
        config.scan.max_scan_bytes,
        Duration::from_secs(config.scan.max_scan_duration_secs),
    ));

    let signaling = Arc::new(SignalingService::new(
        store.clone(),
        quota.clone(),
        clock.clone(),
        config.rtc.stun_urls.clone(),
        config.rtc.turn_urls.first().cloned(),
        config
            .rtc
            .turn_shared_secret
            .clone()
            .map(|s| s.into_bytes()),
        chrono::Duration::seconds(config.rtc.turn_credential_ttl_secs as i64),
        config.quotas.relay_per_day.per_ip,
        config.quotas.relay_concurrent.per_ip,
    ));

    let sweeper = Arc::new(Sweeper::new(
        store,
        clock.clone(),
        metrics.clone(),
        Duration::from_secs(config.ttl.sweep_interval_secs),
    ));

    let state = relay_api::ApiState {
        sessions,
        transfers,
        scans,
        signaling,
        capabilities,
        quota,
        rate_limiter,
        metrics,
        clock,
        config: Arc::new(config.clone()),
        sweeper: sweeper.clone(),
    };

    let (sweeper_shutdown_tx, sweeper_shutdown_rx) = tokio::sync::watch::channel(false);
    let (api_shutdown_tx, mut api_shutdown_rx) = tokio::sync::watch::channel(false);

    let sweeper_task = {
        let sweeper = sweeper.clone();
        tokio::spawn(async move { sweeper.run(sweeper_shutdown_rx).await })
    };

    let listen_addr = config.network.listen_addr.clone();
    let api_shutdown = async move {
        let _ = api_shutdown_rx.changed().await;
    };
    let server_task = tokio::spawn(async move {
        relay_api::serve(state, &listen_addr, api_shutdown, Duration::from_secs(10)).await
    });

    wait_for_shutdown_signal().await;
    tracing::info!("shutdown signal received, draining");
    let _ = api_shutdown_tx.send(true);

    if let Err(err) = server_task.await {
        tracing::error!(error = %err, "API server task panicked");
    }

    let _ = sweeper_shutdown_tx.send(true);
    let _ = sweeper_task.await;

    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
