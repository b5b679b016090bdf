//! llm-cache-tier server binary.
//!
//! Wires the tiers, archival worker and controller together and serves the
//! HTTP API until Ctrl-C.

use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use llm_cache_tier::cache::controller::{CacheController, Tiers};
use llm_cache_tier::cache::metrics::CacheMetrics;
use llm_cache_tier::config::{Cli, Config};
use llm_cache_tier::server::{build_router, AppState};
use llm_cache_tier::tier::archive::ArchiveTier;
use llm_cache_tier::tier::hot::HotTier;
use llm_cache_tier::tier::warm::WarmTier;
use llm_cache_tier::tier::TierBackend;
use llm_cache_tier::upstream::EchoUpstream;
use llm_cache_tier::worker::ArchivalWorker;

fn init_tracing(cli: &Cli) {
    let filter = if cli.verbose {
        "llm_cache_tier=debug,tower_http=debug"
    } else {
        "llm_cache_tier=info,tower_http=info"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| filter.into());

    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}

async fn shutdown_signal(mut stop: watch::Receiver<bool>) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!("Failed to listen for Ctrl-C: {e}");
            }
        }
        _ = stop.changed() => {}
    }
    info!("Shutdown requested");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);

    info!("llm-cache-tier v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration; CLI flags and the environment win over the file.
    let mut config = Config::load(&cli.config)?;
    config.apply_env_overrides();
    if cli.disable_offload {
        config.controller.disable_offload = true;
    }
    if let Some(listen) = &cli.listen {
        config.server.listen = listen.clone();
    }
    config.validate()?;
    let config = Arc::new(config);

    info!(
        base_ttl = config.heuristics.base_ttl,
        min_ttl = config.heuristics.min_ttl,
        max_ttl = config.heuristics.max_ttl,
        alpha = config.heuristics.alpha,
        hot_threshold = config.heuristics.hot_threshold,
        recent_seconds = config.heuristics.recent_seconds,
        ttl_mode = ?config.heuristics.ttl_mode,
        disable_offload = config.controller.disable_offload,
        "Configuration loaded"
    );

    // Tiers.
    let hot = Arc::new(HotTier::new(config.tiers.hot_capacity));
    let warm: Arc<dyn TierBackend> = Arc::new(WarmTier::open(&config.tiers.warm_path).await?);
    let archive: Option<Arc<dyn TierBackend>> = if config.archive.enabled {
        Some(Arc::new(ArchiveTier::open_local(&config.archive).await?))
    } else {
        info!("Archive tier disabled");
        None
    };
    info!(
        hot_capacity = config.tiers.hot_capacity,
        warm_path = %config.tiers.warm_path.display(),
        archive_root = %config.archive.local_root.display(),
        archive_enabled = archive.is_some(),
        "Tiers ready"
    );

    let metrics = Arc::new(CacheMetrics::new()?);
    let mut controller = CacheController::new(
        &config,
        Tiers {
            hot,
            warm: warm.clone(),
            archive: archive.clone(),
        },
        metrics.clone(),
    );

    // The archival worker only runs when there is somewhere to archive to.
    let worker_handle = match &archive {
        Some(archive) => {
            let worker = Arc::new(ArchivalWorker::new(&config, warm, archive.clone(), metrics));
            controller = controller.with_worker(worker.clone());
            Some(worker.start())
        }
        None => None,
    };
    let controller = Arc::new(controller);

    // Periodic sweep of expired hot and warm entries.
    let (stop_tx, stop_rx) = watch::channel(false);
    let sweeper = {
        let controller = controller.clone();
        let mut stop = stop_rx.clone();
        let interval = Duration::from_secs(config.tiers.hot_sweep_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = controller.sweep().await;
                        if removed > 0 {
                            debug!(removed, "Expired entries swept");
                        }
                    }
                    _ = stop.changed() => break,
                }
            }
        })
    };

    let state = Arc::new(AppState {
        controller: controller.clone(),
        upstream: Arc::new(EchoUpstream::new()),
        config: config.clone(),
        start_time: Instant::now(),
    });
    let app = build_router(state);

    let listen_addr = config.server.listen.clone();
    let listener = TcpListener::bind(&listen_addr).await?;
    info!("Listening on {listen_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(stop_rx))
        .await?;

    let _ = stop_tx.send(true);
    if let Err(e) = sweeper.await {
        warn!("Sweeper task ended abnormally: {e}");
    }
    if let Some(handle) = worker_handle {
        handle.stop().await;
    }

    let stats = controller.stats();
    info!(
        hit_rate = stats.metrics.hit_rate,
        upstream_calls = stats.metrics.upstream_calls,
        "Shut down cleanly"
    );
    Ok(())
}
