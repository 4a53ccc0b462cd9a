// =============================================================================
// Candle Ingest — Main Entry Point
// =============================================================================
//
// Builds one adapter per configured broker, probes each upstream, then hands
// the watchlist to the ingestion coordinator: an initial backfill per series
// followed by periodic incremental refreshes until Ctrl+C.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod broker;
mod errors;
mod ingestion;
mod market_data;
mod runtime_config;
mod types;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::broker::{BinanceAdapter, BrokerAdapter, OandaAdapter};
use crate::errors::SubmitError;
use crate::ingestion::job::{JobKind, JobStatus};
use crate::ingestion::{CandleIngestionService, IngestionCoordinator};
use crate::market_data::{MemoryCandleStore, SessionFilter};
use crate::runtime_config::RuntimeConfig;

const DEFAULT_CONFIG_PATH: &str = "ingest_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Candle Ingest — Starting Up                       ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config_path =
        std::env::var("INGEST_CONFIG_PATH").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());

    let mut config = RuntimeConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        RuntimeConfig::default()
    });
    config.apply_env_overrides()?;

    // ── 2. Broker adapters ───────────────────────────────────────────────
    let mut adapters: Vec<Arc<dyn BrokerAdapter>> = Vec::new();

    let oanda_token = std::env::var("OANDA_API_TOKEN")
        .ok()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty());
    match oanda_token {
        Some(token) if config.brokers.oanda.enabled => {
            let adapter = OandaAdapter::new(
                token,
                config.brokers.oanda.environment,
                config.brokers.oanda.requests_per_minute,
            )?;
            adapters.push(Arc::new(adapter));
        }
        Some(_) => info!("OANDA disabled in config"),
        None => info!("OANDA_API_TOKEN not set — OANDA adapter disabled"),
    }

    if config.brokers.binance.enabled {
        adapters.push(Arc::new(BinanceAdapter::new(
            config.brokers.binance.requests_per_minute,
        )?));
    }

    if adapters.is_empty() {
        anyhow::bail!("no broker adapters enabled — nothing to ingest");
    }

    // Series on a broker that is not running here would be rejected on
    // every tick; drop them once.
    let registered: HashSet<String> = adapters
        .iter()
        .map(|a| a.broker_name().to_ascii_uppercase())
        .collect();
    let (watchlist, skipped): (Vec<_>, Vec<_>) = config
        .watchlist
        .iter()
        .cloned()
        .partition(|entry| registered.contains(&entry.broker.trim().to_ascii_uppercase()));
    for entry in &skipped {
        warn!(broker = %entry.broker, pair = %entry.pair, "Watchlist entry skipped — broker not enabled");
    }

    // ── 3. Probe upstreams ───────────────────────────────────────────────
    for adapter in &adapters {
        if adapter.validate_connection().await {
            info!(broker = adapter.broker_name(), "Broker connection OK");
        } else {
            warn!(
                broker = adapter.broker_name(),
                "Broker connection check failed — jobs will retry"
            );
        }
    }

    // ── 4. Store, session filter, services, coordinator ──────────────────
    let store = Arc::new(MemoryCandleStore::new());
    let session_filter = Arc::new(
        SessionFilter::from_config(&config.session).context("invalid session config")?,
    );

    let services: Vec<Arc<CandleIngestionService>> = adapters
        .iter()
        .map(|adapter| {
            Arc::new(CandleIngestionService::new(
                adapter.clone(),
                store.clone(),
                session_filter.clone(),
            ))
        })
        .collect();

    let coordinator = Arc::new(IngestionCoordinator::start(
        config.coordinator.clone(),
        services,
    ));

    // ── 5. Initial backfills ─────────────────────────────────────────────
    let scheduling = config.scheduling.clone();
    if scheduling.initial_backfill_days > 0 {
        let to = Utc::now();
        let from = to - chrono::Duration::days(scheduling.initial_backfill_days);
        for entry in &watchlist {
            match coordinator.submit_backfill_job(
                entry.ingestion_config(),
                from,
                to,
                scheduling.backfill_priority,
            ) {
                Ok(id) => info!(job_id = %id, broker = %entry.broker, pair = %entry.pair, "Initial backfill submitted"),
                Err(e) => warn!(broker = %entry.broker, pair = %entry.pair, error = %e, "Initial backfill rejected"),
            }
        }
    }

    // ── 6. Incremental refresh loop ──────────────────────────────────────
    let inc_coordinator = coordinator.clone();
    let inc_watchlist = watchlist.clone();
    let inc_every = Duration::from_secs(scheduling.incremental_interval_secs.max(1));
    let inc_priority = scheduling.incremental_priority;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(inc_every);
        interval.tick().await;
        loop {
            interval.tick().await;

            // A refresh still waiting from an earlier tick is superseded by
            // this one. Rate-limited ones keep their place.
            let waiting: Vec<_> = inc_coordinator
                .list_jobs()
                .into_iter()
                .filter(|j| {
                    j.kind == JobKind::Incremental
                        && j.status == JobStatus::Queued
                        && j.not_before.is_none()
                })
                .collect();

            for entry in &inc_watchlist {
                let ingestion = entry.ingestion_config();
                for stale in waiting.iter().filter(|j| j.config == ingestion) {
                    if inc_coordinator.cancel_job(stale.id) {
                        info!(job_id = %stale.id, pair = %entry.pair, "Superseded incremental job cancelled");
                    }
                }
                match inc_coordinator.submit_incremental_job(ingestion, inc_priority) {
                    Ok(_) => {}
                    Err(SubmitError::ShuttingDown) => return,
                    Err(e) => warn!(broker = %entry.broker, pair = %entry.pair, error = %e, "Incremental job rejected"),
                }
            }
        }
    });

    // ── 7. Statistics loop ───────────────────────────────────────────────
    let stats_coordinator = coordinator.clone();
    let stats_store = store.clone();
    let stats_adapters = adapters.clone();
    let stats_filter = session_filter.clone();
    let stats_every = Duration::from_secs(scheduling.stats_interval_secs.max(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(stats_every);
        loop {
            interval.tick().await;
            if !stats_coordinator.is_accepting() {
                break;
            }
            let stats = stats_coordinator.get_performance_statistics();
            info!(
                active = stats.active_jobs,
                queued = stats.queued_jobs,
                running = stats.running_jobs,
                completed = stats.completed_jobs,
                failed = stats.failed_jobs,
                timed_out = stats.timed_out_jobs,
                deferrals = stats.rate_limit_deferrals,
                avg_ms = format!("{:.0}", stats.avg_processing_time_ms),
                success_rate = format!("{:.2}", stats.success_rate),
                memory_bytes = ?stats.memory_usage,
                candles_stored = stats_store.total_count(),
                session = stats_filter.session_at(Utc::now()).unwrap_or("closed"),
                "Ingestion statistics"
            );
            for adapter in &stats_adapters {
                if let Some(window) = adapter.request_window() {
                    info!(
                        broker = %window.broker,
                        used = window.used,
                        limit = window.limit,
                        resets_in_ms = window.resets_in_ms,
                        "Request window"
                    );
                }
            }
        }
    });

    info!(
        brokers = adapters.len(),
        watchlist = watchlist.len(),
        "All subsystems running. Press Ctrl+C to stop."
    );

    // ── 8. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    coordinator.graceful_shutdown().await;

    if let Err(e) = config.save(&config_path) {
        error!(error = %e, "Failed to save runtime config on shutdown");
    }

    info!("Candle Ingest shut down complete.");
    Ok(())
}
