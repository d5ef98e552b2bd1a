//! pingwarden -- unattended reachability and latency monitor.
//!
//! Probes a fixed set of targets on a tick, turns a rolling window of
//! results into feature vectors, scores them with per-target models (or
//! static thresholds), and raises debounced alerts through a notification
//! gateway. Every tick's outcome is persisted for offline retraining.

pub mod alerts;
pub mod analysis;
pub mod api;
pub mod config;
pub mod detect;
pub mod probes;
pub mod scheduler;
pub mod storage;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use crate::alerts::AlertDispatcher;
use crate::analysis::ModelStore;
use crate::config::MonitorConfig;
use crate::detect::AnomalyDetector;
use crate::probes::Prober;
use crate::scheduler::{Components, Monitor};
use crate::storage::RecordWriter;

/// How long shutdown waits for the record writer to drain.
const WRITER_DRAIN: Duration = Duration::from_secs(10);

/// Start the monitor daemon: storage, model store, scheduler loop and the
/// optional status API. Returns after Ctrl-C once the writer has drained.
pub async fn serve(config: MonitorConfig) -> Result<()> {
    config.validate()?;

    // 1. Storage
    let db_path = &config.storage.db_path;
    tracing::info!(db = %db_path.display(), "Initializing database");
    let pool = storage::open_pool(db_path)?;
    let first_tick = storage::last_tick(&pool)?.map_or(0, |t| t + 1);
    let (writer, writer_thread) = RecordWriter::spawn(&config.storage)?;

    // 2. Models
    let models = Arc::new(ModelStore::new(&config.models.dir));
    let targets = config.targets();

    // 3. Alerting
    let dispatcher = Arc::new(AlertDispatcher::from_config(&config.alerts)?);
    if !dispatcher.is_active() {
        tracing::info!("alert delivery disabled, events will be recorded as suppressed");
    }

    let monitor = Arc::new(Monitor::new(
        &config,
        Components {
            prober: Prober::system(),
            detector: AnomalyDetector::new(models.clone()),
            writer,
            dispatcher: dispatcher.clone(),
        },
        first_tick,
    ));
    tracing::info!(targets = targets.len(), first_tick, "monitor ready");

    let cancel = CancellationToken::new();

    // 4. Model reload task
    let reload = spawn_model_reload(
        models,
        Duration::from_secs(config.models.reload_interval_secs.max(1)),
        cancel.clone(),
    );

    // 5. API Server
    let api = match &config.api.bind {
        Some(bind) => {
            let addr: std::net::SocketAddr = bind
                .parse()
                .with_context(|| format!("invalid api.bind address '{}'", bind))?;
            let app = api::router(api::state::AppState {
                pool: pool.clone(),
                monitor: monitor.clone(),
            });
            let listener = tokio::net::TcpListener::bind(addr)
                .await
                .with_context(|| format!("failed to bind {}", addr))?;
            tracing::info!(%addr, "status API listening");
            let shutdown = cancel.clone();
            Some(tokio::spawn(async move {
                let result = axum::serve(listener, app)
                    .with_graceful_shutdown(async move { shutdown.cancelled().await })
                    .await;
                if let Err(e) = result {
                    tracing::error!(error = %e, "status API stopped");
                }
            }))
        }
        None => None,
    };

    // 6. Ctrl-C
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("shutdown requested"),
            Err(e) => tracing::error!(error = %e, "failed to listen for ctrl-c, shutting down"),
        }
        on_signal.cancel();
    });

    let names: Vec<String> = targets.iter().map(|t| t.id.clone()).collect();
    dispatcher
        .announce(&format!(
            "🚀 *pingwarden started*\nMonitoring: {}",
            alerts::gateway::code_span(&names.join(", "))
        ))
        .await;

    // 7. Scheduler
    scheduler::run_monitor_loop(monitor.clone(), config.tick_interval(), cancel.clone()).await;

    dispatcher.announce("👋 *pingwarden stopped*").await;

    if let Some(api) = api {
        let _ = api.await;
    }
    let _ = reload.await;

    // Dropping the last handles closes the writer queue.
    drop(monitor);
    let drained = tokio::time::timeout(
        WRITER_DRAIN,
        tokio::task::spawn_blocking(move || writer_thread.join()),
    )
    .await;
    match drained {
        Ok(Ok(Ok(()))) => tracing::info!("shutdown complete"),
        Ok(_) => tracing::error!("record writer thread panicked"),
        Err(_) => tracing::warn!("record writer still busy at shutdown"),
    }

    Ok(())
}

fn spawn_model_reload(
    models: Arc<ModelStore>,
    every: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    let store = models.clone();
                    match tokio::task::spawn_blocking(move || store.refresh()).await {
                        Ok(0) => {}
                        Ok(changed) => tracing::info!(changed, "model store refreshed"),
                        Err(e) => tracing::error!(error = %e, "model refresh task failed"),
                    }
                }
            }
        }
    })
}
