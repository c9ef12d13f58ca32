//! Supervisor: lifecycle, refresh cadence, dispatch loop, shutdown.
//!
//! One loop drives everything. At most once per wall-clock minute it
//! re-reads the config (applying severity changes through the tracing
//! reload handle) and refreshes the roster per kind; every iteration it
//! ticks the scheduler and hands due slots to the bounded worker pool. An
//! idle iteration sleeps 50 ms.
//!
//! Meter-level faults never end the process. Fatal are only a bad config,
//! a sink that cannot be opened, and a roster source that is down with no
//! cache to fall back on.

use chrono::Duration as TimeDelta;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{self, ConfigError, PollerConfig, SinkProvider};
use crate::roster::{RosterError, RosterStore};
use crate::scheduler::Scheduler;
use crate::sink::{BufferSink, PgSink, RecordSink, SinkError};
use crate::worker::{self, WorkerContext};
use meter_core::DataKind;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum FatalError {
    #[error("config: {0}")]
    Config(#[from] ConfigError),
    #[error("roster: {0}")]
    Roster(#[from] RosterError),
    #[error("sink: {0}")]
    Sink(#[from] SinkError),
}

/// Handle for applying a new severity to the live subscriber.
pub type SeverityReload =
    tracing_subscriber::reload::Handle<EnvFilter, tracing_subscriber::Registry>;

pub struct Supervisor {
    config_path: PathBuf,
    config: PollerConfig,
    reload: Option<SeverityReload>,
}

impl Supervisor {
    pub fn new(
        config_path: &Path,
        config: PollerConfig,
        reload: Option<SeverityReload>,
    ) -> Supervisor {
        Supervisor {
            config_path: config_path.to_owned(),
            config,
            reload,
        }
    }

    /// Run until shutdown is signalled (ctrl-c) or a fatal fault.
    pub async fn run(mut self) -> Result<(), FatalError> {
        let cfg = self.config.clone();

        let roster = Arc::new(RosterStore::connect(&cfg.db, &cfg.default.cache_dir).await);
        let sink = Arc::new(build_sink(&cfg).await?);
        info!(
            kinds = ?cfg.default.data_ids.iter().map(|k| k.as_str()).collect::<Vec<_>>(),
            max_sessions = cfg.default.max_sessions,
            "supervisor up"
        );

        // Initial roster: a source that is down with no cache is fatal —
        // never run on a silently empty fleet.
        let mut scheduler = Scheduler::new();
        for &kind in &cfg.default.data_ids {
            let meters = roster.snapshot(kind).await?;
            scheduler.merge_roster(kind, meters);
        }

        let worker_ctx = Arc::new(WorkerContext {
            sink,
            roster: Arc::clone(&roster),
            connect_timeout: Duration::from_secs(cfg.default.connect_timeout_secs),
            tr: Duration::from_secs(cfg.default.tr_timeout_secs),
            session_timeout: Duration::from_secs(cfg.default.session_timeout_secs),
            max_window: TimeDelta::minutes(cfg.default.max_window_minutes),
        });

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, shutting down");
                let _ = shutdown_tx.send(true);
            }
        });

        let pool = Arc::new(Semaphore::new(cfg.default.max_sessions));
        // At most one live session per (meter, kind).
        let in_flight: Arc<Mutex<HashSet<(String, DataKind)>>> =
            Arc::new(Mutex::new(HashSet::new()));
        let mut sessions: JoinSet<()> = JoinSet::new();
        let mut refresh_bucket: i64 = chrono::Utc::now().timestamp() / 60;

        while !*shutdown_rx.borrow() {
            let now = chrono::Utc::now().timestamp();

            if now / 60 > refresh_bucket {
                refresh_bucket = now / 60;
                self.reload_config();
                scheduler.retain_kinds(&self.config.default.data_ids);
                for &kind in &self.config.default.data_ids {
                    match roster.snapshot(kind).await {
                        Ok(meters) => scheduler.merge_roster(kind, meters),
                        Err(e) => {
                            // The in-memory roster stays authoritative
                            // between successful refreshes.
                            warn!(kind = %kind, error = %e, "roster refresh failed, keeping previous roster");
                        }
                    }
                }
            }

            // Reap finished sessions without blocking.
            while sessions.try_join_next().is_some() {}

            let due = scheduler.tick(now);
            if due.is_empty() {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(50)) => {}
                    _ = shutdown_rx.changed() => {}
                }
                continue;
            }

            for dispatch in due {
                let key = (dispatch.meter.meter_id.clone(), dispatch.kind);
                {
                    let mut live = in_flight.lock().await;
                    if !live.insert(key.clone()) {
                        debug!(meter_id = %key.0, kind = %key.1, "previous session still live, skipping slot");
                        continue;
                    }
                }
                let permit = match Arc::clone(&pool).acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };
                let ctx = Arc::clone(&worker_ctx);
                let in_flight = Arc::clone(&in_flight);
                sessions.spawn(async move {
                    worker::poll_meter(ctx, dispatch.meter, dispatch.kind).await;
                    in_flight.lock().await.remove(&key);
                    drop(permit);
                });
            }
        }

        // Drain: in-flight sessions get until their own deadlines.
        let grace = Duration::from_secs(cfg.default.session_timeout_secs);
        info!(in_flight = sessions.len(), "waiting for in-flight sessions");
        let _ = tokio::time::timeout(grace, async {
            while sessions.join_next().await.is_some() {}
        })
        .await;
        sessions.abort_all();
        info!("supervisor stopped");
        Ok(())
    }

    /// Re-read the config file; apply a changed severity to the live
    /// subscriber. A broken file keeps the previous config.
    fn reload_config(&mut self) {
        match config::load_config_from_path(&self.config_path) {
            Ok(fresh) => {
                if fresh.default.severity != self.config.default.severity {
                    info!(severity = %fresh.default.severity, "applying new log severity");
                    if let Some(handle) = &self.reload {
                        let filter = severity_filter(&fresh.default.severity);
                        if let Err(e) = handle.reload(filter) {
                            warn!(error = %e, "severity reload failed");
                        }
                    }
                }
                self.config = fresh;
            }
            Err(e) => {
                error!(path = %self.config_path.display(), error = %e, "config re-read failed, keeping previous config");
            }
        }
    }
}

/// Severity string from the config → an `EnvFilter`, honoring
/// `RUST_LOG`-style overrides from the environment when present.
pub fn severity_filter(severity: &str) -> EnvFilter {
    let directive = match severity.to_uppercase().as_str() {
        "DEBUG" => "debug",
        "INFO" => "info",
        "WARN" => "warn",
        _ => "error",
    };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive))
}

async fn build_sink(cfg: &PollerConfig) -> Result<RecordSink, FatalError> {
    match cfg.api.provider {
        SinkProvider::Buffer => {
            let sink = BufferSink::open(Path::new(&cfg.api.buffer_path), cfg.api.buffer_ttl_secs)?;
            info!(path = %cfg.api.buffer_path, ttl_secs = cfg.api.buffer_ttl_secs, "staging buffer sink ready");
            Ok(RecordSink::Buffer(sink))
        }
        SinkProvider::Postgres => Ok(RecordSink::Postgres(PgSink::connect(&cfg.db).await?)),
    }
}
