use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
    time::Duration,
};

use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::Serialize;
use tokio::sync::watch;

use crate::{collector::poller::LoopState, config::Config, util};

// ------------------------------------------------------------
// Status table
// ------------------------------------------------------------
//
// One watch channel per exchange loop. The loop owns the sender and
// publishes every state change; the runner only ever reads.
//
#[derive(Default)]
pub struct StatusTable {
    entries: BTreeMap<String, watch::Receiver<LoopState>>,

    /// Loops that returned because shutdown was requested
    finished: BTreeSet<String>,
}

impl StatusTable {
    /// Adds an exchange and returns the sender its loop publishes on.
    pub fn register(&mut self, exchange: &str) -> watch::Sender<LoopState> {
        let (tx, rx) = watch::channel(LoopState::Starting);
        self.entries.insert(exchange.to_string(), rx);
        tx
    }

    /// Records that the loop of `exchange` returned on shutdown.
    pub fn mark_finished(&mut self, exchange: &str) {
        self.finished.insert(exchange.to_string());
    }

    /// Current state of every registered exchange.
    ///
    /// A loop whose task has ended without shutdown (sender dropped) is
    /// reported as `Stopped`, whatever it published last. A loop that
    /// finished on shutdown keeps its last published state.
    pub fn snapshot(&self) -> BTreeMap<String, LoopState> {
        self.entries
            .iter()
            .map(|(id, rx)| {
                let state = if rx.has_changed().is_err() && !self.finished.contains(id) {
                    LoopState::Stopped
                } else {
                    *rx.borrow()
                };
                (id.clone(), state)
            })
            .collect()
    }
}

/// An instance is unhealthy only when it has loops and all of them stopped.
pub fn all_stopped(states: &BTreeMap<String, LoopState>) -> bool {
    !states.is_empty() && states.values().all(|s| *s == LoopState::Stopped)
}

/// Liveness document written to `HEALTH_FILE`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub instance: usize,
    pub instance_count: usize,
    pub healthy: bool,
    pub updated_at: DateTime<Utc>,
    pub exchanges: BTreeMap<String, LoopState>,
}

impl HealthReport {
    pub fn new(instance: usize, instance_count: usize, exchanges: BTreeMap<String, LoopState>) -> Self {
        Self {
            instance,
            instance_count,
            healthy: !all_stopped(&exchanges),
            updated_at: util::now_utc(),
            exchanges,
        }
    }

    fn summary(&self) -> String {
        self.exchanges
            .iter()
            .map(|(id, state)| format!("{id}={state:?}"))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Periodic liveness reporting for the process supervisor.
pub struct HealthReporter {
    instance: usize,
    instance_count: usize,
    file: Option<PathBuf>,
    pub interval: Duration,
}

impl HealthReporter {
    pub fn new(instance: usize, instance_count: usize, file: Option<PathBuf>, interval: Duration) -> Self {
        Self {
            instance,
            instance_count,
            file,
            // tokio intervals reject a zero period
            interval: interval.max(Duration::from_secs(1)),
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self::new(
            cfg.instance_index,
            cfg.instance_count,
            cfg.health_file.as_ref().map(PathBuf::from),
            Duration::from_secs(cfg.tuning.health.interval_secs),
        )
    }

    /// Logs the status table and rewrites the health file, if configured.
    pub async fn report(&self, table: &StatusTable) -> HealthReport {
        let report = HealthReport::new(self.instance, self.instance_count, table.snapshot());

        if report.exchanges.is_empty() {
            info!("[HEALTH] instance={} idle, no exchanges assigned", self.instance);
        } else {
            info!(
                "[HEALTH] instance={} healthy={} {}",
                self.instance,
                report.healthy,
                report.summary()
            );
        }

        if let Some(path) = &self.file {
            if let Err(e) = write_file(path, &report).await {
                warn!("health file {} not written: {}", path.display(), e);
            }
        }

        report
    }
}

/// Replaces `path` atomically: readers see the old or the new document,
/// never a partial one.
pub async fn write_file(path: &Path, report: &HealthReport) -> anyhow::Result<()> {
    let json = serde_json::to_vec_pretty(report)?;
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, json).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_partition_is_healthy() {
        let report = HealthReport::new(3, 4, BTreeMap::new());
        assert!(report.healthy);
    }

    #[test]
    fn unhealthy_only_when_every_loop_stopped() {
        let mut states = BTreeMap::new();
        states.insert("bybit".to_string(), LoopState::Stopped);
        states.insert("okx".to_string(), LoopState::Backoff);
        assert!(!all_stopped(&states));

        states.insert("okx".to_string(), LoopState::Stopped);
        assert!(all_stopped(&states));
    }

    #[test]
    fn ended_loop_reads_as_stopped() {
        let mut table = StatusTable::default();
        let bybit = table.register("bybit");
        let okx = table.register("okx");
        bybit.send_replace(LoopState::LivePolling);
        okx.send_replace(LoopState::Backoff);
        drop(okx);

        let snapshot = table.snapshot();
        assert_eq!(snapshot["bybit"], LoopState::LivePolling);
        assert_eq!(snapshot["okx"], LoopState::Stopped);
    }

    #[test]
    fn loop_finished_on_shutdown_keeps_its_last_state() {
        let mut table = StatusTable::default();
        let okx = table.register("okx");
        okx.send_replace(LoopState::LivePolling);
        drop(okx);
        table.mark_finished("okx");

        let snapshot = table.snapshot();
        assert_eq!(snapshot["okx"], LoopState::LivePolling);
        assert!(!all_stopped(&snapshot));
    }

    #[tokio::test]
    async fn health_file_is_replaced_with_the_latest_report() {
        let path = std::env::temp_dir().join(format!("funding-health-{}.json", std::process::id()));

        let mut table = StatusTable::default();
        let tx = table.register("okx");
        tx.send_replace(LoopState::LivePolling);

        let reporter = HealthReporter::new(0, 2, Some(path.clone()), Duration::from_secs(15));
        reporter.report(&table).await;
        tx.send_replace(LoopState::Stopped);
        let report = reporter.report(&table).await;
        assert!(!report.healthy);

        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written["healthy"], false);
        assert_eq!(written["instance_count"], 2);
        assert_eq!(written["exchanges"]["okx"], "stopped");
        assert!(!path.with_extension("tmp").exists());

        std::fs::remove_file(&path).unwrap();
    }
}
