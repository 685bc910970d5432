use std::{
    sync::{Arc, atomic::Ordering},
    time::Duration,
};

use anyhow::anyhow;
use log::{debug, error, info, warn};
use reqwest::Client;
use tokio::{
    sync::watch,
    task::JoinSet,
    time::{MissedTickBehavior, interval},
};

use crate::{
    collector::{
        health::{HealthReporter, StatusTable},
        poller::{CollectionLoop, LoopExit, shutdown_requested},
    },
    config::{Config, PollerConfig},
    error::CollectorResult,
    exchanges::{self, adapter::ExchangeAdapter},
    metrics::METRICS,
    partition,
    store::FundingStore,
};

/// Time granted to collectors to finish in-flight work after shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Exchanges this instance is responsible for.
///
/// Requested ids that no adapter exists for are dropped with a warning
/// before partitioning, so every instance computes the same global list.
/// An empty request means every supported exchange.
pub fn assigned_exchanges(
    requested: &[String],
    instance_count: usize,
    instance_index: usize,
) -> CollectorResult<Vec<String>> {
    let known: Vec<String> = if requested.is_empty() {
        exchanges::SUPPORTED.iter().map(|s| s.to_string()).collect()
    } else {
        requested
            .iter()
            .filter(|id| {
                let supported = exchanges::SUPPORTED.contains(&id.as_str());
                if !supported {
                    warn!("Exchange '{}' is not supported, ignored", id);
                }
                supported
            })
            .cloned()
            .collect()
    };

    let global = partition::canonical_order(known);
    partition::partition(&global, instance_count, instance_index)
}

/// Runs this instance until shutdown.
///
/// RETURNS:
/// - `Ok(())` after a requested shutdown
/// - `Err` when every assigned exchange loop has stopped, so the
///   supervisor restarts the process
pub async fn run_instance(
    cfg: &Config,
    client: &Client,
    store: Arc<dyn FundingStore>,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let assigned = assigned_exchanges(&cfg.exchanges, cfg.instance_count, cfg.instance_index)?;
    info!(
        "instance {}/{} assigned {:?}",
        cfg.instance_index, cfg.instance_count, assigned
    );

    let adapters = assigned
        .iter()
        .filter_map(|id| exchanges::get_adapter(id, client))
        .collect();

    run_loops(
        adapters,
        store,
        cfg.tuning.poller.clone(),
        HealthReporter::from_config(cfg),
        shutdown,
    )
    .await
}

/// Starts one collection loop per adapter and supervises them.
///
/// DESIGN:
/// - Each loop is its own task; a slow or failing exchange never delays
///   another one
/// - Loops share nothing but the store
/// - The runner only observes loop states, it never drives them
pub async fn run_loops(
    adapters: Vec<Arc<dyn ExchangeAdapter>>,
    store: Arc<dyn FundingStore>,
    poller: PollerConfig,
    health: HealthReporter,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let mut table = StatusTable::default();
    let mut loops: JoinSet<(&'static str, LoopExit)> = JoinSet::new();

    for adapter in adapters {
        let name = adapter.name();
        let status = table.register(name);
        let collection = CollectionLoop::new(
            adapter,
            Arc::clone(&store),
            poller.clone(),
            status,
            shutdown.clone(),
        );

        info!("Starting {} collector", name);
        METRICS.exchanges_active.fetch_add(1, Ordering::Relaxed);
        loops.spawn(async move { (name, collection.run().await) });
    }

    if loops.is_empty() {
        info!("no exchanges assigned to this instance, idling");
    }

    let mut ticker = interval(health.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            _ = shutdown_requested(&mut shutdown) => break,

            _ = ticker.tick() => {
                health.report(&table).await;
            }

            Some(joined) = loops.join_next(), if !loops.is_empty() => {
                match joined {
                    Ok((name, LoopExit::Stopped(err))) => {
                        METRICS.exchanges_active.fetch_sub(1, Ordering::Relaxed);
                        error!("exchange={} collector stopped: {}", name, err);
                    }
                    Ok((name, LoopExit::Shutdown)) => {
                        // only returned once shutdown is set; the next pass breaks
                        debug!("exchange={} collector finished", name);
                        table.mark_finished(name);
                        continue;
                    }
                    Err(e) => {
                        METRICS.exchanges_active.fetch_sub(1, Ordering::Relaxed);
                        error!("collector task failed: {}", e);
                    }
                }

                let report = health.report(&table).await;
                if !report.healthy {
                    return Err(anyhow!(
                        "all {} assigned exchange collectors stopped",
                        report.exchanges.len()
                    ));
                }
            }
        }
    }

    info!("shutdown requested, waiting up to {:?} for collectors", SHUTDOWN_GRACE);
    let drain = async {
        while let Some(joined) = loops.join_next().await {
            if let Ok((name, LoopExit::Shutdown)) = joined {
                debug!("exchange={} collector finished", name);
                table.mark_finished(name);
            }
        }
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        warn!("collectors still busy after {:?}, aborting", SHUTDOWN_GRACE);
        loops.abort_all();
    }

    health.report(&table).await;
    Ok(())
}
