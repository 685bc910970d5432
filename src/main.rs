// ------------------------------------------------------------
// Module declarations
// ------------------------------------------------------------
//
// Each module represents a well-defined responsibility:
//
// - config:     Environment + JSON tuning configuration
// - error:      Error taxonomy shared by adapters, loops and store
// - schema:     Strongly typed contract and funding record definitions
// - util:       Shared helper utilities (time, decimal parsing, lists)
// - normalizer: Raw exchange values -> canonical funding records
// - partition:  Static exchange assignment across instances
// - exchanges:  Exchange adapters and adapter registry
// - store:      Idempotent, transactional funding record writes
// - collector:  Per-exchange collection loops and the instance runner
// - verify:     One-off adapter verification command
//
mod collector;
mod config;
mod error;
mod exchanges;
mod metrics;
mod normalizer;
mod partition;
mod schema;
mod store;
mod util;
mod verify;

// ------------------------------------------------------------
// External dependencies
// ------------------------------------------------------------

use std::{process::ExitCode, sync::Arc, time::Duration};

use anyhow::Context;
use clap::{Parser, Subcommand};
use log::{LevelFilter, error, info, warn};
use rustls::crypto::{CryptoProvider, ring};
use tokio::{sync::watch, time::sleep};

use config::Config;
use metrics::METRICS;
use store::PgFundingStore;

#[derive(Parser)]
#[command(name = "funding-collector", version, about = "Collects perpetual futures funding rates")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Collect funding rates for this instance's exchanges (default)
    Run,

    /// Exercise one exchange adapter against its live API and exit
    Verify {
        /// Exchange id, e.g. `bybit`
        exchange: String,
    },
}

// ------------------------------------------------------------
// Application entry point
// ------------------------------------------------------------
//
// Responsibilities:
// - Initialize cryptography backend (rustls)
// - Load configuration and logging
// - Dispatch to the collector runtime or the verify command
//
// Exit codes: 0 on clean shutdown or passed verification, 1 on
// configuration errors, verification failures or when every
// collector of this instance stopped.
//
#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // --------------------------------------------------------
    // IMPORTANT:
    // rustls >= 0.23 requires an explicit CryptoProvider
    // installation before reqwest or sqlx open a TLS session.
    // --------------------------------------------------------
    CryptoProvider::install_default(ring::default_provider())
        .expect("failed to install rustls CryptoProvider");

    let cli = Cli::parse();
    let config = Config::load()?;
    init_logging(&config.debug_exchanges);

    let client = exchanges::http::build_client(Duration::from_secs(
        config.tuning.poller.request_timeout_secs,
    ))?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Verify { exchange } => {
            let timeout = Duration::from_secs(config.tuning.poller.request_timeout_secs);
            let passed = verify::run(&exchange.to_lowercase(), &client, timeout).await;
            Ok(if passed { ExitCode::SUCCESS } else { ExitCode::FAILURE })
        }
        Command::Run => run(config, client).await,
    }
}

async fn run(config: Config, client: reqwest::Client) -> anyhow::Result<ExitCode> {
    let url = config
        .db_connection
        .as_deref()
        .context("DB_CONNECTION must be set")?;

    // --------------------------------------------------------
    // One pool shared by every collection loop of the instance.
    // Schema migrations are applied externally before start.
    // --------------------------------------------------------
    let store = PgFundingStore::connect(url, &config.tuning.store)
        .await
        .context("connecting to the funding store")?;

    let (shutdown_tx, shutdown) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    // --------------------------------------------------------
    // Start metrics reporter (periodic, low-noise)
    // --------------------------------------------------------
    tokio::spawn(async {
        loop {
            sleep(Duration::from_secs(60)).await;
            info!("[METRICS] {}", METRICS.summary());
        }
    });

    let result = collector::runner::run_instance(
        &config,
        &client,
        Arc::new(store.clone()),
        shutdown,
    )
    .await;

    store.close().await;
    info!("[METRICS] {}", METRICS.summary());

    match result {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(e) => {
            error!("instance failed: {:#}", e);
            Ok(ExitCode::FAILURE)
        }
    }
}

// ------------------------------------------------------------
// Logging
// ------------------------------------------------------------
//
// `RUST_LOG` sets the baseline (default `info`). Exchanges listed in
// DEBUG_EXCHANGES get their adapter module raised to debug; this never
// affects which exchanges are collected.
//
fn init_logging(debug_exchanges: &[String]) {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));

    for noisy in ["sqlx", "reqwest", "hyper", "hyper_util", "rustls"] {
        builder.filter_module(noisy, LevelFilter::Warn);
    }

    let mut unknown = Vec::new();
    for id in debug_exchanges {
        if exchanges::SUPPORTED.contains(&id.as_str()) {
            builder.filter_module(&exchanges::log_target(id), LevelFilter::Debug);
        } else {
            unknown.push(id.as_str());
        }
    }

    builder.init();

    if !unknown.is_empty() {
        warn!("DEBUG_EXCHANGES lists unknown exchanges: {}", unknown.join(", "));
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!("SIGTERM handler unavailable: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
