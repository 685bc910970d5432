use std::{
    collections::{HashMap, HashSet},
    future::Future,
    sync::{Arc, atomic::Ordering},
    time::Duration,
};

use chrono::{DateTime, Utc};
use futures_util::{StreamExt, stream};
use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::{sync::watch, time::Instant};

use crate::{
    config::PollerConfig,
    error::{CollectorError, CollectorResult},
    exchanges::adapter::ExchangeAdapter,
    metrics::METRICS,
    normalizer,
    schema::{Contract, ContractKey, FundingRecord, RecordSource},
    store::FundingStore,
    util,
};

/// Externally visible state of one exchange loop.
///
/// `Starting` covers the startup jitter and the first contract discovery;
/// after that the loop only moves between the other four.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Starting,
    Backfilling,
    LivePolling,
    Backoff,
    Stopped,
}

/// Why a collection loop returned.
#[derive(Debug)]
pub enum LoopExit {
    /// Shutdown was requested
    Shutdown,

    /// Too many consecutive failures; carries a `Fatal` error
    Stopped(CollectorError),
}

// ------------------------------------------------------------
// Backoff policy
// ------------------------------------------------------------
//
// delay(k) = min(base * 2^(k-1), cap) for the k-th consecutive failure.
// Monotonically non-decreasing in k and never above the cap.
//
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max: max.max(base) }
    }

    pub fn from_config(cfg: &PollerConfig) -> Self {
        Self::new(
            Duration::from_millis(cfg.backoff_base_ms),
            Duration::from_millis(cfg.backoff_max_ms),
        )
    }

    pub fn delay(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let exp = (failures - 1).min(31);
        self.base.saturating_mul(1u32 << exp).min(self.max)
    }
}

/// How far the settled history of one contract has been collected.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryProgress {
    /// Newest settled record known to be stored
    pub last_ingested: Option<DateTime<Utc>>,

    /// Upper bound of the last fully fetched history range
    pub synced_until: Option<DateTime<Utc>>,
}

impl HistoryProgress {
    fn covered_until(&self) -> Option<DateTime<Utc>> {
        self.last_ingested.max(self.synced_until)
    }

    /// Where the next history fetch starts.
    ///
    /// Strictly after the newest stored record, but at most one funding
    /// interval before the end of the last fetched range so that rates
    /// published late are still picked up.
    pub fn resume_point(&self, interval: chrono::Duration, default_start: DateTime<Utc>) -> DateTime<Utc> {
        let after_last = self.last_ingested.map(|t| t + chrono::Duration::milliseconds(1));
        let rescan = self.synced_until.map(|t| t - interval);

        match (after_last, rescan) {
            (Some(a), Some(r)) => a.max(r),
            (Some(a), None) => a,
            (None, Some(r)) => r,
            (None, None) => default_start,
        }
    }

    /// No settlement can be missing: coverage reaches into the current interval.
    pub fn caught_up(&self, interval: chrono::Duration, now: DateTime<Utc>) -> bool {
        self.covered_until().is_some_and(|c| c >= now - interval)
    }
}

/// Mutable bookkeeping of one exchange loop.
#[derive(Debug, Default)]
pub struct CollectionState {
    /// Contracts currently polled
    pub contracts: HashMap<ContractKey, Contract>,

    /// Kept across delistings so a relisted contract resumes where it left off
    pub progress: HashMap<ContractKey, HistoryProgress>,

    /// Contracts whose history returned malformed data; skipped until the
    /// next contract discovery
    pub parked: HashSet<ContractKey>,

    pub consecutive_failures: u32,
    pub backoff_delay: Duration,
    pub last_discovery: Option<Instant>,
}

/// Collection loop for exactly one exchange.
///
/// GUARANTEES:
/// - Never exits on its own unless the failure budget is exhausted
/// - Every adapter call is bounded by the request timeout
/// - A failed cycle writes nothing; the retry covers the full batch
///
/// NOT RESPONSIBLE FOR:
/// - Choosing which exchanges to run (instance runner)
/// - Exchange-specific parsing (adapters)
pub struct CollectionLoop {
    adapter: Arc<dyn ExchangeAdapter>,
    store: Arc<dyn FundingStore>,
    cfg: PollerConfig,
    backoff: Backoff,
    timeout: Duration,
    state: CollectionState,
    status: watch::Sender<LoopState>,
    shutdown: watch::Receiver<bool>,
}

impl CollectionLoop {
    pub fn new(
        adapter: Arc<dyn ExchangeAdapter>,
        store: Arc<dyn FundingStore>,
        cfg: PollerConfig,
        status: watch::Sender<LoopState>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            backoff: Backoff::from_config(&cfg),
            timeout: Duration::from_secs(cfg.request_timeout_secs),
            adapter,
            store,
            cfg,
            state: CollectionState::default(),
            status,
            shutdown,
        }
    }

    fn exchange(&self) -> &'static str {
        self.adapter.name()
    }

    #[cfg(test)]
    pub fn state(&self) -> &CollectionState {
        &self.state
    }

    fn publish(&self, state: LoopState) {
        self.status.send_replace(state);
    }

    /// Live polling cadence.
    ///
    /// The configured interval, shortened to the shortest funding interval
    /// of the polled contracts, never below the rate-limit floor.
    pub fn cadence(&self) -> Duration {
        let configured = Duration::from_secs(self.cfg.live_poll_interval_secs);
        let floor = Duration::from_secs(self.cfg.min_poll_interval_secs);

        let shortest = self
            .state
            .contracts
            .values()
            .filter_map(|c| c.funding_interval.to_std().ok())
            .min();

        shortest.map_or(configured, |s| configured.min(s)).max(floor)
    }

    // --------------------------------------------------------
    // Driver
    // --------------------------------------------------------

    /// Runs until shutdown or until the exchange is stopped.
    pub async fn run(mut self) -> LoopExit {
        let mut shutdown = self.shutdown.clone();
        self.publish(LoopState::Starting);

        // spread the first requests of many loops
        if self.cfg.startup_jitter_ms > 0 {
            let jitter = Duration::from_millis(rand::random_range(0..=self.cfg.startup_jitter_ms));
            if !sleep_or_shutdown(&mut shutdown, jitter).await {
                return self.exit_shutdown();
            }
        }

        let mut state = loop {
            let outcome = tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => None,
                r = self.initialize() => Some(r),
            };

            match outcome {
                None => return self.exit_shutdown(),
                Some(Ok(next)) => {
                    self.record_success();
                    break next;
                }
                Some(Err(e)) => {
                    if let Err(exit) = self.recover(e, LoopState::Starting, &mut shutdown).await {
                        return exit;
                    }
                }
            }
        };

        loop {
            self.publish(state);

            let outcome = tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => None,
                r = self.cycle(state) => Some(r),
            };

            match outcome {
                None => return self.exit_shutdown(),
                Some(Ok(next)) => {
                    self.record_success();

                    let pause = match (state, next) {
                        (LoopState::LivePolling, LoopState::LivePolling) => Some(self.cadence()),
                        // still behind after a full pass: the pass took longer than a funding interval
                        (LoopState::Backfilling, LoopState::Backfilling) => {
                            Some(Duration::from_secs(self.cfg.min_poll_interval_secs))
                        }
                        _ => None,
                    };

                    if next != state {
                        info!("exchange={} {:?} -> {:?}", self.exchange(), state, next);
                    }
                    state = next;

                    if let Some(pause) = pause {
                        if !sleep_or_shutdown(&mut shutdown, pause).await {
                            return self.exit_shutdown();
                        }
                    }
                }
                Some(Err(e)) => {
                    if let Err(exit) = self.recover(e, state, &mut shutdown).await {
                        return exit;
                    }
                }
            }
        }
    }

    async fn cycle(&mut self, state: LoopState) -> CollectorResult<LoopState> {
        match state {
            LoopState::Backfilling => self.backfill_cycle().await,
            _ => self.live_cycle().await,
        }
    }

    fn record_success(&mut self) {
        if self.state.consecutive_failures > 0 {
            info!(
                "exchange={} recovered after {} failed cycles",
                self.exchange(),
                self.state.consecutive_failures
            );
        }
        self.state.consecutive_failures = 0;
        self.state.backoff_delay = Duration::ZERO;
    }

    /// Accounts a failed cycle and waits before the next attempt.
    ///
    /// Transient failures wait for the backoff delay; anything else waits
    /// for the normal cadence. Exceeding the failure budget stops the loop.
    async fn recover(
        &mut self,
        err: CollectorError,
        during: LoopState,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), LoopExit> {
        self.state.consecutive_failures += 1;
        let failures = self.state.consecutive_failures;
        let budget = self.cfg.max_consecutive_failures;

        if failures > budget {
            let fatal = CollectorError::Fatal {
                exchange: self.exchange().to_string(),
                reason: format!("{failures} consecutive failed cycles, last: {err}"),
            };
            error!("exchange={} stopped: {}", self.exchange(), fatal);

            METRICS.exchanges_stopped.fetch_add(1, Ordering::Relaxed);
            self.publish(LoopState::Stopped);
            return Err(LoopExit::Stopped(fatal));
        }

        let wait = if err.is_retryable() {
            self.state.backoff_delay = self.backoff.delay(failures);

            METRICS.transient_errors.fetch_add(1, Ordering::Relaxed);
            METRICS.backoffs.fetch_add(1, Ordering::Relaxed);
            warn!(
                "exchange={} {:?} failed ({}/{}), backing off {:?}: {}",
                self.exchange(), during, failures, budget, self.state.backoff_delay, err
            );

            self.publish(LoopState::Backoff);
            self.state.backoff_delay
        } else {
            METRICS.protocol_errors.fetch_add(1, Ordering::Relaxed);
            error!(
                "exchange={} {:?} aborted ({}/{}): {}",
                self.exchange(), during, failures, budget, err
            );
            self.cadence()
        };

        if !sleep_or_shutdown(shutdown, wait).await {
            return Err(self.exit_shutdown());
        }
        Ok(())
    }

    fn exit_shutdown(&self) -> LoopExit {
        info!("exchange={} shutting down", self.exchange());
        LoopExit::Shutdown
    }

    // --------------------------------------------------------
    // Contract discovery
    // --------------------------------------------------------

    /// Discovers contracts and recovers history cursors from the store.
    ///
    /// Returns the initial collection state: `Backfilling` when no contract
    /// has stored history yet, `LivePolling` otherwise.
    pub async fn initialize(&mut self) -> CollectorResult<LoopState> {
        self.discover().await?;

        let latest = self.store.latest_history(self.exchange()).await?;
        for (key, ts) in latest {
            let progress = self.state.progress.entry(key).or_default();
            progress.last_ingested = progress.last_ingested.max(Some(ts));
        }

        let with_history = self
            .state
            .contracts
            .keys()
            .filter(|k| self.state.progress.get(*k).is_some_and(|p| p.last_ingested.is_some()))
            .count();

        info!(
            "exchange={} {} contracts, {} with stored history",
            self.exchange(),
            self.state.contracts.len(),
            with_history
        );

        Ok(if with_history == 0 {
            LoopState::Backfilling
        } else {
            LoopState::LivePolling
        })
    }

    async fn discover(&mut self) -> CollectorResult<()> {
        METRICS.contract_requests.fetch_add(1, Ordering::Relaxed);
        let listed = with_timeout(self.timeout, self.adapter.get_contracts()).await?;
        let first = self.state.last_discovery.is_none();

        let mut next: HashMap<ContractKey, Contract> = HashMap::with_capacity(listed.len());
        for contract in listed {
            if contract.funding_interval <= chrono::Duration::zero() {
                warn!("exchange={} contract={} has no funding interval, skipped", self.exchange(), contract.key());
                continue;
            }

            let key = contract.key();
            match self.state.contracts.get(&key) {
                Some(old) if old.funding_interval != contract.funding_interval => info!(
                    "exchange={} contract={} funding interval {}s -> {}s",
                    self.exchange(),
                    key,
                    old.funding_interval.num_seconds(),
                    contract.funding_interval.num_seconds()
                ),
                None if !first => info!("exchange={} contract={} listed", self.exchange(), key),
                _ => {}
            }
            next.insert(key, contract);
        }

        for key in self.state.contracts.keys().filter(|k| !next.contains_key(*k)) {
            info!("exchange={} contract={} no longer listed", self.exchange(), key);
        }

        let mut contracts: Vec<Contract> = next.values().cloned().collect();
        contracts.sort_by(|a, b| a.key().cmp(&b.key()));
        self.store.upsert_contracts(self.exchange(), &contracts).await?;

        self.state.contracts = next;
        self.state.parked.clear();
        self.state.last_discovery = Some(Instant::now());

        debug!("exchange={} cadence {:?}", self.exchange(), self.cadence());
        Ok(())
    }

    async fn refresh_contracts_if_due(&mut self) -> CollectorResult<()> {
        let every = Duration::from_secs(self.cfg.contract_refresh_secs);
        let due = self.state.last_discovery.is_none_or(|at| at.elapsed() >= every);

        if due { self.discover().await } else { Ok(()) }
    }

    /// Active contracts in key order.
    fn active_contracts(&self) -> Vec<Contract> {
        let mut contracts: Vec<Contract> = self.state.contracts.values().cloned().collect();
        contracts.sort_by(|a, b| a.key().cmp(&b.key()));
        contracts
    }

    /// Active, non-parked contracts whose history is behind `now`.
    fn lagging(&self, now: DateTime<Utc>) -> Vec<Contract> {
        self.active_contracts()
            .into_iter()
            .filter(|c| {
                let key = c.key();
                !self.state.parked.contains(&key)
                    && !self
                        .state
                        .progress
                        .get(&key)
                        .is_some_and(|p| p.caught_up(c.funding_interval, now))
            })
            .collect()
    }

    fn next_state(&self) -> LoopState {
        if self.lagging(util::now_utc()).is_empty() {
            LoopState::LivePolling
        } else {
            LoopState::Backfilling
        }
    }

    /// Handles a per-contract error; returns it again when the whole cycle
    /// must be aborted.
    fn contract_failed(&mut self, contract: &Contract, err: CollectorError, park: bool) -> CollectorResult<()> {
        let key = contract.key();
        match err {
            CollectorError::NotFound(msg) => {
                METRICS.not_found.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "exchange={} contract={} not found, dropped until rediscovered: {}",
                    self.exchange(), key, msg
                );
                self.state.contracts.remove(&key);
                Ok(())
            }
            CollectorError::Protocol(msg) => {
                METRICS.protocol_errors.fetch_add(1, Ordering::Relaxed);
                if park {
                    error!(
                        "exchange={} contract={} malformed history, parked until next discovery: {}",
                        self.exchange(), key, msg
                    );
                    self.state.parked.insert(key);
                } else {
                    error!("exchange={} contract={} malformed live rate: {}", self.exchange(), key, msg);
                }
                Ok(())
            }
            other => Err(other),
        }
    }

    // --------------------------------------------------------
    // Backfilling
    // --------------------------------------------------------

    /// Fetches and writes the missing history of every lagging contract.
    ///
    /// Progress is kept per contract, so a cycle aborted half way resumes
    /// with the contracts it did not finish.
    pub async fn backfill_cycle(&mut self) -> CollectorResult<LoopState> {
        self.refresh_contracts_if_due().await?;

        let now = util::now_utc();
        let default_start = now - chrono::Duration::days(self.cfg.backfill_days);

        for contract in self.lagging(now) {
            let key = contract.key();
            let since = self
                .state
                .progress
                .get(&key)
                .cloned()
                .unwrap_or_default()
                .resume_point(contract.funding_interval, default_start);

            let records = match self.fetch_history(&contract, since, now).await {
                Ok(records) => records,
                Err(e) => {
                    self.contract_failed(&contract, e, true)?;
                    continue;
                }
            };

            if !records.is_empty() {
                self.write(&records).await?;
            }

            let progress = self.state.progress.entry(key.clone()).or_default();
            if let Some(last) = records.last() {
                progress.last_ingested = progress.last_ingested.max(Some(last.timestamp));
            }
            progress.synced_until = Some(now);

            debug!(
                "exchange={} contract={} history {} .. {}: {} records",
                self.exchange(), key, since, now, records.len()
            );
        }

        Ok(self.next_state())
    }

    async fn fetch_history(
        &self,
        contract: &Contract,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> CollectorResult<Vec<FundingRecord>> {
        if since >= until {
            return Ok(Vec::new());
        }

        // one request per window, each bounded by the request timeout
        let window = self.adapter.history_window().num_milliseconds().max(1);
        let span = (until - since).num_milliseconds();
        let windows = ((span + window - 1) / window).max(1) as u32;
        METRICS.history_requests.fetch_add(windows as usize, Ordering::Relaxed);

        let raw = with_timeout(
            self.timeout.saturating_mul(windows),
            self.adapter.fetch_history(contract, since, until),
        )
        .await?;

        normalizer::normalize_batch(contract, &raw, self.adapter.rate_unit(), RecordSource::History)
    }

    // --------------------------------------------------------
    // Live polling
    // --------------------------------------------------------

    /// Polls the latest rate of every active contract and writes them as
    /// one batch.
    pub async fn live_cycle(&mut self) -> CollectorResult<LoopState> {
        self.refresh_contracts_if_due().await?;

        let contracts = self.active_contracts();
        if contracts.is_empty() {
            debug!("exchange={} no contracts to poll", self.exchange());
            return Ok(LoopState::LivePolling);
        }

        let records = if self.adapter.live_batch().is_some() {
            self.poll_batch(&contracts).await?
        } else {
            self.poll_each(contracts).await?
        };

        if !records.is_empty() {
            self.write(&records).await?;
        }

        debug!("exchange={} live: {} records", self.exchange(), records.len());
        Ok(self.next_state())
    }

    async fn poll_batch(&self, contracts: &[Contract]) -> CollectorResult<Vec<FundingRecord>> {
        let Some(batch) = self.adapter.live_batch() else {
            return Ok(Vec::new());
        };

        METRICS.live_requests.fetch_add(1, Ordering::Relaxed);
        let mut raw = with_timeout(self.timeout, batch.fetch_live_batch(contracts)).await?;
        let unit = self.adapter.rate_unit();

        let mut records = Vec::with_capacity(raw.len());
        for contract in contracts {
            match raw.remove(&contract.key()) {
                Some(point) => records.push(normalizer::normalize_point(contract, &point, unit, RecordSource::Live)?),
                None => debug!("exchange={} contract={} missing from live batch", self.exchange(), contract.key()),
            }
        }

        Ok(normalizer::dedup_last_wins(records))
    }

    async fn poll_each(&mut self, contracts: Vec<Contract>) -> CollectorResult<Vec<FundingRecord>> {
        let adapter = Arc::clone(&self.adapter);
        let limit = self.timeout;
        let unit = adapter.rate_unit();
        METRICS.live_requests.fetch_add(contracts.len(), Ordering::Relaxed);

        let results: Vec<(Contract, CollectorResult<FundingRecord>)> = stream::iter(contracts)
            .map(|contract| {
                let adapter = Arc::clone(&adapter);
                async move {
                    let record = with_timeout(limit, adapter.fetch_live(&contract))
                        .await
                        .and_then(|p| normalizer::normalize_point(&contract, &p, unit, RecordSource::Live));
                    (contract, record)
                }
            })
            .buffer_unordered(self.cfg.live_concurrency)
            .collect()
            .await;

        // a transient failure anywhere aborts the cycle; the retry re-polls everything
        if let Some(err) = results.iter().find_map(|(_, r)| r.as_ref().err().filter(|e| e.is_retryable())) {
            return Err(err.clone());
        }

        let mut records = Vec::with_capacity(results.len());
        let mut malformed: Option<CollectorError> = None;

        for (contract, result) in results {
            match result {
                Ok(record) => records.push(record),
                Err(e) => {
                    if matches!(e, CollectorError::Protocol(_)) {
                        malformed.get_or_insert_with(|| e.clone());
                    }
                    self.contract_failed(&contract, e, false)?;
                }
            }
        }

        // every single contract malformed: treat as a failed cycle
        if records.is_empty() {
            if let Some(err) = malformed {
                return Err(err);
            }
        }

        Ok(normalizer::dedup_last_wins(records))
    }

    async fn write(&self, records: &[FundingRecord]) -> CollectorResult<u64> {
        with_timeout(self.timeout, self.store.write(records)).await
    }
}

/// Bounds `fut` by `limit`; an elapsed timer is a transient failure.
pub(crate) async fn with_timeout<T, F>(limit: Duration, fut: F) -> CollectorResult<T>
where
    F: Future<Output = CollectorResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(CollectorError::transient(format!("timed out after {limit:?}"))),
    }
}

/// Resolves once shutdown is requested or the sender is gone.
///
/// The watch guard is released before returning, so the future can sit in
/// a `select!` next to other awaits.
pub(crate) async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

/// Sleeps for `d`; returns false if shutdown was requested first.
async fn sleep_or_shutdown(rx: &mut watch::Receiver<bool>, d: Duration) -> bool {
    tokio::select! {
        biased;
        _ = shutdown_requested(rx) => false,
        _ = tokio::time::sleep(d) => true,
    }
}
