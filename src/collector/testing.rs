//! Scripted exchange adapter for collection loop and runner tests.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::Mutex,
};

use chrono::Duration;
use rust_decimal::Decimal;

use crate::{
    error::{CollectorError, CollectorResult},
    exchanges::adapter::{ExchangeAdapter, LiveBatch},
    schema::{Contract, ContractKey, RawFundingPoint},
    util,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Contracts,
    History { key: ContractKey, start_ms: i64, end_ms: i64 },
    LiveBatch(usize),
    Live(ContractKey),
}

pub struct ScriptedAdapter {
    name: &'static str,
    batch: bool,
    window: Duration,
    pub contracts: Mutex<Vec<Contract>>,
    pub history: Mutex<HashMap<ContractKey, Vec<(i64, Decimal)>>>,
    pub live_rates: Mutex<HashMap<ContractKey, Decimal>>,
    pub live_failures: Mutex<VecDeque<CollectorError>>,
    /// Number of upcoming live calls that hang until the caller times out
    pub live_stalls: Mutex<u32>,
    pub not_found: Mutex<HashSet<ContractKey>>,
    /// History errors returned for a contract on every request
    pub history_failures: Mutex<HashMap<ContractKey, CollectorError>>,
    pub calls: Mutex<Vec<Call>>,
}

impl ScriptedAdapter {
    pub fn new(name: &'static str, batch: bool, contracts: Vec<Contract>) -> Self {
        let live_rates = contracts
            .iter()
            .map(|c| (c.key(), Decimal::new(1, 4)))
            .collect();

        Self {
            name,
            batch,
            window: Duration::days(2),
            contracts: Mutex::new(contracts),
            history: Mutex::new(HashMap::new()),
            live_rates: Mutex::new(live_rates),
            live_failures: Mutex::new(VecDeque::new()),
            live_stalls: Mutex::new(0),
            not_found: Mutex::new(HashSet::new()),
            history_failures: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_history(self, key: ContractKey, points: Vec<(i64, Decimal)>) -> Self {
        self.history.lock().unwrap().insert(key, points);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn live_batch_calls(&self) -> usize {
        self.calls().iter().filter(|c| matches!(c, Call::LiveBatch(_))).count()
    }

    async fn live_gate(&self) -> CollectorResult<()> {
        let stall = {
            let mut stalls = self.live_stalls.lock().unwrap();
            let stall = *stalls > 0;
            *stalls = stalls.saturating_sub(1);
            stall
        };
        if stall {
            tokio::time::sleep(std::time::Duration::from_secs(24 * 3600)).await;
        }

        match self.live_failures.lock().unwrap().pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

pub fn contract(exchange: &str, asset: &str, hours: i64) -> Contract {
    Contract::new(exchange, asset, "USDT", Duration::hours(hours))
}

#[async_trait::async_trait]
impl ExchangeAdapter for ScriptedAdapter {
    fn name(&self) -> &'static str {
        self.name
    }

    fn history_window(&self) -> Duration {
        self.window
    }

    async fn get_contracts(&self) -> CollectorResult<Vec<Contract>> {
        self.calls.lock().unwrap().push(Call::Contracts);
        Ok(self.contracts.lock().unwrap().clone())
    }

    async fn fetch_history_window(
        &self,
        contract: &Contract,
        start_ms: i64,
        end_ms: i64,
    ) -> CollectorResult<Vec<RawFundingPoint>> {
        let key = contract.key();
        self.calls.lock().unwrap().push(Call::History { key: key.clone(), start_ms, end_ms });

        if self.not_found.lock().unwrap().contains(&key) {
            return Err(CollectorError::not_found(key.to_string()));
        }
        if let Some(err) = self.history_failures.lock().unwrap().get(&key) {
            return Err(err.clone());
        }

        Ok(self
            .history
            .lock()
            .unwrap()
            .get(&key)
            .map(|rows| {
                rows.iter()
                    .filter(|(ts, _)| *ts >= start_ms && *ts <= end_ms)
                    .map(|(ts, rate)| RawFundingPoint::at_millis(*rate, *ts))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn fetch_live(&self, contract: &Contract) -> CollectorResult<RawFundingPoint> {
        let key = contract.key();
        self.calls.lock().unwrap().push(Call::Live(key.clone()));
        self.live_gate().await?;

        if self.not_found.lock().unwrap().contains(&key) {
            return Err(CollectorError::not_found(key.to_string()));
        }

        let rate = self.live_rates.lock().unwrap().get(&key).copied();
        rate.map(|r| RawFundingPoint::at_millis(r, util::now_ms()))
            .ok_or_else(|| CollectorError::not_found(key.to_string()))
    }

    fn live_batch(&self) -> Option<&dyn LiveBatch> {
        if self.batch { Some(self) } else { None }
    }
}

#[async_trait::async_trait]
impl LiveBatch for ScriptedAdapter {
    async fn fetch_live_batch(
        &self,
        contracts: &[Contract],
    ) -> CollectorResult<HashMap<ContractKey, RawFundingPoint>> {
        self.calls.lock().unwrap().push(Call::LiveBatch(contracts.len()));
        self.live_gate().await?;

        let now = util::now_ms();
        let rates = self.live_rates.lock().unwrap();
        Ok(contracts
            .iter()
            .filter_map(|c| rates.get(&c.key()).map(|r| (c.key(), RawFundingPoint::at_millis(*r, now))))
            .collect())
    }
}
