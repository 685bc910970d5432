use std::collections::{HashMap, HashSet};

use chrono::Duration;
use log::debug;
use reqwest::Client;
use serde_json::Value;

use crate::{
    error::{CollectorError, CollectorResult},
    schema::{Contract, ContractKey, RawFundingPoint},
    util,
};

use super::{
    adapter::{ExchangeAdapter, LiveBatch},
    binance_usdm::{map_binance_error, parse_funding_rows, parse_premium_index, select_live},
    http,
};

const API_ENDPOINT: &str = "https://dapi.binance.com/dapi";

/// Binance COIN-M futures REST adapter
///
/// Same wire format as USD-M with two differences:
/// - Perpetual symbols carry a `_PERP` suffix (BTCUSD_PERP)
/// - Every contract settles every 8 hours, so one 1000-row history
///   page covers 8000 hours
pub struct BinanceCoinmAdapter {
    client: Client,
}

impl BinanceCoinmAdapter {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn format_symbol(contract: &Contract) -> String {
        format!("{}{}_PERP", contract.asset, contract.quote)
    }

    async fn get(&self, path: &str, params: &[(&str, String)]) -> CollectorResult<Value> {
        http::get_json(&self.client, &format!("{API_ENDPOINT}{path}"), params)
            .await
            .map_err(map_binance_error)
    }
}

#[async_trait::async_trait]
impl ExchangeAdapter for BinanceCoinmAdapter {
    fn name(&self) -> &'static str {
        "binance_coinm"
    }

    fn history_window(&self) -> Duration {
        Duration::hours(8000)
    }

    async fn get_contracts(&self) -> CollectorResult<Vec<Contract>> {
        let info = self.get("/v1/exchangeInfo", &[]).await?;

        let symbols = info["symbols"]
            .as_array()
            .ok_or_else(|| CollectorError::protocol("binance coin-m exchangeInfo: missing symbols"))?;

        let mut seen = HashSet::new();
        let contracts: Vec<Contract> = symbols
            .iter()
            .filter(|s| s["contractType"].as_str() == Some("PERPETUAL"))
            .filter(|s| s["contractStatus"].as_str().is_none_or(|st| st == "TRADING"))
            .filter_map(|s| {
                Some(
                    Contract::new(self.name(), s["baseAsset"].as_str()?, s["quoteAsset"].as_str()?, Duration::hours(8))
                        .with_contract_type("PERPETUAL"),
                )
            })
            .filter(|c| seen.insert(c.key()))
            .collect();

        debug!("fetched {} contracts from {}", contracts.len(), self.name());
        Ok(contracts)
    }

    async fn fetch_history_window(
        &self,
        contract: &Contract,
        start_ms: i64,
        end_ms: i64,
    ) -> CollectorResult<Vec<RawFundingPoint>> {
        let symbol = Self::format_symbol(contract);
        debug!("fetching history for {}/{} from {} to {}", self.name(), symbol, start_ms, end_ms);

        let v = self
            .get(
                "/v1/fundingRate",
                &[
                    ("symbol", symbol.clone()),
                    ("startTime", start_ms.to_string()),
                    ("endTime", end_ms.to_string()),
                    ("limit", "1000".to_string()),
                ],
            )
            .await?;

        let points = parse_funding_rows(&v)?;
        debug!("fetched {} funding points for {}/{}", points.len(), self.name(), symbol);
        Ok(points)
    }

    async fn fetch_live(&self, contract: &Contract) -> CollectorResult<RawFundingPoint> {
        let mut rates = self.fetch_live_batch(std::slice::from_ref(contract)).await?;
        rates
            .remove(&contract.key())
            .ok_or_else(|| CollectorError::not_found(format!("binance coin-m {}", Self::format_symbol(contract))))
    }

    fn live_batch(&self) -> Option<&dyn LiveBatch> {
        Some(self)
    }
}

#[async_trait::async_trait]
impl LiveBatch for BinanceCoinmAdapter {
    async fn fetch_live_batch(
        &self,
        contracts: &[Contract],
    ) -> CollectorResult<HashMap<ContractKey, RawFundingPoint>> {
        debug!("fetching live rates batch from {}", self.name());

        let v = self.get("/v1/premiumIndex", &[]).await?;
        let rates = parse_premium_index(&v, util::now_ms())?;

        Ok(select_live(contracts, &rates, Self::format_symbol))
    }
}
