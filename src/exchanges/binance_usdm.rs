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
    http,
};

const API_ENDPOINT: &str = "https://fapi.binance.com/fapi";

/// Binance USD-M futures REST adapter
///
/// - Symbols have no separator: BASE + QUOTE (BTCUSDT)
/// - Funding interval comes from `/v1/fundingInfo`, which only lists
///   symbols with a non-default interval; everything else settles every 8h
/// - `/v1/fundingRate` returns at most 1000 rows; the shortest interval
///   is 1h, so one window spans 1000 hours
/// - `/v1/premiumIndex` returns the current rate of every symbol at once
pub struct BinanceUsdmAdapter {
    client: Client,
}

impl BinanceUsdmAdapter {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn format_symbol(contract: &Contract) -> String {
        format!("{}{}", contract.asset, contract.quote)
    }

    async fn get(&self, path: &str, params: &[(&str, String)]) -> CollectorResult<Value> {
        http::get_json(&self.client, &format!("{API_ENDPOINT}{path}"), params)
            .await
            .map_err(map_binance_error)
    }
}

/// Binance reports an unknown symbol as HTTP 400 with code -1121.
pub(super) fn map_binance_error(e: CollectorError) -> CollectorError {
    match e {
        CollectorError::Protocol(msg) if msg.contains("-1121") => CollectorError::NotFound(msg),
        other => other,
    }
}

/// Parses `/v1/fundingRate` rows (shared by USD-M and COIN-M).
pub(super) fn parse_funding_rows(v: &Value) -> CollectorResult<Vec<RawFundingPoint>> {
    let rows = v
        .as_array()
        .ok_or_else(|| CollectorError::protocol(format!("binance fundingRate: expected array, got {v}")))?;

    rows.iter()
        .map(|row| {
            match (util::parse_decimal(&row["fundingRate"]), util::parse_i64(&row["fundingTime"])) {
                (Some(rate), Some(ms)) => Ok(RawFundingPoint::at_millis(rate, ms)),
                _ => Err(CollectorError::protocol(format!("binance fundingRate: bad row {row}"))),
            }
        })
        .collect()
}

/// Parses `/v1/premiumIndex` into `symbol -> latest rate`.
///
/// Delivery contracts report an empty `lastFundingRate` and are skipped.
pub(super) fn parse_premium_index(v: &Value, now_ms: i64) -> CollectorResult<HashMap<String, RawFundingPoint>> {
    let items = v
        .as_array()
        .ok_or_else(|| CollectorError::protocol("binance premiumIndex: expected array"))?;

    Ok(items
        .iter()
        .filter_map(|item| {
            let symbol = item["symbol"].as_str()?;
            let rate = util::parse_decimal(&item["lastFundingRate"])?;
            Some((symbol.to_string(), RawFundingPoint::at_millis(rate, now_ms)))
        })
        .collect())
}

/// Selects the requested contracts out of a premium index response.
pub(super) fn select_live(
    contracts: &[Contract],
    rates: &HashMap<String, RawFundingPoint>,
    format_symbol: fn(&Contract) -> String,
) -> HashMap<ContractKey, RawFundingPoint> {
    contracts
        .iter()
        .filter_map(|c| rates.get(&format_symbol(c)).map(|p| (c.key(), p.clone())))
        .collect()
}

#[async_trait::async_trait]
impl ExchangeAdapter for BinanceUsdmAdapter {
    fn name(&self) -> &'static str {
        "binance_usdm"
    }

    fn history_window(&self) -> Duration {
        Duration::hours(1000)
    }

    async fn get_contracts(&self) -> CollectorResult<Vec<Contract>> {
        let info = self.get("/v1/exchangeInfo", &[]).await?;
        let funding_info = self.get("/v1/fundingInfo", &[]).await?;

        let intervals: HashMap<&str, i64> = funding_info
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|i| Some((i["symbol"].as_str()?, util::parse_i64(&i["fundingIntervalHours"])?)))
                    .collect()
            })
            .unwrap_or_default();

        let symbols = info["symbols"]
            .as_array()
            .ok_or_else(|| CollectorError::protocol("binance exchangeInfo: missing symbols"))?;

        let mut seen = HashSet::new();
        let contracts: Vec<Contract> = symbols
            .iter()
            .filter(|s| s["contractType"].as_str() == Some("PERPETUAL"))
            .filter(|s| s["status"].as_str().is_none_or(|st| st == "TRADING"))
            .filter_map(|s| {
                let symbol = s["symbol"].as_str()?;
                let hours = intervals.get(symbol).copied().filter(|h| *h > 0).unwrap_or(8);
                let tick_size = s["filters"].as_array().and_then(|filters| {
                    filters
                        .iter()
                        .find(|f| f["filterType"].as_str() == Some("PRICE_FILTER"))
                        .and_then(|f| util::parse_decimal(&f["tickSize"]))
                });

                Some(
                    Contract::new(self.name(), s["baseAsset"].as_str()?, s["quoteAsset"].as_str()?, Duration::hours(hours))
                        .with_contract_type("PERPETUAL")
                        .with_tick_size(tick_size),
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
        let symbol = Self::format_symbol(contract);
        let v = self.get("/v1/premiumIndex", &[("symbol", symbol.clone())]).await?;

        let rate = util::parse_decimal(&v["lastFundingRate"])
            .ok_or_else(|| CollectorError::protocol(format!("binance premiumIndex {symbol}: no lastFundingRate")))?;

        Ok(RawFundingPoint::at_millis(rate, util::now_ms()))
    }

    fn live_batch(&self) -> Option<&dyn LiveBatch> {
        Some(self)
    }
}

#[async_trait::async_trait]
impl LiveBatch for BinanceUsdmAdapter {
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
