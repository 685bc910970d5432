use chrono::Duration;
use log::debug;
use reqwest::Client;
use serde_json::Value;

use crate::{
    error::{CollectorError, CollectorResult},
    schema::{Contract, RawFundingPoint},
    util,
};

use super::{adapter::ExchangeAdapter, http};

const API_ENDPOINT: &str = "https://api.bybit.com";

/// Bybit v5 REST adapter (linear perpetuals)
///
/// - USDT and USDC perpetuals; USDC symbols use the `PERP` suffix
///   (BTCUSDT, BTCPERP)
/// - Funding interval is reported per instrument, in minutes
/// - Funding history returns at most 200 rows; at the 1h minimum
///   interval a window spans 198 hours
/// - No batch live endpoint is used: tickers are fetched per symbol
pub struct BybitAdapter {
    client: Client,
}

impl BybitAdapter {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn format_symbol(contract: &Contract) -> String {
        let suffix = match contract.quote.as_str() {
            "USDC" => "PERP",
            other => other,
        };
        format!("{}{}", contract.asset, suffix)
    }

    async fn get(&self, path: &str, params: &[(&str, String)]) -> CollectorResult<Value> {
        let v = http::get_json(&self.client, &format!("{API_ENDPOINT}{path}"), params).await?;
        check_ret_code(v)
    }
}

/// Bybit answers HTTP 200 with a non-zero `retCode` on logical errors.
fn check_ret_code(v: Value) -> CollectorResult<Value> {
    let code = v["retCode"].as_i64().unwrap_or(-1);
    let msg = v["retMsg"].as_str().unwrap_or_default();

    match code {
        0 => Ok(v),
        // rate limit, server busy
        10006 | 10016 | 10018 => Err(CollectorError::transient(format!("bybit {code}: {msg}"))),
        // params error: symbol invalid / not supported
        10001 if msg.to_lowercase().contains("symbol") => {
            Err(CollectorError::not_found(format!("bybit {code}: {msg}")))
        }
        _ => Err(CollectorError::protocol(format!("bybit {code}: {msg}"))),
    }
}

fn result_list(v: &Value) -> CollectorResult<&Vec<Value>> {
    v["result"]["list"]
        .as_array()
        .ok_or_else(|| CollectorError::protocol("bybit: missing result.list"))
}

fn parse_instrument(item: &Value) -> Option<Contract> {
    if item["contractType"].as_str()? != "LinearPerpetual" {
        return None;
    }
    if item["status"].as_str().is_some_and(|s| s != "Trading") {
        return None;
    }

    let minutes = util::parse_i64(&item["fundingInterval"]).filter(|m| *m > 0)?;
    let tick_size = util::parse_decimal(&item["priceFilter"]["tickSize"]);

    Some(
        Contract::new(
            "bybit",
            item["baseCoin"].as_str()?,
            item["quoteCoin"].as_str()?,
            Duration::minutes(minutes),
        )
        .with_contract_type("LinearPerpetual")
        .with_tick_size(tick_size),
    )
}

#[async_trait::async_trait]
impl ExchangeAdapter for BybitAdapter {
    fn name(&self) -> &'static str {
        "bybit"
    }

    fn history_window(&self) -> Duration {
        Duration::hours(198)
    }

    async fn get_contracts(&self) -> CollectorResult<Vec<Contract>> {
        let mut contracts = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let mut params = vec![
                ("category", "linear".to_string()),
                ("limit", "1000".to_string()),
            ];
            if let Some(c) = &cursor {
                params.push(("cursor", c.clone()));
            }

            let v = self.get("/v5/market/instruments-info", &params).await?;
            contracts.extend(result_list(&v)?.iter().filter_map(parse_instrument));

            cursor = v["result"]["nextPageCursor"]
                .as_str()
                .filter(|c| !c.is_empty())
                .map(str::to_string);

            if cursor.is_none() {
                break;
            }
        }

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
                "/v5/market/funding/history",
                &[
                    ("category", "linear".to_string()),
                    ("symbol", symbol.clone()),
                    ("startTime", start_ms.to_string()),
                    ("endTime", end_ms.to_string()),
                    ("limit", "200".to_string()),
                ],
            )
            .await?;

        let points = result_list(&v)?
            .iter()
            .map(|row| {
                match (
                    util::parse_decimal(&row["fundingRate"]),
                    util::parse_i64(&row["fundingRateTimestamp"]),
                ) {
                    (Some(rate), Some(ms)) => Ok(RawFundingPoint::at_millis(rate, ms)),
                    _ => Err(CollectorError::protocol(format!("bybit funding history: bad row {row}"))),
                }
            })
            .collect::<CollectorResult<Vec<_>>>()?;

        debug!("fetched {} funding points for {}/{}", points.len(), self.name(), symbol);
        Ok(points)
    }

    async fn fetch_live(&self, contract: &Contract) -> CollectorResult<RawFundingPoint> {
        let symbol = Self::format_symbol(contract);
        debug!("fetching live rate for {symbol}");

        let v = self
            .get(
                "/v5/market/tickers",
                &[("category", "linear".to_string()), ("symbol", symbol.clone())],
            )
            .await?;

        let ticker = result_list(&v)?
            .first()
            .ok_or_else(|| CollectorError::not_found(format!("bybit {symbol}")))?;

        let rate = util::parse_decimal(&ticker["fundingRate"])
            .ok_or_else(|| CollectorError::protocol(format!("bybit ticker {symbol}: no fundingRate")))?;

        Ok(RawFundingPoint::at_millis(rate, util::now_ms()))
    }
}
