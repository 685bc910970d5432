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

const API_ENDPOINT: &str = "https://www.okx.com";

/// OKX v5 REST adapter (perpetual swaps)
///
/// - Instrument ids look like BTC-USDT-SWAP (linear) or BTC-USD-SWAP (inverse)
/// - The instruments endpoint does not report a funding interval;
///   swaps are assumed to settle every 8 hours
/// - Funding history pages hold at most 400 rows and are addressed with
///   `after` (older than) / `before` (newer than) cursors; at a 1h
///   worst-case interval one window spans 398 hours
/// - Live rates are fetched per instrument
pub struct OkxAdapter {
    client: Client,
}

impl OkxAdapter {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn format_symbol(contract: &Contract) -> String {
        format!("{}-{}-SWAP", contract.asset, contract.quote)
    }

    async fn get(&self, path: &str, params: &[(&str, String)]) -> CollectorResult<Value> {
        let v = http::get_json(&self.client, &format!("{API_ENDPOINT}{path}"), params).await?;
        check_code(v)
    }
}

/// OKX wraps every response in `{ code, msg, data }`.
fn check_code(v: Value) -> CollectorResult<Value> {
    let code = v["code"].as_str().unwrap_or("-1");
    let msg = v["msg"].as_str().unwrap_or_default();

    match code {
        "0" => Ok(v),
        // instrument doesn't exist
        "51001" => Err(CollectorError::not_found(format!("okx {code}: {msg}"))),
        // too many requests, system busy
        "50011" | "50013" | "50026" => Err(CollectorError::transient(format!("okx {code}: {msg}"))),
        _ => Err(CollectorError::protocol(format!("okx {code}: {msg}"))),
    }
}

fn data(v: &Value) -> CollectorResult<&Vec<Value>> {
    v["data"]
        .as_array()
        .ok_or_else(|| CollectorError::protocol("okx: missing data"))
}

fn parse_instrument(item: &Value) -> Option<Contract> {
    if item["state"].as_str().is_some_and(|s| s != "live") {
        return None;
    }

    let inst_id = item["instId"].as_str()?;
    let mut parts = inst_id.split('-');
    let (asset, quote) = (parts.next()?, parts.next()?);
    let tick_size = util::parse_decimal(&item["tickSz"]);

    Some(
        Contract::new("okx", asset, quote, Duration::hours(8))
            .with_contract_type(item["ctType"].as_str().unwrap_or("swap"))
            .with_tick_size(tick_size),
    )
}

#[async_trait::async_trait]
impl ExchangeAdapter for OkxAdapter {
    fn name(&self) -> &'static str {
        "okx"
    }

    fn history_window(&self) -> Duration {
        Duration::hours(398)
    }

    async fn get_contracts(&self) -> CollectorResult<Vec<Contract>> {
        let v = self
            .get("/api/v5/public/instruments", &[("instType", "SWAP".to_string())])
            .await?;

        let contracts: Vec<Contract> = data(&v)?.iter().filter_map(parse_instrument).collect();

        debug!("fetched {} contracts from {}", contracts.len(), self.name());
        Ok(contracts)
    }

    async fn fetch_history_window(
        &self,
        contract: &Contract,
        start_ms: i64,
        end_ms: i64,
    ) -> CollectorResult<Vec<RawFundingPoint>> {
        let inst_id = Self::format_symbol(contract);
        debug!("fetching history for {}/{} from {} to {}", self.name(), inst_id, start_ms, end_ms);

        // both cursors are exclusive
        let v = self
            .get(
                "/api/v5/public/funding-rate-history",
                &[
                    ("instId", inst_id.clone()),
                    ("before", (start_ms - 1).to_string()),
                    ("after", (end_ms + 1).to_string()),
                    ("limit", "400".to_string()),
                ],
            )
            .await?;

        let points = data(&v)?
            .iter()
            .map(|row| {
                // `realizedRate` is the settled value; fall back to the quoted one
                let rate = util::parse_decimal(&row["realizedRate"])
                    .or_else(|| util::parse_decimal(&row["fundingRate"]));
                match (rate, util::parse_i64(&row["fundingTime"])) {
                    (Some(rate), Some(ms)) => Ok(RawFundingPoint::at_millis(rate, ms)),
                    _ => Err(CollectorError::protocol(format!("okx funding history: bad row {row}"))),
                }
            })
            .collect::<CollectorResult<Vec<_>>>()?;

        debug!("fetched {} funding points for {}/{}", points.len(), self.name(), inst_id);
        Ok(points)
    }

    async fn fetch_live(&self, contract: &Contract) -> CollectorResult<RawFundingPoint> {
        let inst_id = Self::format_symbol(contract);
        debug!("fetching live rate for {inst_id}");

        let v = self
            .get("/api/v5/public/funding-rate", &[("instId", inst_id.clone())])
            .await?;

        let row = data(&v)?
            .first()
            .ok_or_else(|| CollectorError::not_found(format!("okx {inst_id}")))?;

        let rate = util::parse_decimal(&row["fundingRate"])
            .ok_or_else(|| CollectorError::protocol(format!("okx funding-rate {inst_id}: no fundingRate")))?;

        Ok(RawFundingPoint::at_millis(rate, util::now_ms()))
    }
}
