use std::collections::HashMap;

use chrono::Duration;
use log::debug;
use reqwest::Client;
use serde_json::{Value, json};

use crate::{
    error::{CollectorError, CollectorResult},
    schema::{Contract, ContractKey, RawFundingPoint},
    util,
};

use super::{
    adapter::{ExchangeAdapter, LiveBatch},
    http,
};

const API_ENDPOINT: &str = "https://api.hyperliquid.xyz/info";

/// Hyperliquid REST adapter
///
/// All requests are POSTs to a single `/info` endpoint with a `type` tag.
///
/// - Funding settles every hour, every perp is quoted in USD
/// - `fundingHistory` returns at most 500 rows, so one window spans
///   498 hours (two rows of headroom)
/// - `metaAndAssetCtxs` carries the current rate of every perp
pub struct HyperliquidAdapter {
    client: Client,
}

impl HyperliquidAdapter {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn info(&self, body: Value) -> CollectorResult<Value> {
        http::post_json(&self.client, API_ENDPOINT, &body).await
    }
}

#[async_trait::async_trait]
impl ExchangeAdapter for HyperliquidAdapter {
    fn name(&self) -> &'static str {
        "hyperliquid"
    }

    fn history_window(&self) -> Duration {
        Duration::hours(498)
    }

    async fn get_contracts(&self) -> CollectorResult<Vec<Contract>> {
        let v = self.info(json!({ "type": "meta" })).await?;

        let universe = v["universe"]
            .as_array()
            .ok_or_else(|| CollectorError::protocol("hyperliquid meta: missing universe"))?;

        let contracts: Vec<Contract> = universe
            .iter()
            .filter(|listing| !listing["isDelisted"].as_bool().unwrap_or(false))
            .filter_map(|listing| listing["name"].as_str())
            .map(|name| {
                Contract::new(self.name(), name, "USD", Duration::hours(1))
                    .with_contract_type("perpetual")
            })
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
        debug!(
            "fetching history for {}/{} from {} to {}",
            self.name(), contract.asset, start_ms, end_ms
        );

        let v = self
            .info(json!({
                "type": "fundingHistory",
                "coin": contract.asset,
                "startTime": start_ms,
                "endTime": end_ms,
            }))
            .await?;

        // unknown coins come back as `null` rather than an error
        let rows = match v {
            Value::Array(rows) => rows,
            Value::Null => {
                return Err(CollectorError::not_found(format!("hyperliquid {}", contract.asset)));
            }
            other => {
                return Err(CollectorError::protocol(format!(
                    "hyperliquid fundingHistory: expected array, got {other}"
                )));
            }
        };

        let points = rows
            .iter()
            .map(|row| {
                let rate = util::parse_decimal(&row["fundingRate"]);
                let time = util::parse_i64(&row["time"]);
                match (rate, time) {
                    (Some(rate), Some(ms)) => Ok(RawFundingPoint::at_millis(rate, ms)),
                    _ => Err(CollectorError::protocol(format!(
                        "hyperliquid fundingHistory: bad row {row}"
                    ))),
                }
            })
            .collect::<CollectorResult<Vec<_>>>()?;

        debug!("fetched {} funding points for {}/{}", points.len(), self.name(), contract.asset);
        Ok(points)
    }

    async fn fetch_live(&self, contract: &Contract) -> CollectorResult<RawFundingPoint> {
        let mut rates = self.fetch_live_batch(std::slice::from_ref(contract)).await?;
        rates
            .remove(&contract.key())
            .ok_or_else(|| CollectorError::not_found(format!("hyperliquid {}", contract.asset)))
    }

    fn live_batch(&self) -> Option<&dyn LiveBatch> {
        Some(self)
    }
}

#[async_trait::async_trait]
impl LiveBatch for HyperliquidAdapter {
    async fn fetch_live_batch(
        &self,
        contracts: &[Contract],
    ) -> CollectorResult<HashMap<ContractKey, RawFundingPoint>> {
        debug!("fetching live rates batch from hyperliquid");

        let v = self.info(json!({ "type": "metaAndAssetCtxs" })).await?;
        let now = util::now_ms();
        let rates = parse_asset_ctxs(&v, now)?;

        let out: HashMap<ContractKey, RawFundingPoint> = contracts
            .iter()
            .filter_map(|c| rates.get(&c.asset).map(|p| (c.key(), p.clone())))
            .collect();

        debug!("matched {} of {} live rates from hyperliquid", out.len(), rates.len());
        Ok(out)
    }
}

/// Parses `[meta, assetCtxs]`: contexts line up with `meta.universe` by index.
fn parse_asset_ctxs(v: &Value, now_ms: i64) -> CollectorResult<HashMap<String, RawFundingPoint>> {
    let universe = v[0]["universe"]
        .as_array()
        .ok_or_else(|| CollectorError::protocol("hyperliquid metaAndAssetCtxs: missing universe"))?;
    let ctxs = v[1]
        .as_array()
        .ok_or_else(|| CollectorError::protocol("hyperliquid metaAndAssetCtxs: missing contexts"))?;

    Ok(universe
        .iter()
        .zip(ctxs)
        .filter_map(|(asset, ctx)| {
            let name = asset["name"].as_str()?;
            let rate = util::parse_decimal(&ctx["funding"])?;
            Some((name.to_string(), RawFundingPoint::at_millis(rate, now_ms)))
        })
        .collect())
}
