use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

use crate::{
    error::CollectorResult,
    normalizer,
    schema::{Contract, ContractKey, RateUnit, RawFundingPoint},
};

/// Which live-fetch capability an adapter advertises.
///
/// The collection loop prefers `Batch` when present: one round trip for
/// every contract instead of one request per contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveCapability {
    /// Latest rate for many contracts in a single request
    Batch,

    /// One request per contract
    Single,
}

/// ExchangeAdapter is the core abstraction layer between:
/// - The generic collection loop
/// - Exchange-specific REST APIs
///
/// Each exchange implementation must:
/// - Enumerate its perpetual contracts
/// - Fetch funding history for one time window
/// - Fetch the latest (unsettled) rate for one contract
///
/// and may additionally expose a batch live fetch through
/// [`ExchangeAdapter::live_batch`].
///
/// DESIGN GOALS:
/// - Zero exchange-specific logic outside adapters
/// - One adapter per exchange
/// - Adapters return raw values; unit and timestamp normalization
///   happens in the rate normalizer
///
/// MUST NOT:
/// - Write to the store
/// - Retry (the collection loop owns retry and backoff)
///
/// THREAD SAFETY:
/// - Must be Send + Sync
/// - Adapter instances are shared across tasks
#[async_trait::async_trait]
pub trait ExchangeAdapter: Send + Sync {
    /// Returns the canonical exchange id.
    ///
    /// CONTRACT:
    /// - Lowercase, stable, matches the adapter module name
    /// - Used for partitioning, logging and storage identity
    fn name(&self) -> &'static str;

    /// Unit of the rates this exchange reports.
    fn rate_unit(&self) -> RateUnit {
        RateUnit::Fraction
    }

    /// Widest time window a single history request may cover without
    /// hitting the exchange's page limit at the shortest funding interval.
    fn history_window(&self) -> Duration;

    /// Enumerates currently tradable perpetual contracts.
    ///
    /// The result may change between calls (listings, delistings).
    async fn get_contracts(&self) -> CollectorResult<Vec<Contract>>;

    /// Fetches funding history for one window.
    ///
    /// `start_ms` and `end_ms` are passed to the exchange as-is; exchanges
    /// usually treat both bounds as inclusive. The result may be unordered
    /// and may contain points outside the window.
    async fn fetch_history_window(
        &self,
        contract: &Contract,
        start_ms: i64,
        end_ms: i64,
    ) -> CollectorResult<Vec<RawFundingPoint>>;

    /// Fetches all funding points for `contract` in `[since, until)`.
    ///
    /// Walks the range in windows of at most [`history_window`], keeps only
    /// points inside the half-open interval and returns them sorted
    /// ascending by timestamp. Calling again with `since` set past the last
    /// returned point neither repeats nor skips anything.
    ///
    /// [`history_window`]: ExchangeAdapter::history_window
    async fn fetch_history(
        &self,
        contract: &Contract,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> CollectorResult<Vec<RawFundingPoint>> {
        let since_ms = since.timestamp_millis();
        let until_ms = until.timestamp_millis();
        let step = self.history_window().num_milliseconds().max(1);

        let mut points: Vec<(i64, RawFundingPoint)> = Vec::new();
        let mut start = since_ms;

        while start < until_ms {
            let end = (start + step).min(until_ms);

            for p in self.fetch_history_window(contract, start, end - 1).await? {
                let ts = normalizer::to_timestamp(&p.time)?.timestamp_millis();
                if ts >= start && ts < end {
                    points.push((ts, p));
                }
            }

            start = end;
        }

        points.sort_by_key(|(ts, _)| *ts);
        Ok(points.into_iter().map(|(_, p)| p).collect())
    }

    /// Fetches the latest rate for a single contract.
    async fn fetch_live(&self, contract: &Contract) -> CollectorResult<RawFundingPoint>;

    /// Returns the batch live capability, if this exchange supports it.
    fn live_batch(&self) -> Option<&dyn LiveBatch> {
        None
    }

    fn live_capability(&self) -> LiveCapability {
        match self.live_batch() {
            Some(_) => LiveCapability::Batch,
            None => LiveCapability::Single,
        }
    }
}

/// Optional capability: latest rates for many contracts in one round trip.
#[async_trait::async_trait]
pub trait LiveBatch: Send + Sync {
    /// Returns at most one point per requested contract.
    ///
    /// Contracts the exchange no longer lists are simply absent from the
    /// result.
    async fn fetch_live_batch(
        &self,
        contracts: &[Contract],
    ) -> CollectorResult<HashMap<ContractKey, RawFundingPoint>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        collector::testing::{Call, ScriptedAdapter, contract},
        util,
    };
    use rust_decimal::Decimal;

    const HOUR: i64 = 3_600_000;

    fn adapter_with(points: &[i64]) -> ScriptedAdapter {
        ScriptedAdapter::new("okx", false, vec![contract("okx", "BTC", 8)]).with_history(
            ContractKey::new("BTC", "USDT"),
            points.iter().map(|ts| (*ts, Decimal::new(*ts % 97, 6))).collect(),
        )
    }

    fn millis(points: &[RawFundingPoint]) -> Vec<i64> {
        points
            .iter()
            .map(|p| normalizer::to_timestamp(&p.time).unwrap().timestamp_millis())
            .collect()
    }

    fn at(ms: i64) -> DateTime<Utc> {
        util::ms_to_datetime(ms).unwrap()
    }

    #[tokio::test]
    async fn history_is_half_open_sorted_and_spans_many_windows() {
        let t0 = 1_700_000_000_000;
        // every 8h for 20 days, unordered as some APIs return them
        let mut points: Vec<i64> = (0..60).map(|i| t0 + i * 8 * HOUR).collect();
        points.reverse();
        let adapter = adapter_with(&points);
        let btc = contract("okx", "BTC", 8);

        let until = t0 + 40 * 8 * HOUR;
        let got = millis(&adapter.fetch_history(&btc, at(t0), at(until)).await.unwrap());

        let expected: Vec<i64> = (0..40).map(|i| t0 + i * 8 * HOUR).collect();
        assert_eq!(got, expected);

        // 2-day windows, no window wider than declared
        let windows: Vec<(i64, i64)> = adapter
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::History { start_ms, end_ms, .. } => Some((start_ms, end_ms)),
                _ => None,
            })
            .collect();
        assert!(windows.len() > 1);
        assert!(windows.iter().all(|(s, e)| e - s < 48 * HOUR));
        assert!(windows.windows(2).all(|w| w[1].0 == w[0].1 + 1));
    }

    #[tokio::test]
    async fn resuming_mid_range_neither_repeats_nor_skips() {
        let t1 = 1_700_000_000_000;
        let points: Vec<i64> = (0..30).map(|i| t1 + i * 8 * HOUR).collect();
        let adapter = adapter_with(&points);
        let btc = contract("okx", "BTC", 8);

        let t3 = t1 + 30 * 8 * HOUR;
        let t2 = t1 + 11 * 8 * HOUR + HOUR;

        let full = millis(&adapter.fetch_history(&btc, at(t1), at(t3)).await.unwrap());
        let first = millis(&adapter.fetch_history(&btc, at(t1), at(t2)).await.unwrap());
        let rest = millis(&adapter.fetch_history(&btc, at(t2), at(t3)).await.unwrap());

        let mut joined = first.clone();
        joined.extend(&rest);
        assert_eq!(joined, full);

        // resuming right after the last returned point
        let last = *first.last().unwrap();
        let resumed = millis(&adapter.fetch_history(&btc, at(last + 1), at(t3)).await.unwrap());
        assert_eq!(resumed, rest);
    }

    #[tokio::test]
    async fn empty_range_makes_no_requests() {
        let adapter = adapter_with(&[]);
        let btc = contract("okx", "BTC", 8);
        let t = at(1_700_000_000_000);

        assert!(adapter.fetch_history(&btc, t, t).await.unwrap().is_empty());
        assert!(adapter.calls().is_empty());
    }

    #[test]
    fn capability_follows_the_batch_hook() {
        let single = ScriptedAdapter::new("okx", false, Vec::new());
        let batch = ScriptedAdapter::new("hyperliquid", true, Vec::new());
        assert_eq!(single.live_capability(), LiveCapability::Single);
        assert_eq!(batch.live_capability(), LiveCapability::Batch);
    }
}
