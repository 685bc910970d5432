//! One-off verification of a single exchange adapter.
//!
//! Exercises every adapter operation against the live exchange API and
//! prints what came back. Nothing is written to the store.

use std::time::Duration;

use chrono::Duration as ChronoDuration;
use reqwest::Client;
use rust_decimal::Decimal;

use crate::{
    collector::poller::with_timeout,
    error::{CollectorError, CollectorResult},
    exchanges::{self, adapter::ExchangeAdapter},
    normalizer,
    schema::{Contract, FundingRecord, RecordSource},
    util,
};

const STEPS: usize = 4;
const HISTORY_DAYS: i64 = 7;

/// Verifies the adapter registered as `exchange`. Returns true on pass.
pub async fn run(exchange: &str, client: &Client, request_timeout: Duration) -> bool {
    println!("Verifying adapter '{}'", exchange);

    let Some(adapter) = exchanges::get_adapter(exchange, client) else {
        println!(
            "[1/{STEPS}] resolve adapter ... FAILED: unknown exchange (supported: {})",
            exchanges::SUPPORTED.join(", ")
        );
        return false;
    };

    let passed = verify_adapter(adapter.as_ref(), request_timeout).await;
    println!("{}", if passed { "PASS" } else { "FAIL" });
    passed
}

pub async fn verify_adapter(adapter: &dyn ExchangeAdapter, request_timeout: Duration) -> bool {
    // --------------------------------------------------------
    // 1. Capabilities
    // --------------------------------------------------------
    println!(
        "[1/{STEPS}] resolve adapter ... OK (live capability: {:?}, history window: {}h)",
        adapter.live_capability(),
        adapter.history_window().num_hours()
    );

    // --------------------------------------------------------
    // 2. Contract discovery
    // --------------------------------------------------------
    let Some(mut contracts) = step(2, "get_contracts", with_timeout(request_timeout, adapter.get_contracts()).await)
    else {
        return false;
    };
    if contracts.is_empty() {
        println!("[2/{STEPS}] get_contracts ... FAILED: no contracts listed");
        return false;
    }
    contracts.sort_by(|a, b| a.key().cmp(&b.key()));
    println!("[2/{STEPS}] get_contracts ... OK ({} contracts)", contracts.len());
    print_contracts(&contracts[..contracts.len().min(5)]);

    let probe = contracts
        .iter()
        .find(|c| c.asset == "BTC")
        .unwrap_or(&contracts[0])
        .clone();

    // --------------------------------------------------------
    // 3. Settled history
    // --------------------------------------------------------
    let until = util::now_utc();
    let since = until - ChronoDuration::days(HISTORY_DAYS);
    let history = with_timeout(request_timeout * 4, adapter.fetch_history(&probe, since, until))
        .await
        .and_then(|raw| normalizer::normalize_batch(&probe, &raw, adapter.rate_unit(), RecordSource::History));

    let Some(history) = step(3, "fetch_history", history) else {
        return false;
    };
    let (Some(first), Some(last)) = (history.first(), history.last()) else {
        println!("[3/{STEPS}] fetch_history ... FAILED: no records for {probe} in the last {HISTORY_DAYS} days");
        return false;
    };
    println!(
        "[3/{STEPS}] fetch_history ... OK ({} records for {}, {} .. {})",
        history.len(),
        probe,
        first.timestamp,
        last.timestamp
    );
    print_sample(last);

    // --------------------------------------------------------
    // 4. Live rate
    // --------------------------------------------------------
    let unit = adapter.rate_unit();
    let live: CollectorResult<FundingRecord> = match adapter.live_batch() {
        Some(batch) => match with_timeout(request_timeout, batch.fetch_live_batch(&contracts)).await {
            Ok(points) => {
                println!("      batch returned {} of {} contracts", points.len(), contracts.len());
                match points.get(&probe.key()) {
                    Some(point) => normalizer::normalize_point(&probe, point, unit, RecordSource::Live),
                    None => Err(CollectorError::not_found(format!("{probe} missing from batch"))),
                }
            }
            Err(e) => Err(e),
        },
        None => with_timeout(request_timeout, adapter.fetch_live(&probe))
            .await
            .and_then(|point| normalizer::normalize_point(&probe, &point, unit, RecordSource::Live)),
    };

    let Some(live) = step(4, "fetch_live", live) else {
        return false;
    };
    println!("[4/{STEPS}] fetch_live ... OK ({})", probe);
    print_sample(&live);

    true
}

fn step<T>(n: usize, name: &str, result: CollectorResult<T>) -> Option<T> {
    match result {
        Ok(v) => Some(v),
        Err(e) => {
            println!("[{n}/{STEPS}] {name} ... FAILED: {e}");
            None
        }
    }
}

fn print_contracts(contracts: &[Contract]) {
    println!("      {:<12} {:<6} {:>9}", "ASSET", "QUOTE", "INTERVAL");
    for c in contracts {
        println!(
            "      {:<12} {:<6} {:>8}h",
            c.asset,
            c.quote,
            c.funding_interval.num_hours()
        );
    }
}

fn print_sample(record: &FundingRecord) {
    println!(
        "      {} rate={} ({}%)",
        record.timestamp,
        record.rate.normalize(),
        (record.rate * Decimal::ONE_HUNDRED).normalize()
    );
}
