//! Ingestion writer: idempotent batch upserts into the time-series store.
//!
//! One call to [`FundingStore::write`] is one transaction. A batch is either
//! fully applied or not at all; callers retry the whole batch, never a part
//! of it.

use std::{collections::HashMap, sync::atomic::Ordering, time::Duration};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{PgPool, Row, postgres::PgPoolOptions};

use crate::{
    config::StoreConfig,
    error::CollectorResult,
    metrics::METRICS,
    normalizer,
    schema::{Contract, ContractKey, FundingRecord},
};

#[async_trait::async_trait]
pub trait FundingStore: Send + Sync {
    /// Upserts `records` keyed by (exchange_id, asset, quote, timestamp).
    ///
    /// The last write for a key wins on value. Returns the number of
    /// records written.
    async fn write(&self, records: &[FundingRecord]) -> CollectorResult<u64>;

    /// Latest settled (`history`) timestamp per contract of `exchange_id`.
    async fn latest_history(&self, exchange_id: &str) -> CollectorResult<HashMap<ContractKey, DateTime<Utc>>>;

    /// Records the currently listed contracts of `exchange_id`.
    async fn upsert_contracts(&self, exchange_id: &str, contracts: &[Contract]) -> CollectorResult<u64>;
}

const UPSERT_FUNDING: &str = r#"
    INSERT INTO funding_records (exchange_id, asset, quote, ts, rate, source)
    SELECT * FROM UNNEST($1::text[], $2::text[], $3::text[], $4::timestamptz[], $5::numeric[], $6::text[])
    ON CONFLICT (exchange_id, asset, quote, ts)
    DO UPDATE SET rate = EXCLUDED.rate, source = EXCLUDED.source, updated_at = now()
"#;

const LATEST_HISTORY: &str = r#"
    SELECT asset, quote, MAX(ts) AS last_ts
    FROM funding_records
    WHERE exchange_id = $1 AND source = 'history'
    GROUP BY asset, quote
"#;

const UPSERT_CONTRACTS: &str = r#"
    INSERT INTO contracts (exchange_id, asset, quote, funding_interval_secs, contract_type, tick_size, last_seen_at)
    SELECT e, a, q, i, t, s, now()
    FROM UNNEST($1::text[], $2::text[], $3::text[], $4::bigint[], $5::text[], $6::numeric[]) AS u(e, a, q, i, t, s)
    ON CONFLICT (exchange_id, asset, quote)
    DO UPDATE SET funding_interval_secs = EXCLUDED.funding_interval_secs,
                  contract_type = EXCLUDED.contract_type,
                  tick_size = EXCLUDED.tick_size,
                  last_seen_at = EXCLUDED.last_seen_at
"#;

/// Postgres-backed store.
///
/// The pool is shared by every collection loop of the instance; each
/// write holds one connection for the duration of its transaction only.
#[derive(Clone)]
pub struct PgFundingStore {
    pool: PgPool,
}

impl PgFundingStore {
    pub async fn connect(url: &str, cfg: &StoreConfig) -> CollectorResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(cfg.max_connections)
            .acquire_timeout(Duration::from_secs(cfg.acquire_timeout_secs))
            .connect(url)
            .await?;

        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait::async_trait]
impl FundingStore for PgFundingStore {
    async fn write(&self, records: &[FundingRecord]) -> CollectorResult<u64> {
        if records.is_empty() {
            return Ok(0);
        }

        // one statement may not touch the same row twice
        let records = normalizer::dedup_last_wins(records.to_vec());

        let n = records.len();
        let mut exchanges = Vec::with_capacity(n);
        let mut assets = Vec::with_capacity(n);
        let mut quotes = Vec::with_capacity(n);
        let mut timestamps = Vec::with_capacity(n);
        let mut rates: Vec<Decimal> = Vec::with_capacity(n);
        let mut sources = Vec::with_capacity(n);

        for r in records {
            exchanges.push(r.exchange_id);
            assets.push(r.asset);
            quotes.push(r.quote);
            timestamps.push(r.timestamp);
            rates.push(r.rate);
            sources.push(r.source.as_str().to_string());
        }

        // dropped without commit (error or cancellation) => rolled back
        let mut tx = self.pool.begin().await?;

        sqlx::query(UPSERT_FUNDING)
            .bind(exchanges)
            .bind(assets)
            .bind(quotes)
            .bind(timestamps)
            .bind(rates)
            .bind(sources)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        METRICS.write_batches.fetch_add(1, Ordering::Relaxed);
        METRICS.records_written.fetch_add(n, Ordering::Relaxed);
        Ok(n as u64)
    }

    async fn latest_history(&self, exchange_id: &str) -> CollectorResult<HashMap<ContractKey, DateTime<Utc>>> {
        let rows = sqlx::query(LATEST_HISTORY)
            .bind(exchange_id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| -> Result<(ContractKey, DateTime<Utc>), sqlx::Error> {
                let asset: String = row.try_get("asset")?;
                let quote: String = row.try_get("quote")?;
                let last: DateTime<Utc> = row.try_get("last_ts")?;
                Ok((ContractKey::new(asset, quote), last))
            })
            .collect::<Result<_, sqlx::Error>>()
            .map_err(Into::into)
    }

    async fn upsert_contracts(&self, exchange_id: &str, contracts: &[Contract]) -> CollectorResult<u64> {
        if contracts.is_empty() {
            return Ok(0);
        }

        let n = contracts.len();
        let exchanges = vec![exchange_id.to_string(); n];
        let assets: Vec<String> = contracts.iter().map(|c| c.asset.clone()).collect();
        let quotes: Vec<String> = contracts.iter().map(|c| c.quote.clone()).collect();
        let intervals: Vec<i64> = contracts.iter().map(|c| c.funding_interval.num_seconds()).collect();
        let types: Vec<Option<String>> = contracts.iter().map(|c| c.contract_type.clone()).collect();
        let ticks: Vec<Option<Decimal>> = contracts.iter().map(|c| c.tick_size).collect();

        let mut tx = self.pool.begin().await?;

        sqlx::query(UPSERT_CONTRACTS)
            .bind(exchanges)
            .bind(assets)
            .bind(quotes)
            .bind(intervals)
            .bind(types)
            .bind(ticks)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(n as u64)
    }
}


/// Runs against a migrated database:
/// `DB_CONNECTION=postgres://... cargo test -- --ignored`
#[cfg(test)]
mod pg_tests {
    use super::*;
    use crate::schema::RecordSource;

    async fn connect() -> Option<PgFundingStore> {
        let url = std::env::var("DB_CONNECTION").ok()?;
        let _ = rustls::crypto::ring::default_provider().install_default();
        Some(PgFundingStore::connect(&url, &StoreConfig::default()).await.unwrap())
    }

    fn record(exchange: &str, ts_ms: i64, rate: i64, source: RecordSource) -> FundingRecord {
        FundingRecord {
            exchange_id: exchange.into(),
            asset: "BTC".into(),
            quote: "USDT".into(),
            timestamp: crate::util::ms_to_datetime(ts_ms).unwrap(),
            rate: Decimal::new(rate, 6),
            source,
        }
    }

    async fn cleanup(store: &PgFundingStore, exchange: &str) {
        sqlx::query("DELETE FROM funding_records WHERE exchange_id = $1")
            .bind(exchange)
            .execute(&store.pool)
            .await
            .unwrap();
    }

    #[tokio::test]
    #[ignore = "needs DB_CONNECTION and a migrated schema"]
    async fn upsert_is_idempotent_and_last_write_wins() {
        let Some(store) = connect().await else { return };
        let exchange = format!("test_{}", std::process::id());
        cleanup(&store, &exchange).await;

        let base = 1_700_000_000_000;
        let first = vec![
            record(&exchange, base, 1, RecordSource::History),
            record(&exchange, base + 8 * 3_600_000, 2, RecordSource::History),
        ];
        store.write(&first).await.unwrap();
        store.write(&first).await.unwrap();
        store.write(&[record(&exchange, base, 7, RecordSource::Live)]).await.unwrap();

        let rows = sqlx::query("SELECT rate, source FROM funding_records WHERE exchange_id = $1 ORDER BY ts")
            .bind(&exchange)
            .fetch_all(&store.pool)
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get::<Decimal, _>("rate"), Decimal::new(7, 6));
        assert_eq!(rows[0].get::<String, _>("source"), "live");

        let latest = store.latest_history(&exchange).await.unwrap();
        assert_eq!(
            latest[&ContractKey::new("BTC", "USDT")].timestamp_millis(),
            base + 8 * 3_600_000
        );

        cleanup(&store, &exchange).await;
        store.close().await;
    }
}
