//! Rate normalizer: raw adapter output -> canonical `FundingRecord`s.
//!
//! Pure transformation, no I/O and no retries. Every failure is a
//! `CollectorError::Protocol` and propagates to the caller.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::{
    error::{CollectorError, CollectorResult},
    schema::{Contract, FundingRecord, RateUnit, RawFundingPoint, RawTime, RecordSource},
    util,
};

/// Converts an exchange-reported rate into a signed fraction.
pub fn to_fraction(rate: Decimal, unit: RateUnit) -> Decimal {
    match unit {
        RateUnit::Fraction => rate,
        RateUnit::Percent => rate / Decimal::ONE_HUNDRED,
        RateUnit::BasisPoints => rate / Decimal::from(10_000),
    }
}

/// Normalizes a raw timestamp to UTC with millisecond precision.
pub fn to_timestamp(time: &RawTime) -> CollectorResult<DateTime<Utc>> {
    let ms = match time {
        RawTime::UnixMillis(ms) => *ms,
        RawTime::UnixSeconds(s) => s
            .checked_mul(1000)
            .ok_or_else(|| CollectorError::protocol(format!("timestamp overflow: {s}s")))?,
        RawTime::Rfc3339(s) => DateTime::parse_from_rfc3339(s)
            .map_err(|e| CollectorError::protocol(format!("bad timestamp {s:?}: {e}")))?
            .timestamp_millis(),
    };

    if ms <= 0 {
        return Err(CollectorError::protocol(format!("non-positive timestamp: {ms}")));
    }

    util::ms_to_datetime(ms)
        .ok_or_else(|| CollectorError::protocol(format!("timestamp out of range: {ms}")))
}

/// Builds one canonical record for `contract`.
pub fn normalize_point(
    contract: &Contract,
    point: &RawFundingPoint,
    unit: RateUnit,
    source: RecordSource,
) -> CollectorResult<FundingRecord> {
    Ok(FundingRecord {
        exchange_id: contract.exchange_id.clone(),
        asset: contract.asset.clone(),
        quote: contract.quote.clone(),
        timestamp: to_timestamp(&point.time)?,
        rate: to_fraction(point.rate, unit),
        source,
    })
}

/// Normalizes a batch for one contract.
///
/// Records sharing a timestamp are de-duplicated (last one wins) and the
/// result is sorted ascending by timestamp.
pub fn normalize_batch(
    contract: &Contract,
    points: &[RawFundingPoint],
    unit: RateUnit,
    source: RecordSource,
) -> CollectorResult<Vec<FundingRecord>> {
    let records = points
        .iter()
        .map(|p| normalize_point(contract, p, unit, source))
        .collect::<CollectorResult<Vec<_>>>()?;

    Ok(dedup_last_wins(records))
}

/// De-duplicates records by identity, keeping the last occurrence.
///
/// Output is ordered by (exchange, asset, quote, timestamp) so that
/// writes per contract are issued in timestamp order.
pub fn dedup_last_wins(records: Vec<FundingRecord>) -> Vec<FundingRecord> {
    let mut by_identity: HashMap<(String, String, String, DateTime<Utc>), FundingRecord> =
        HashMap::with_capacity(records.len());

    for r in records {
        by_identity.insert(
            (r.exchange_id.clone(), r.asset.clone(), r.quote.clone(), r.timestamp),
            r,
        );
    }

    let mut out: Vec<FundingRecord> = by_identity.into_values().collect();
    out.sort_by(|a, b| {
        (&a.exchange_id, &a.asset, &a.quote, a.timestamp)
            .cmp(&(&b.exchange_id, &b.asset, &b.quote, b.timestamp))
    });
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn btc() -> Contract {
        Contract::new("bybit", "BTC", "USDT", Duration::hours(8))
    }

    #[test]
    fn percent_and_basis_points_become_fractions() {
        assert_eq!(to_fraction(dec("0.01"), RateUnit::Percent), dec("0.0001"));
        assert_eq!(to_fraction(dec("-2.5"), RateUnit::BasisPoints), dec("-0.00025"));
        assert_eq!(to_fraction(dec("0.0003"), RateUnit::Fraction), dec("0.0003"));
    }

    #[test]
    fn timestamps_agree_across_representations() {
        let ms = to_timestamp(&RawTime::UnixMillis(1_700_000_000_000)).unwrap();
        let s = to_timestamp(&RawTime::UnixSeconds(1_700_000_000)).unwrap();
        let rfc = to_timestamp(&RawTime::Rfc3339("2023-11-14T22:13:20Z".into())).unwrap();
        assert_eq!(ms, s);
        assert_eq!(ms, rfc);
    }

    #[test]
    fn invalid_timestamps_are_protocol_errors() {
        assert!(matches!(
            to_timestamp(&RawTime::Rfc3339("yesterday".into())),
            Err(CollectorError::Protocol(_))
        ));
        assert!(matches!(
            to_timestamp(&RawTime::UnixMillis(0)),
            Err(CollectorError::Protocol(_))
        ));
    }

    #[test]
    fn batch_dedups_last_wins_and_sorts() {
        let points = vec![
            RawFundingPoint::at_millis(dec("0.0002"), 1_700_000_000_000 + 28_800_000),
            RawFundingPoint::at_millis(dec("0.0001"), 1_700_000_000_000),
            RawFundingPoint::at_millis(dec("0.0005"), 1_700_000_000_000),
        ];

        let records =
            normalize_batch(&btc(), &points, RateUnit::Fraction, RecordSource::History).unwrap();

        assert_eq!(records.len(), 2);
        assert!(records[0].timestamp < records[1].timestamp);
        assert_eq!(records[0].rate, dec("0.0005"));
        assert_eq!(records[0].exchange_id, "bybit");
        assert_eq!(records[1].source, RecordSource::History);
    }

    #[test]
    fn one_bad_point_fails_the_batch() {
        let points = vec![
            RawFundingPoint::at_millis(dec("0.0001"), 1_700_000_000_000),
            RawFundingPoint {
                rate: dec("0.0001"),
                time: RawTime::Rfc3339("not a time".into()),
            },
        ];
        assert!(normalize_batch(&btc(), &points, RateUnit::Fraction, RecordSource::Live).is_err());
    }
}
