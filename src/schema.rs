use std::fmt;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// ------------------------------------------------------------
// Contract identity
// ------------------------------------------------------------
//
// A perpetual contract is identified by asset/quote within one
// exchange. The exchange id is implicit inside a collection loop,
// so the key only carries the pair.
//
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContractKey {
    pub asset: String,
    pub quote: String,
}

impl ContractKey {
    pub fn new(asset: impl Into<String>, quote: impl Into<String>) -> Self {
        Self {
            asset: asset.into(),
            quote: quote.into(),
        }
    }
}

impl fmt::Display for ContractKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.asset, self.quote)
    }
}

// ------------------------------------------------------------
// Contract
// ------------------------------------------------------------
//
// Immutable once discovered. The set of contracts per exchange is
// refreshed periodically by the collection loop, never on every poll.
//
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contract {
    /// Exchange identifier (e.g. "bybit", "hyperliquid")
    pub exchange_id: String,

    /// Base asset in upper case (e.g. "BTC")
    pub asset: String,

    /// Quote / settlement asset (e.g. "USDT", "USD")
    pub quote: String,

    /// Time between two funding settlements
    #[serde(with = "interval_secs")]
    pub funding_interval: Duration,

    /// Exchange-native contract type, when the API reports one
    pub contract_type: Option<String>,

    /// Minimum price increment, when the API reports one
    pub tick_size: Option<Decimal>,
}

impl Contract {
    pub fn new(
        exchange_id: impl Into<String>,
        asset: impl Into<String>,
        quote: impl Into<String>,
        funding_interval: Duration,
    ) -> Self {
        Self {
            exchange_id: exchange_id.into(),
            asset: asset.into(),
            quote: quote.into(),
            funding_interval,
            contract_type: None,
            tick_size: None,
        }
    }

    pub fn with_contract_type(mut self, contract_type: impl Into<String>) -> Self {
        self.contract_type = Some(contract_type.into());
        self
    }

    pub fn with_tick_size(mut self, tick_size: Option<Decimal>) -> Self {
        self.tick_size = tick_size;
        self
    }

    pub fn key(&self) -> ContractKey {
        ContractKey::new(self.asset.clone(), self.quote.clone())
    }
}

impl fmt::Display for Contract {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.exchange_id, self.asset, self.quote)
    }
}

mod interval_secs {
    use chrono::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_i64(d.num_seconds())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::seconds(i64::deserialize(d)?))
    }
}

// ------------------------------------------------------------
// Funding record
// ------------------------------------------------------------
//
// Canonical record handed to the ingestion writer.
//
// Identity: (exchange_id, asset, quote, timestamp).
// The rate is a signed fraction (0.0001 == 0.01%).
//
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordSource {
    /// Settled rate from the exchange's funding history
    History,

    /// Latest unsettled rate observed while polling
    Live,
}

impl RecordSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordSource::History => "history",
            RecordSource::Live => "live",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundingRecord {
    pub exchange_id: String,
    pub asset: String,
    pub quote: String,

    /// UTC, millisecond precision
    pub timestamp: DateTime<Utc>,

    /// Signed fraction, never a percentage
    pub rate: Decimal,

    pub source: RecordSource,
}

impl FundingRecord {
    pub fn key(&self) -> ContractKey {
        ContractKey::new(self.asset.clone(), self.quote.clone())
    }
}

// ------------------------------------------------------------
// Raw adapter output
// ------------------------------------------------------------
//
// Adapters return rates and timestamps exactly as the exchange
// reports them. The rate normalizer turns these into FundingRecords.
//
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RateUnit {
    Fraction,
    Percent,
    BasisPoints,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawTime {
    UnixMillis(i64),
    UnixSeconds(i64),
    Rfc3339(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFundingPoint {
    pub rate: Decimal,
    pub time: RawTime,
}

impl RawFundingPoint {
    pub fn at_millis(rate: Decimal, ms: i64) -> Self {
        Self {
            rate,
            time: RawTime::UnixMillis(ms),
        }
    }
}
