use std::{env, fs, path::Path};

use serde::Deserialize;

use crate::{error::CollectorError, util};

// ------------------------------------------------------------
// Root configuration
// ------------------------------------------------------------
//
// Assembled at startup from two sources:
// - Environment variables (deployment: database, partitioning, logging)
// - An optional JSON tuning file (poller, store and health settings)
//
// Every tuning field has a default, so the JSON file may be absent
// or contain only the values being overridden.
//
#[derive(Debug, Clone)]
pub struct Config {
    /// Database connection string (`DB_CONNECTION`)
    pub db_connection: Option<String>,

    /// Exchanges to run (`EXCHANGES`); empty means all supported
    pub exchanges: Vec<String>,

    /// Number of horizontally scaled instances (`INSTANCE_COUNT`)
    pub instance_count: usize,

    /// This instance's slot, 0-based (`INSTANCE_INDEX`)
    pub instance_index: usize,

    /// Adapters whose logs are raised to debug (`DEBUG_EXCHANGES`).
    ///
    /// Affects verbosity only, never partitioning or polling.
    pub debug_exchanges: Vec<String>,

    /// Liveness file rewritten by the instance runner (`HEALTH_FILE`)
    pub health_file: Option<String>,

    pub tuning: Tuning,
}

// ------------------------------------------------------------
// JSON tuning file
// ------------------------------------------------------------
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Tuning {
    pub poller: PollerConfig,
    pub store: StoreConfig,
    pub health: HealthConfig,
}

// ------------------------------------------------------------
// Collection loop settings
// ------------------------------------------------------------
//
// The live cadence is the configured interval, shortened to the
// shortest funding interval of the exchange if that is smaller,
// but never below `min_poll_interval_secs` (rate-limit floor).
//
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    pub live_poll_interval_secs: u64,
    pub min_poll_interval_secs: u64,

    /// Upper bound for every single adapter call
    pub request_timeout_secs: u64,

    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,

    /// Consecutive failed cycles before the exchange loop stops
    pub max_consecutive_failures: u32,

    /// How often the contract list is re-discovered
    pub contract_refresh_secs: u64,

    /// Lookback for contracts with no stored history
    pub backfill_days: i64,

    /// Parallel single-contract live requests per exchange
    pub live_concurrency: usize,

    /// Random delay before a loop's first request
    pub startup_jitter_ms: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            live_poll_interval_secs: 60,
            min_poll_interval_secs: 10,
            request_timeout_secs: 30,
            backoff_base_ms: 1_000,
            backoff_max_ms: 300_000,
            max_consecutive_failures: 10,
            contract_refresh_secs: 3_600,
            backfill_days: 365,
            live_concurrency: 8,
            startup_jitter_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            acquire_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub interval_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self { interval_secs: 15 }
    }
}

impl Config {
    /// Loads `.env`, the process environment and the tuning file.
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let tuning = match env::var("COLLECTOR_CONFIG") {
            Ok(path) => load_tuning(&path)?,
            Err(_) if Path::new("config.json").exists() => load_tuning("config.json")?,
            Err(_) => Tuning::default(),
        };

        let cfg = Self::from_lookup(|key| env::var(key).ok(), tuning)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Builds a config from any key lookup (environment in production).
    pub fn from_lookup<F>(lookup: F, tuning: Tuning) -> Result<Self, CollectorError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let instance_count = parse_usize(&lookup, "INSTANCE_COUNT", 1)?;
        let instance_index = parse_usize(&lookup, "INSTANCE_INDEX", 0)?;

        Ok(Self {
            db_connection: lookup("DB_CONNECTION").filter(|s| !s.trim().is_empty()),
            exchanges: util::split_list(lookup("EXCHANGES").as_deref()),
            instance_count,
            instance_index,
            debug_exchanges: util::split_list(lookup("DEBUG_EXCHANGES").as_deref()),
            health_file: lookup("HEALTH_FILE").filter(|s| !s.trim().is_empty()),
            tuning,
        })
    }

    pub fn validate(&self) -> Result<(), CollectorError> {
        if self.instance_count == 0 {
            return Err(CollectorError::Config("INSTANCE_COUNT must be at least 1".into()));
        }
        if self.instance_index >= self.instance_count {
            return Err(CollectorError::Config(format!(
                "INSTANCE_INDEX {} must be below INSTANCE_COUNT {}",
                self.instance_index, self.instance_count
            )));
        }

        let p = &self.tuning.poller;
        if p.min_poll_interval_secs == 0 || p.live_poll_interval_secs == 0 {
            return Err(CollectorError::Config("poll intervals must be positive".into()));
        }
        if p.request_timeout_secs == 0 {
            return Err(CollectorError::Config("request_timeout_secs must be positive".into()));
        }
        if p.backoff_base_ms == 0 || p.backoff_max_ms < p.backoff_base_ms {
            return Err(CollectorError::Config(
                "backoff_max_ms must be at least backoff_base_ms (> 0)".into(),
            ));
        }
        if p.max_consecutive_failures == 0 || p.live_concurrency == 0 || p.backfill_days <= 0 {
            return Err(CollectorError::Config(
                "max_consecutive_failures, live_concurrency and backfill_days must be positive".into(),
            ));
        }
        if self.tuning.store.max_connections == 0 {
            return Err(CollectorError::Config("store.max_connections must be positive".into()));
        }
        Ok(())
    }
}

fn parse_usize<F>(lookup: &F, key: &str, default: usize) -> Result<usize, CollectorError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty()) {
        None => Ok(default),
        Some(v) => v
            .parse()
            .map_err(|_| CollectorError::Config(format!("{key} must be a non-negative integer, got {v:?}"))),
    }
}

// ------------------------------------------------------------
// Tuning file loader
// ------------------------------------------------------------
//
// Reads a JSON file from disk and deserializes it into `Tuning`.
// Unknown keys are ignored, missing keys take their defaults.
//
fn load_tuning(path: &str) -> anyhow::Result<Tuning> {
    let data = fs::read_to_string(path)?;
    let tuning = serde_json::from_str(&data)?;
    Ok(tuning)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from(vars: &[(&str, &str)]) -> Result<Config, CollectorError> {
        let vars: HashMap<String, String> =
            vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        let cfg = Config::from_lookup(|k| vars.get(k).cloned(), Tuning::default())?;
        cfg.validate()?;
        Ok(cfg)
    }

    #[test]
    fn defaults_apply_when_unset() {
        let cfg = from(&[("DB_CONNECTION", "postgres://localhost/funding")]).unwrap();
        assert_eq!(cfg.instance_count, 1);
        assert_eq!(cfg.instance_index, 0);
        assert!(cfg.exchanges.is_empty());
        assert!(cfg.debug_exchanges.is_empty());
        assert_eq!(cfg.tuning.poller.live_poll_interval_secs, 60);
    }

    #[test]
    fn lists_and_instance_slots_are_parsed() {
        let cfg = from(&[
            ("EXCHANGES", "okx, Bybit"),
            ("DEBUG_EXCHANGES", "okx"),
            ("INSTANCE_COUNT", "3"),
            ("INSTANCE_INDEX", "2"),
        ])
        .unwrap();
        assert_eq!(cfg.exchanges, vec!["okx", "bybit"]);
        assert_eq!(cfg.debug_exchanges, vec!["okx"]);
        assert_eq!((cfg.instance_count, cfg.instance_index), (3, 2));
    }

    #[test]
    fn invalid_instance_settings_are_rejected() {
        assert!(from(&[("INSTANCE_COUNT", "0")]).is_err());
        assert!(from(&[("INSTANCE_COUNT", "two")]).is_err());
        assert!(from(&[("INSTANCE_COUNT", "2"), ("INSTANCE_INDEX", "2")]).is_err());
    }

    #[test]
    fn tuning_file_overrides_only_given_fields() {
        let tuning: Tuning =
            serde_json::from_str(r#"{ "poller": { "backoff_max_ms": 5000 }, "unknown": 1 }"#).unwrap();
        assert_eq!(tuning.poller.backoff_max_ms, 5_000);
        assert_eq!(tuning.poller.backoff_base_ms, 1_000);
        assert_eq!(tuning.store.max_connections, 10);
    }

    #[test]
    fn backoff_cap_below_base_is_rejected() {
        let mut tuning = Tuning::default();
        tuning.poller.backoff_max_ms = 10;
        let cfg = Config::from_lookup(|_| None, tuning).unwrap();
        assert!(cfg.validate().is_err());
    }
}
