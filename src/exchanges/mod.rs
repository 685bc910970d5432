//! Exchange adapter registry and factory
//!
//! This module provides:
//! - Central registration of all supported exchanges
//! - A factory function to resolve adapters by id
//!
//! All exchange-specific logic must live in dedicated adapter modules.
//! The rest of the application must interact exclusively through
//! the `ExchangeAdapter` trait.
//!
//! Module names equal exchange ids, so `DEBUG_EXCHANGES=okx` maps to the
//! log target `funding_collector::exchanges::okx`.

pub mod adapter;
pub mod http;
mod binance_coinm;
mod binance_usdm;
mod bybit;
mod hyperliquid;
mod okx;

use std::sync::Arc;

use adapter::ExchangeAdapter;
use reqwest::Client;

/// Every exchange id this build can collect, in canonical order.
pub const SUPPORTED: &[&str] = &["binance_coinm", "binance_usdm", "bybit", "hyperliquid", "okx"];

/// Returns an exchange adapter instance by id.
///
/// RETURNS:
/// - `Some(Arc<dyn ExchangeAdapter>)` if the exchange is supported
/// - `None` if the id is unknown
///
/// THREADING:
/// - Adapters are wrapped in `Arc` and share one HTTP client
///   (and therefore one connection pool)
pub fn get_adapter(name: &str, client: &Client) -> Option<Arc<dyn ExchangeAdapter>> {
    let client = client.clone();
    match name {
        "binance_coinm" => Some(Arc::new(binance_coinm::BinanceCoinmAdapter::new(client))),
        "binance_usdm" => Some(Arc::new(binance_usdm::BinanceUsdmAdapter::new(client))),
        "bybit" => Some(Arc::new(bybit::BybitAdapter::new(client))),
        "hyperliquid" => Some(Arc::new(hyperliquid::HyperliquidAdapter::new(client))),
        "okx" => Some(Arc::new(okx::OkxAdapter::new(client))),
        _ => None,
    }
}

/// Log target of an adapter module, used to raise verbosity per exchange.
pub fn log_target(name: &str) -> String {
    format!("{}::exchanges::{}", env!("CARGO_CRATE_NAME"), name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_supported_id_resolves_to_a_matching_adapter() {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let client = Client::new();
        for id in SUPPORTED {
            let adapter = get_adapter(id, &client).expect("registered");
            assert_eq!(adapter.name(), *id);
        }
        assert!(get_adapter("mtgox", &client).is_none());
    }

    #[test]
    fn supported_list_is_canonical() {
        let mut sorted = SUPPORTED.to_vec();
        sorted.sort();
        assert_eq!(sorted, SUPPORTED);
    }

    #[test]
    fn log_targets_follow_module_paths() {
        assert_eq!(log_target("okx"), "funding_collector::exchanges::okx");
    }
}
