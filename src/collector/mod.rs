/// Collector module
///
/// This module groups all logic responsible for:
/// - Driving one collection loop per assigned exchange
/// - Supervising those loops and reporting instance health
///
/// The collector layer acts as the orchestration layer between:
/// - Exchange adapters (Hyperliquid, Bybit, Binance, OKX, …)
/// - The funding store (ingestion writer)
///
/// Design notes:
/// - Exchange-specific logic MUST NOT live here
/// - Loops never share mutable state; they meet only at the store
pub mod health;
pub mod poller;
pub mod runner;

#[cfg(test)]
pub mod testing;
