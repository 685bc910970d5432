use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use once_cell::sync::Lazy;

/// Global runtime metrics for the collector.
///
/// Purpose:
/// - Track active and stopped exchange loops
/// - Track request volume per kind
/// - Track ingestion throughput
/// - Track failures by taxonomy
///
/// Design:
/// - Lock-free (Atomics)
/// - Cheap to update
/// - Safe in async + multithreaded contexts
#[derive(Default)]
pub struct RuntimeMetrics {
    // Loops
    pub exchanges_active: AtomicUsize,
    pub exchanges_stopped: AtomicUsize,

    // Requests
    pub contract_requests: AtomicUsize,
    pub history_requests: AtomicUsize,
    pub live_requests: AtomicUsize,

    // Ingestion
    pub write_batches: AtomicUsize,
    pub records_written: AtomicUsize,

    // Failures
    pub transient_errors: AtomicUsize,
    pub protocol_errors: AtomicUsize,
    pub not_found: AtomicUsize,
    pub backoffs: AtomicUsize,
}

impl RuntimeMetrics {
    /// One-line summary for the periodic metrics log.
    pub fn summary(&self) -> String {
        let g = |c: &AtomicUsize| c.load(Ordering::Relaxed);
        format!(
            "ex={} stopped={} contracts_req={} history_req={} live_req={} batches={} written={} transient={} protocol={} not_found={} backoffs={}",
            g(&self.exchanges_active),
            g(&self.exchanges_stopped),
            g(&self.contract_requests),
            g(&self.history_requests),
            g(&self.live_requests),
            g(&self.write_batches),
            g(&self.records_written),
            g(&self.transient_errors),
            g(&self.protocol_errors),
            g(&self.not_found),
            g(&self.backoffs),
        )
    }
}

/// Global metrics registry (singleton)
pub static METRICS: Lazy<Arc<RuntimeMetrics>> =
    Lazy::new(|| Arc::new(RuntimeMetrics::default()));
