//! The proxy's metric surface. Every series the process emits is declared
//! and described here, and the routing code records through the helpers
//! below so that the label conventions live in exactly one place.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use tracing::{info, warn};

pub const CURR_CONNECTIONS: &str = "proxy_curr_connections";
pub const COM_LATENCY: &str = "proxy_com_latency";
pub const QUERIES_ROUTED: &str = "proxy_queries_routed";
pub const SESSION_HISTORY_LEN: &str = "proxy_session_history_len";
pub const POOL_REUSE: &str = "proxy_pool_reuse";
pub const CAUSAL_RETRIES: &str = "proxy_causal_read_retries";
pub const BACKEND_FAILURES: &str = "proxy_backend_failures";

/// Command latency buckets in milliseconds: COM_PING round trips on the low
/// end, LOAD DATA batches on the high end.
const LATENCY_BUCKETS_MS: &[f64] = &[
    0.5, 1.0, 2.5, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1e3, 2.5e3, 5e3, 1e4, 3e4,
];

static SCRAPE_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder and describe the proxy series. Safe to
/// call more than once; only the first call installs.
pub fn install() {
    if SCRAPE_HANDLE.get().is_some() {
        return;
    }
    let recorder = PrometheusBuilder::new()
        .set_buckets(LATENCY_BUCKETS_MS)
        .expect("latency bucket list is non-empty")
        .build_recorder();
    let handle = recorder.handle();
    match metrics::set_global_recorder(recorder) {
        Ok(_) => {
            let _ = SCRAPE_HANDLE.set(handle);
            describe_series();
            info!("RwProxy metrics recorder installed");
        }
        Err(e) => {
            warn!("RwProxy metrics recorder already set: {e:?}");
        }
    }
}

/// Handle for a scrape endpoint, once `install` has run.
pub fn scrape_handle() -> Option<PrometheusHandle> {
    SCRAPE_HANDLE.get().cloned()
}

fn describe_series() {
    describe_gauge!(CURR_CONNECTIONS, "Client connections currently served.");
    describe_histogram!(COM_LATENCY, "Per-command latency in milliseconds.");
    describe_counter!(QUERIES_ROUTED, "Routed packets, labelled by resolved target.");
    describe_gauge!(SESSION_HISTORY_LEN, "Session command history length after pruning.");
    describe_counter!(POOL_REUSE, "Pooled backend reuse, labelled by reuse mode.");
    describe_counter!(CAUSAL_RETRIES, "Causal reads retried on the primary after a wait timeout.");
    describe_counter!(BACKEND_FAILURES, "Backends torn down, labelled by server.");
}

/// The node identity every series carries.
fn node() -> &'static str {
    static NODE: OnceLock<String> = OnceLock::new();
    NODE.get_or_init(crate::hostname).as_str()
}

pub fn session_opened() {
    gauge!(CURR_CONNECTIONS, "node_name" => node()).increment(1.0);
}

pub fn session_closed() {
    gauge!(CURR_CONNECTIONS, "node_name" => node()).decrement(1.0);
}

pub fn query_routed(target: &'static str) {
    counter!(QUERIES_ROUTED, "target" => target, "node_name" => node()).increment(1);
}

pub fn history_len(len: usize) {
    gauge!(SESSION_HISTORY_LEN, "node_name" => node()).set(len as f64);
}

pub fn pool_reused(mode: &'static str) {
    counter!(POOL_REUSE, "mode" => mode, "node_name" => node()).increment(1);
}

pub fn causal_retry() {
    counter!(CAUSAL_RETRIES, "node_name" => node()).increment(1);
}

pub fn backend_failed(server: &str) {
    counter!(BACKEND_FAILURES, "server" => server.to_string(), "node_name" => node())
        .increment(1);
}

/// Measures one client command from routing to the final reply packet. The
/// observation happens on drop so early returns are still counted; a timer
/// for a command that should not be recorded is `discard`ed.
pub struct ComTimer {
    com: &'static str,
    started: coarsetime::Instant,
    observed: bool,
}

pub fn command_timer(com: &'static str) -> ComTimer {
    ComTimer {
        com,
        started: coarsetime::Instant::now(),
        observed: false,
    }
}

impl ComTimer {
    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis()
    }

    pub fn discard(mut self) {
        self.observed = true;
    }
}

impl Drop for ComTimer {
    fn drop(&mut self) {
        if !self.observed {
            histogram!(COM_LATENCY, "proxy_com" => self.com, "node_name" => node())
                .record(self.elapsed_ms() as f64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn helpers_never_panic() {
        session_opened();
        query_routed("slave");
        pool_reused("reset_connection");
        causal_retry();
        history_len(3);
        backend_failed("db-1");
        session_closed();
    }

    #[test]
    fn command_timer_records_on_drop() {
        let timer = command_timer("ComQuery");
        assert!(timer.elapsed_ms() < 1_000);
        drop(timer);
        // a discarded timer must not observe
        command_timer("ComPing").discard();
    }

    #[test]
    fn node_label_is_stable() {
        assert_eq!(node(), node());
    }

    #[test]
    fn install_is_idempotent() {
        install();
        install();
        assert!(scrape_handle().is_some());
    }
}
