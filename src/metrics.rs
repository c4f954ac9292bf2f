//! Prometheus counters for proxy activity.

use metrics::counter;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder (once per process) and return its handle.
pub fn init() -> PrometheusHandle {
    HANDLE
        .get_or_init(|| {
            let recorder = PrometheusBuilder::new().build_recorder();
            let handle = recorder.handle();
            // Another recorder may already be installed (e.g. in tests); the
            // handle then simply renders nothing.
            let _ = metrics::set_global_recorder(recorder);
            handle
        })
        .clone()
}

/// Count a classified package request (`cached`, `in_download`, ...).
pub fn record_request(status: &'static str) {
    counter!("pkgproxy_requests_total", "status" => status).increment(1);
}

/// Count an upstream fetch by outcome (`ok`, `status`, `error`).
pub fn record_upstream_fetch(outcome: &'static str) {
    counter!("pkgproxy_upstream_fetches_total", "outcome" => outcome).increment(1);
}

/// Count a finished primary download by cache and client outcome.
pub fn record_download(cache_ok: bool, client_ok: bool) {
    counter!(
        "pkgproxy_downloads_total",
        "cache" => if cache_ok { "ok" } else { "failed" },
        "client" => if client_ok { "ok" } else { "failed" }
    )
    .increment(1);
}

/// Count bytes handed to clients, by where they came from.
pub fn record_bytes_served(source: &'static str, bytes: u64) {
    counter!("pkgproxy_bytes_served_total", "source" => source).increment(bytes);
}
