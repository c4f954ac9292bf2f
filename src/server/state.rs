use crate::{
    cache::DownloadCache, config::Config, error::Result, metrics, upstream::Upstream,
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use std::time::Instant;

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<Config>,
    /// Shared upstream client for connection pooling
    pub upstream: Upstream,
    /// Cache directory and in-flight download registry
    pub cache: DownloadCache,
    /// Renders the `/metrics` endpoint
    pub metrics: PrometheusHandle,
    pub started_at: Instant,
}

impl AppState {
    /// Create a new AppState with the given configuration
    pub fn new(config: Config) -> Result<Self> {
        let upstream = Upstream::new(config.upstream_url.clone())?;
        let cache = DownloadCache::new(config.cache_dir.clone());

        Ok(Self {
            config: Arc::new(config),
            upstream,
            cache,
            metrics: metrics::init(),
            started_at: Instant::now(),
        })
    }
}
