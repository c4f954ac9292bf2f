//! Upstream mirror access.
//!
//! One shared [`reqwest::Client`] for connection pooling. Fetches are single
//! attempts with no timeout: a download runs to completion or failure.

use crate::{
    error::{ProxyError, Result},
    metrics,
    request::PackageRequest,
};
use axum::http::{HeaderMap, header};
use reqwest::{Client, Response};
use std::time::Duration;
use tracing::{debug, warn};

/// Response headers copied from upstream onto the client response.
pub const MIRRORED_HEADERS: [header::HeaderName; 4] = [
    header::CONTENT_LENGTH,
    header::LAST_MODIFIED,
    header::ETAG,
    header::CONTENT_TYPE,
];

/// Client for the configured upstream mirror.
#[derive(Clone, Debug)]
pub struct Upstream {
    client: Client,
    template: String,
}

impl Upstream {
    /// Create an upstream client for the given URL template.
    ///
    /// # Errors
    /// Fails only if the TLS backend cannot be initialised.
    pub fn new(template: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(10)
            .build()?;

        Ok(Self {
            client,
            template: template.into(),
        })
    }

    pub fn url_for(&self, req: &PackageRequest) -> String {
        req.upstream_url(&self.template)
    }

    /// GET the file from upstream.
    ///
    /// Returns the response only for a 2xx status; the body is left unread so
    /// callers can stream it.
    ///
    /// # Errors
    /// [`ProxyError::UpstreamFetch`] on transport failure,
    /// [`ProxyError::UpstreamStatus`] carrying the upstream status otherwise.
    pub async fn fetch(&self, req: &PackageRequest) -> Result<Response> {
        let url = self.url_for(req);
        debug!(file = %req.file, url = %url, "Fetching from upstream");

        let response = match self.client.get(&url).send().await {
            Ok(response) => response,
            Err(e) => {
                warn!(file = %req.file, "Failed to query upstream: {}", e);
                metrics::record_upstream_fetch("error");
                return Err(ProxyError::UpstreamFetch(e));
            }
        };

        let status = response.status();
        if !status.is_success() {
            warn!(file = %req.file, "Upstream responded with {}", status);
            metrics::record_upstream_fetch("status");
            return Err(ProxyError::UpstreamStatus(status));
        }

        metrics::record_upstream_fetch("ok");
        Ok(response)
    }
}

/// Pick the allow-listed headers out of an upstream response.
pub fn mirrored_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for name in MIRRORED_HEADERS {
        if let Some(value) = upstream.get(&name) {
            headers.insert(name, value.clone());
        }
    }
    headers
}
