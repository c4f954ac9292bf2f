//! Package request routing.
//!
//! Each request is classified exactly once and then handed to the matching
//! strategy: serve from disk, forward without caching, download as primary,
//! or tail a download already in flight.

pub mod cached;
pub mod client;
pub mod follower;
pub mod passthrough;
pub mod primary;

use crate::{
    cache::FileStatus, error::Result, metrics, request::PackageRequest,
    server::state::AppState,
};
use axum::{extract::Request, response::Response};
use tracing::debug;

/// Route one GET request for `/{repo}/{os}/{arch}/{file}`.
pub async fn handle(state: &AppState, request: Request) -> Result<Response> {
    let req = PackageRequest::parse(request.uri().path())?;
    let status = state.cache.classify(&req)?;
    debug!(file = %req.file, status = status.label(), "Request classified");
    metrics::record_request(status.label());

    match status {
        FileStatus::NoCaching => passthrough::serve(&state.upstream, req).await,
        FileStatus::Cached => cached::serve(state.cache.dir(), req, request).await,
        FileStatus::Missing(lease) => primary::serve(&state.upstream, req, lease).await,
        FileStatus::InDownload(lease) => {
            follower::serve(req, lease, state.config.poll_interval).await
        }
    }
}
