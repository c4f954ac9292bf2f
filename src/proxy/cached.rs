//! Serve a finished file from the cache directory.

use crate::{
    error::{ProxyError, Result},
    metrics,
    request::PackageRequest,
};
use axum::{
    body::Body,
    extract::Request,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use std::io;
use std::path::Path;
use tower::ServiceExt;
use tower_http::services::ServeFile;
use tracing::{error, info};

/// Serve with range and conditional-request handling; the file's mtime is
/// the `Last-Modified` value.
pub async fn serve(cache_dir: &Path, req: PackageRequest, request: Request) -> Result<Response> {
    info!(file = %req.file, "Serving cached file");
    let path = req.cache_path(cache_dir);

    let response = match ServeFile::new(&path).oneshot(request).await {
        Ok(response) => response,
        Err(never) => match never {},
    };

    // The file was on disk when the request was classified
    if response.status() == StatusCode::NOT_FOUND {
        error!(file = %req.file, "Failed to open cached file");
        return Err(ProxyError::io(
            path,
            io::Error::from(io::ErrorKind::NotFound),
        ));
    }

    if let Some(len) = response
        .headers()
        .get(axum::http::header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok())
    {
        metrics::record_bytes_served("cache", len);
    }

    Ok(response.map(Body::new).into_response())
}
