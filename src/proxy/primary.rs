//! Serve the request that owns a new download.
//!
//! The upstream body is copied once into both the cache file and the client.
//! The two destinations are isolated: a client that goes away does not stop
//! the cache write, and a failing disk does not cut the client off. The
//! download runs in its own task from the upstream request on, so a client
//! that disconnects before headers arrive cancels nothing either.

use super::client::{self, ClientSink};
use crate::{
    cache::{
        EntryLease,
        sink::{BestEffortSink, ChunkSink, FanOut},
    },
    error::{ProxyError, Result},
    metrics,
    request::PackageRequest,
    upstream::{self, Upstream},
};
use axum::{
    http::{StatusCode, header},
    response::Response,
};
use futures_util::StreamExt;
use std::io;
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{error, info, warn};

pub async fn serve(
    upstream: &Upstream,
    req: PackageRequest,
    lease: EntryLease,
) -> Result<Response> {
    info!(file = %req.file, "Forwarding and saving to cache");
    let entry = Arc::clone(lease.entry());

    // The download outlives this handler: a client that goes away while
    // headers are pending drops only the response body
    let (sink, body) = client::channel();
    tokio::spawn(download(upstream.clone(), req, lease, sink));

    tokio::select! {
        _ = entry.started().wait() => {}
        _ = entry.completed().wait() => {}
    }
    match entry.headers() {
        Some(headers) => Ok(client::streaming_response(headers.clone(), body)),
        None => Err(ProxyError::DownloadFailed(
            entry.failure().unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        )),
    }
}

/// The whole primary lifecycle: fetch, publish headers, copy, commit.
async fn download(
    upstream: Upstream,
    req: PackageRequest,
    lease: EntryLease,
    client: ClientSink,
) {
    // On failure the lease drops here and the temporary file goes with it
    let response = match upstream.fetch(&req).await {
        Ok(response) => response,
        Err(e) => {
            lease.entry().record_failure(e.status_code());
            return;
        }
    };

    let modified = response
        .headers()
        .get(header::LAST_MODIFIED)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| httpdate::parse_http_date(value).ok());
    lease
        .entry()
        .publish_headers(upstream::mirrored_headers(response.headers()));

    let mut cache = BestEffortSink::new(lease.entry().file().clone());
    let mut client = BestEffortSink::new(client);
    let copied = copy_body(response, vec![&mut cache as &mut dyn ChunkSink, &mut client]).await;
    let copied_bytes = copied.as_ref().ok().copied();

    let cache_error = match copied {
        Err(e) => {
            client
                .get_mut()
                .abort(io::Error::new(e.kind(), "upstream transfer failed"))
                .await;
            Some(e)
        }
        Ok(_) => match cache.into_error() {
            Some(e) => Some(e),
            None => commit(&lease, modified).await.err(),
        },
    };
    let client_error = client.into_error();

    metrics::record_download(cache_error.is_none(), client_error.is_none());
    if let Some(bytes) = copied_bytes
        && client_error.is_none()
    {
        metrics::record_bytes_served("upstream", bytes);
    }

    match (cache_error, client_error) {
        (None, None) => info!(file = %req.file, "File cached and served successfully"),
        (None, Some(client_err)) => warn!(
            file = %req.file,
            "File cached successfully, but serving to the client failed: {}", client_err
        ),
        (Some(cache_err), None) => warn!(
            file = %req.file,
            "File served, but caching failed: {}", cache_err
        ),
        (Some(cache_err), Some(client_err)) => error!(
            file = %req.file,
            "File caching failed: {}; serving to the client failed: {}", cache_err, client_err
        ),
    }
    // `lease` drops last: `completed` fires only after the commit
}

/// Copy the upstream body into every sink.
///
/// Stops early only when every sink has given up. Returns the number of bytes
/// read from upstream.
async fn copy_body(
    response: reqwest::Response,
    sinks: Vec<&mut dyn ChunkSink>,
) -> io::Result<u64> {
    let mut fan_out = FanOut::new(sinks);
    let mut stream = response.bytes_stream();
    let mut copied = 0u64;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(io::Error::other)?;
        copied += chunk.len() as u64;
        fan_out.write_chunk(chunk).await?;
        if fan_out.is_closed() {
            break;
        }
    }
    Ok(copied)
}

/// Rename the temporary file into place and apply the upstream mtime.
async fn commit(lease: &EntryLease, modified: Option<SystemTime>) -> io::Result<()> {
    let entry = Arc::clone(lease.entry());
    tokio::task::spawn_blocking(move || entry.commit(modified))
        .await
        .map_err(io::Error::other)?
}
