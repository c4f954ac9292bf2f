//! Relay a file that is never cached (repository databases).

use super::client::{self, ClientSink};
use crate::{
    cache::sink::ChunkSink,
    error::Result,
    metrics,
    request::PackageRequest,
    upstream::{self, Upstream},
};
use axum::response::Response;
use futures_util::StreamExt;
use std::io;
use tracing::{info, warn};

pub async fn serve(upstream: &Upstream, req: PackageRequest) -> Result<Response> {
    info!(file = %req.file, "Forwarding uncacheable file");

    let response = upstream.fetch(&req).await?;
    let headers = upstream::mirrored_headers(response.headers());

    let (sink, body) = client::channel();
    tokio::spawn(async move {
        match relay(response, sink).await {
            Ok(bytes) => {
                metrics::record_bytes_served("passthrough", bytes);
                info!(file = %req.file, bytes, "Uncacheable file served successfully");
            }
            Err(e) => warn!(file = %req.file, "Uncacheable file not served: {}", e),
        }
    });

    Ok(client::streaming_response(headers, body))
}

async fn relay(response: reqwest::Response, mut client: ClientSink) -> io::Result<u64> {
    let mut stream = response.bytes_stream();
    let mut sent = 0u64;

    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                client
                    .abort(io::Error::other("upstream transfer failed"))
                    .await;
                return Err(io::Error::other(e));
            }
        };
        sent += client.write_chunk(chunk).await? as u64;
    }
    Ok(sent)
}
