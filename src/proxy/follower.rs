//! Serve a request that joined a download already in progress.
//!
//! The follower waits for the primary to publish headers, then polls the
//! growing file and streams every new byte range until the primary is done.

use super::client;
use crate::{
    cache::{EntryLease, entry::CacheEntry, sink::ChunkSink},
    error::{ProxyError, Result},
    metrics,
    request::PackageRequest,
};
use axum::response::Response;
use std::io;
use std::time::Duration;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{info, warn};

/// Largest single read from the growing file.
const READ_CHUNK_SIZE: usize = 64 * 1024;

pub async fn serve(req: PackageRequest, lease: EntryLease, poll: Duration) -> Result<Response> {
    info!(file = %req.file, "Forwarding file in download");
    let entry = lease.entry();

    tokio::select! {
        _ = entry.started().wait() => {}
        _ = entry.completed().wait() => {}
    }
    // Completion without headers means the primary never got a usable response
    let Some(headers) = entry.headers().cloned() else {
        warn!(file = %req.file, "Download ended before it started");
        return Err(ProxyError::DownloadAborted);
    };

    let (mut sink, body) = client::channel();
    tokio::spawn(async move {
        match tail(lease.entry(), &mut sink, poll).await {
            Ok(sent) => {
                metrics::record_bytes_served("follower", sent);
                info!(file = %req.file, bytes = sent, "File in download served");
            }
            Err(e) => warn!(file = %req.file, "Error while serving file in download: {}", e),
        }
    });

    Ok(client::streaming_response(headers, body))
}

/// Stream `entry`'s file to `sink` as it grows, until `completed` fires.
///
/// Returns the number of bytes sent. Each byte is sent exactly once, in order;
/// after completion a final check picks up whatever was written last.
pub async fn tail(
    entry: &CacheEntry,
    sink: &mut dyn ChunkSink,
    poll: Duration,
) -> io::Result<u64> {
    let mut ticker = interval(poll);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut offset = 0u64;

    loop {
        let done = tokio::select! {
            _ = entry.completed().wait() => true,
            _ = ticker.tick() => false,
        };

        let len = entry.file().len().await?;
        while offset < len {
            let n = (len - offset).min(READ_CHUNK_SIZE as u64) as usize;
            let chunk = entry.file().read_at(offset, n).await?;
            sink.write_chunk(chunk).await?;
            offset += n as u64;
        }

        if done {
            return Ok(offset);
        }
    }
}
