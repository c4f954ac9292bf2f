//! Streaming response bodies fed from a background task.
//!
//! The body is a bounded channel. A client that reads slowly holds back its
//! producer, which for a primary download is the shared copy loop. A client
//! that accepts nothing for [`CLIENT_SEND_TIMEOUT`] is treated as gone, so a
//! stalled connection delays the cache write and the followers by at most
//! that long before it is dropped from the fan-out.

use crate::cache::sink::ChunkSink;
use async_trait::async_trait;
use axum::{
    body::Body,
    http::{HeaderMap, StatusCode},
    response::Response,
};
use bytes::Bytes;
use futures_util::stream;
use std::io;
use std::time::Duration;
use tokio::sync::mpsc;

/// Chunks buffered between the producing task and the client connection.
const CLIENT_BUFFER_CHUNKS: usize = 32;

/// Longest wait for the client to make room for one more chunk.
pub const CLIENT_SEND_TIMEOUT: Duration = Duration::from_secs(30);

/// Writing half of a client response body.
///
/// Writes fail with `BrokenPipe` once the client has gone away and hyper has
/// dropped the body, and with `TimedOut` if the client stops reading.
#[derive(Debug)]
pub struct ClientSink {
    tx: mpsc::Sender<io::Result<Bytes>>,
    send_timeout: Duration,
}

impl ClientSink {
    /// Terminate the body with an error so the client sees a truncated
    /// response instead of a clean end.
    pub async fn abort(&mut self, error: io::Error) {
        let _ = tokio::time::timeout(self.send_timeout, self.tx.send(Err(error))).await;
    }
}

#[async_trait]
impl ChunkSink for ClientSink {
    async fn write_chunk(&mut self, chunk: Bytes) -> io::Result<usize> {
        let len = chunk.len();
        match tokio::time::timeout(self.send_timeout, self.tx.send(Ok(chunk))).await {
            Ok(Ok(())) => Ok(len),
            Ok(Err(_)) => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "client disconnected",
            )),
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "client stopped reading",
            )),
        }
    }

    fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Create a body whose content is whatever gets written to the returned sink.
pub fn channel() -> (ClientSink, Body) {
    channel_with_timeout(CLIENT_SEND_TIMEOUT)
}

fn channel_with_timeout(send_timeout: Duration) -> (ClientSink, Body) {
    let (tx, rx) = mpsc::channel(CLIENT_BUFFER_CHUNKS);
    let body = Body::from_stream(stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    }));
    (ClientSink { tx, send_timeout }, body)
}

/// 200 response carrying the mirrored headers and a streamed body.
pub fn streaming_response(headers: HeaderMap, body: Body) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::OK;
    *response.headers_mut() = headers;
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    #[tokio::test]
    async fn written_chunks_form_the_body() {
        let (mut sink, body) = channel();
        tokio::spawn(async move {
            sink.write_chunk(Bytes::from_static(b"hello ")).await.unwrap();
            sink.write_chunk(Bytes::from_static(b"world")).await.unwrap();
        });

        let bytes = body.collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"hello world");
    }

    #[tokio::test]
    async fn write_fails_once_body_is_dropped() {
        let (mut sink, body) = channel();
        drop(body);

        assert!(sink.is_closed());
        let err = sink.write_chunk(Bytes::from_static(b"x")).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn abort_surfaces_as_body_error() {
        let (mut sink, body) = channel();
        tokio::spawn(async move {
            sink.write_chunk(Bytes::from_static(b"part")).await.unwrap();
            sink.abort(io::Error::other("upstream died")).await;
        });

        assert!(body.collect().await.is_err());
    }

    #[tokio::test]
    async fn stalled_client_times_out_instead_of_blocking() {
        let (mut sink, body) = channel_with_timeout(Duration::from_millis(50));

        for _ in 0..CLIENT_BUFFER_CHUNKS {
            sink.write_chunk(Bytes::from_static(b"x")).await.unwrap();
        }
        let err = sink.write_chunk(Bytes::from_static(b"x")).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);

        // The body is still alive, only unread
        drop(body);
    }
}
