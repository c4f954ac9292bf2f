//! Chunk destinations for the download copy loop.
//!
//! A single loop feeds the cache file and the live client through a
//! [`FanOut`]. Each destination is wrapped in a [`BestEffortSink`] so a dead
//! client never interrupts the cache write, and vice versa.

use async_trait::async_trait;
use bytes::Bytes;
use std::io;

/// Something a downloaded chunk can be written to.
#[async_trait]
pub trait ChunkSink: Send {
    /// Write the whole chunk, returning its length.
    async fn write_chunk(&mut self, chunk: Bytes) -> io::Result<usize>;

    /// Whether further writes are pointless because the sink has given up.
    fn is_closed(&self) -> bool {
        false
    }
}

#[async_trait]
impl ChunkSink for Vec<u8> {
    async fn write_chunk(&mut self, chunk: Bytes) -> io::Result<usize> {
        self.extend_from_slice(&chunk);
        Ok(chunk.len())
    }
}

/// Sink that never reports failure to its caller.
///
/// The first error from the wrapped destination is recorded and every later
/// chunk is dropped without being forwarded.
#[derive(Debug)]
pub struct BestEffortSink<W> {
    inner: W,
    error: Option<io::Error>,
}

impl<W: ChunkSink> BestEffortSink<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, error: None }
    }

    /// The first error the destination returned, if any.
    pub fn last_error(&self) -> Option<&io::Error> {
        self.error.as_ref()
    }

    /// Consume the sink, returning the first error it recorded.
    pub fn into_error(self) -> Option<io::Error> {
        self.error
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }
}

#[async_trait]
impl<W: ChunkSink> ChunkSink for BestEffortSink<W> {
    async fn write_chunk(&mut self, chunk: Bytes) -> io::Result<usize> {
        let len = chunk.len();
        if self.error.is_none()
            && let Err(e) = self.inner.write_chunk(chunk).await
        {
            self.error = Some(e);
        }
        Ok(len)
    }

    fn is_closed(&self) -> bool {
        self.error.is_some()
    }
}

/// Writes every chunk to all destinations in order.
///
/// A failing destination does not stop the chunk from reaching the others;
/// the first error seen during the call is returned after all were tried.
pub struct FanOut<'a> {
    sinks: Vec<&'a mut dyn ChunkSink>,
}

impl<'a> FanOut<'a> {
    pub fn new(sinks: Vec<&'a mut dyn ChunkSink>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl<'a> ChunkSink for FanOut<'a> {
    async fn write_chunk(&mut self, chunk: Bytes) -> io::Result<usize> {
        let mut first_error = None;
        for sink in self.sinks.iter_mut() {
            if let Err(e) = sink.write_chunk(chunk.clone()).await {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(chunk.len()),
        }
    }

    /// Closed once every destination is.
    fn is_closed(&self) -> bool {
        self.sinks.iter().all(|sink| sink.is_closed())
    }
}
