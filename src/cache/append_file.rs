//! Append-only file with one writer and many concurrent positional readers.
//!
//! Readers never touch the file cursor, so a follower can tail a download
//! while the primary is still appending to it. All I/O runs on the blocking
//! pool; the read/write lock is taken inside the blocking closure.
//!
//! Every byte in `[0, len())` observed at some point stays readable until
//! [`AppendFile::close`]: data is only ever appended, and the length is
//! advanced under the write lock after the bytes are written. Reads share the
//! lock; writes and length queries take it exclusively.

use super::sink::ChunkSink;
use async_trait::async_trait;
use bytes::Bytes;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug)]
struct State {
    /// `None` once closed
    file: Option<File>,
    len: u64,
}

/// Cloneable handle to a shared append-only file.
#[derive(Clone, Debug)]
pub struct AppendFile {
    state: Arc<RwLock<State>>,
}

impl AppendFile {
    /// Create (or truncate) the file at `path`, opened for append and read.
    pub fn create(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)?;
        file.set_len(0)?;

        Ok(Self {
            state: Arc::new(RwLock::new(State {
                file: Some(file),
                len: 0,
            })),
        })
    }

    /// Append `data`, returning the number of bytes written.
    pub async fn write(&self, data: Bytes) -> io::Result<usize> {
        let state = Arc::clone(&self.state);
        blocking(move || {
            let mut guard = write_lock(&state)?;
            let file = guard.file.as_mut().ok_or_else(closed)?;
            file.write_all(&data)?;
            guard.len += data.len() as u64;
            Ok(data.len())
        })
        .await
    }

    /// Read exactly `len` bytes starting at `offset`.
    ///
    /// Fails with `UnexpectedEof` if the range extends past the written length.
    pub async fn read_at(&self, offset: u64, len: usize) -> io::Result<Bytes> {
        let state = Arc::clone(&self.state);
        blocking(move || {
            let guard = read_lock(&state)?;
            let file = guard.file.as_ref().ok_or_else(closed)?;
            if offset.saturating_add(len as u64) > guard.len {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "read past the written length",
                ));
            }
            let mut buf = vec![0u8; len];
            read_exact_at(file, &mut buf, offset)?;
            Ok(Bytes::from(buf))
        })
        .await
    }

    /// Number of bytes appended so far.
    ///
    /// Excludes concurrent reads and writes, like [`AppendFile::write`].
    pub async fn len(&self) -> io::Result<u64> {
        let state = Arc::clone(&self.state);
        blocking(move || Ok(write_lock(&state)?.len)).await
    }

    pub async fn is_empty(&self) -> io::Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Close the underlying file. Later writes and reads fail; closing twice is a no-op.
    pub fn close(&self) -> io::Result<()> {
        let file = write_lock(&self.state)?.file.take();
        drop(file);
        Ok(())
    }
}

#[async_trait]
impl ChunkSink for AppendFile {
    async fn write_chunk(&mut self, chunk: Bytes) -> io::Result<usize> {
        self.write(chunk).await
    }
}

async fn blocking<T, F>(f: F) -> io::Result<T>
where
    F: FnOnce() -> io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(io::Error::other)?
}

fn read_lock(state: &RwLock<State>) -> io::Result<RwLockReadGuard<'_, State>> {
    state.read().map_err(|_| io::Error::other("append file lock poisoned"))
}

fn write_lock(state: &RwLock<State>) -> io::Result<RwLockWriteGuard<'_, State>> {
    state
        .write()
        .map_err(|_| io::Error::other("append file lock poisoned"))
}

fn closed() -> io::Error {
    io::Error::other("append file is closed")
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    // seek_read moves the cursor, which is harmless: the file is in append mode
    while !buf.is_empty() {
        match file.seek_read(buf, offset) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "failed to fill whole buffer",
                ));
            }
            Ok(n) => {
                buf = &mut buf[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn write_then_read_at() {
        let dir = tempfile::tempdir().unwrap();
        let file = AppendFile::create(&dir.path().join("f")).unwrap();
        assert!(file.is_empty().await.unwrap());

        assert_eq!(file.write(Bytes::from_static(b"hello ")).await.unwrap(), 6);
        assert_eq!(file.write(Bytes::from_static(b"world")).await.unwrap(), 5);
        assert_eq!(file.len().await.unwrap(), 11);

        assert_eq!(&file.read_at(0, 5).await.unwrap()[..], b"hello");
        assert_eq!(&file.read_at(6, 5).await.unwrap()[..], b"world");
        assert_eq!(&file.read_at(11, 0).await.unwrap()[..], b"");
    }

    #[tokio::test]
    async fn read_past_length_fails() {
        let dir = tempfile::tempdir().unwrap();
        let file = AppendFile::create(&dir.path().join("f")).unwrap();
        file.write(Bytes::from_static(b"abc")).await.unwrap();

        let err = file.read_at(1, 3).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn create_truncates_leftover_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"stale bytes").unwrap();

        let file = AppendFile::create(&path).unwrap();
        file.write(Bytes::from_static(b"new")).await.unwrap();

        assert_eq!(file.len().await.unwrap(), 3);
        assert_eq!(std::fs::read(&path).unwrap(), b"new");
    }

    #[tokio::test]
    async fn operations_fail_after_close() {
        let dir = tempfile::tempdir().unwrap();
        let file = AppendFile::create(&dir.path().join("f")).unwrap();
        file.write(Bytes::from_static(b"abc")).await.unwrap();

        file.close().unwrap();
        file.close().unwrap();

        assert!(file.write(Bytes::from_static(b"x")).await.is_err());
        assert!(file.read_at(0, 1).await.is_err());
    }

    #[tokio::test]
    async fn readers_observe_committed_prefix_while_writing() {
        let dir = tempfile::tempdir().unwrap();
        let file = AppendFile::create(&dir.path().join("f")).unwrap();

        let writer = {
            let file = file.clone();
            tokio::spawn(async move {
                for i in 0..50u8 {
                    file.write(Bytes::from(vec![i; 100])).await.unwrap();
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
            })
        };

        let mut readers = Vec::new();
        for _ in 0..4 {
            let file = file.clone();
            readers.push(tokio::spawn(async move {
                for _ in 0..50 {
                    let len = file.len().await.unwrap();
                    let data = file.read_at(0, len as usize).await.unwrap();
                    for (pos, byte) in data.iter().enumerate() {
                        assert_eq!(*byte as usize, pos / 100);
                    }
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
            }));
        }

        writer.await.unwrap();
        for reader in readers {
            reader.await.unwrap();
        }
        assert_eq!(file.len().await.unwrap(), 5000);
    }
}
