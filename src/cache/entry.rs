//! The shared record behind one in-flight download.

use super::append_file::AppendFile;
use axum::http::{HeaderMap, StatusCode};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;
use tokio::sync::watch;
use tracing::warn;

/// One-shot broadcast flag. Any number of tasks can wait for it; once fired
/// it stays fired.
#[derive(Debug)]
pub struct Signal {
    tx: watch::Sender<bool>,
}

impl Signal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    pub fn fire(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_fired(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolve once the signal has fired (immediately if it already has).
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so this cannot observe a closed channel
        let _ = rx.wait_for(|fired| *fired).await;
    }
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}

/// State shared by the primary downloader and every follower of one file.
///
/// `headers` is set exactly once, right before `started` fires; `completed`
/// fires when the primary is done with the upstream body, whatever the outcome.
/// A primary whose fetch fails records the status instead of headers.
#[derive(Debug)]
pub struct CacheEntry {
    file: AppendFile,
    temp_path: PathBuf,
    final_path: PathBuf,
    headers: OnceLock<HeaderMap>,
    failure: OnceLock<StatusCode>,
    started: Signal,
    completed: Signal,
    committed: AtomicBool,
}

impl CacheEntry {
    /// Create the entry and its temporary file.
    pub(crate) fn create(temp_path: PathBuf, final_path: PathBuf) -> io::Result<Self> {
        let file = AppendFile::create(&temp_path)?;
        Ok(Self {
            file,
            temp_path,
            final_path,
            headers: OnceLock::new(),
            failure: OnceLock::new(),
            started: Signal::new(),
            completed: Signal::new(),
            committed: AtomicBool::new(false),
        })
    }

    pub fn file(&self) -> &AppendFile {
        &self.file
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    pub fn final_path(&self) -> &Path {
        &self.final_path
    }

    pub fn started(&self) -> &Signal {
        &self.started
    }

    pub fn completed(&self) -> &Signal {
        &self.completed
    }

    /// Headers published by the primary, once `started` has fired.
    pub fn headers(&self) -> Option<&HeaderMap> {
        self.headers.get()
    }

    /// Store the headers followers should mirror and fire `started`.
    ///
    /// Only the first call has any effect.
    pub fn publish_headers(&self, headers: HeaderMap) {
        if self.headers.set(headers).is_ok() {
            self.started.fire();
        }
    }

    /// Record why the upstream fetch failed. Only the first call counts.
    pub fn record_failure(&self, status: StatusCode) {
        let _ = self.failure.set(status);
    }

    /// Status recorded by [`CacheEntry::record_failure`], if any.
    pub fn failure(&self) -> Option<StatusCode> {
        self.failure.get().copied()
    }

    /// Move the finished download to its final name and stamp its mtime.
    ///
    /// Only the rename can fail the commit. A missing timestamp, or one that
    /// cannot be applied, leaves the mtime at the time of the last write.
    /// Blocking; run it off the async executor.
    pub fn commit(&self, modified: Option<SystemTime>) -> io::Result<()> {
        std::fs::rename(&self.temp_path, &self.final_path)?;
        self.committed.store(true, Ordering::Release);

        if let Some(modified) = modified
            && let Err(e) = set_modified(&self.final_path, modified)
        {
            warn!(path = %self.final_path.display(), "Failed to set modification time: {}", e);
        }
        Ok(())
    }

    pub fn is_committed(&self) -> bool {
        self.committed.load(Ordering::Acquire)
    }

    /// Close the file and delete the temporary unless it was committed.
    pub(crate) fn discard(&self) -> io::Result<()> {
        self.file.close()?;
        if self.is_committed() {
            return Ok(());
        }
        match std::fs::remove_file(&self.temp_path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

fn set_modified(path: &Path, modified: SystemTime) -> io::Result<()> {
    std::fs::OpenOptions::new()
        .write(true)
        .open(path)?
        .set_modified(modified)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderValue, header};
    use bytes::Bytes;
    use std::sync::Arc;
    use std::time::Duration;

    fn entry_in(dir: &Path) -> CacheEntry {
        CacheEntry::create(dir.join(".pkg.tar"), dir.join("pkg.tar")).unwrap()
    }

    #[tokio::test]
    async fn signal_wakes_all_waiters() {
        let signal = Arc::new(Signal::new());
        assert!(!signal.is_fired());

        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let signal = Arc::clone(&signal);
                tokio::spawn(async move { signal.wait().await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(10)).await;
        signal.fire();

        for waiter in waiters {
            tokio::time::timeout(Duration::from_secs(1), waiter)
                .await
                .expect("waiter should wake")
                .unwrap();
        }
        assert!(signal.is_fired());

        // Waiting after the fact resolves immediately
        tokio::time::timeout(Duration::from_millis(50), signal.wait())
            .await
            .expect("already fired");
    }

    #[tokio::test]
    async fn headers_published_once() {
        let dir = tempfile::tempdir().unwrap();
        let entry = entry_in(dir.path());
        assert!(entry.headers().is_none());

        let mut first = HeaderMap::new();
        first.insert(header::ETAG, HeaderValue::from_static("\"1\""));
        entry.publish_headers(first);
        assert!(entry.started().is_fired());

        let mut second = HeaderMap::new();
        second.insert(header::ETAG, HeaderValue::from_static("\"2\""));
        entry.publish_headers(second);
        assert_eq!(entry.headers().unwrap()[header::ETAG], "\"1\"");
    }

    #[test]
    fn first_recorded_failure_wins() {
        let dir = tempfile::tempdir().unwrap();
        let entry = entry_in(dir.path());
        assert_eq!(entry.failure(), None);

        entry.record_failure(StatusCode::NOT_FOUND);
        entry.record_failure(StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(entry.failure(), Some(StatusCode::NOT_FOUND));
        assert!(!entry.started().is_fired());
    }

    #[tokio::test]
    async fn commit_renames_and_sets_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let entry = entry_in(dir.path());
        entry.file().write(Bytes::from_static(b"content")).await.unwrap();

        let modified = httpdate::parse_http_date("Wed, 21 Oct 2015 07:28:00 GMT").unwrap();
        entry.commit(Some(modified)).unwrap();

        assert!(entry.is_committed());
        assert!(!entry.temp_path().exists());
        assert_eq!(std::fs::read(entry.final_path()).unwrap(), b"content");
        let mtime = std::fs::metadata(entry.final_path()).unwrap().modified().unwrap();
        assert_eq!(mtime, modified);

        // Discarding a committed entry keeps the final file
        entry.discard().unwrap();
        assert!(entry.final_path().exists());
    }

    #[tokio::test]
    async fn discard_removes_uncommitted_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let entry = entry_in(dir.path());
        entry.file().write(Bytes::from_static(b"partial")).await.unwrap();
        assert!(entry.temp_path().exists());

        entry.discard().unwrap();
        assert!(!entry.temp_path().exists());
        assert!(!entry.final_path().exists());
    }

    #[test]
    fn set_modified_on_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = set_modified(&dir.path().join("gone"), SystemTime::UNIX_EPOCH).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn commit_without_timestamp_keeps_write_time() {
        let dir = tempfile::tempdir().unwrap();
        let entry = entry_in(dir.path());
        entry.file().write(Bytes::from_static(b"content")).await.unwrap();
        let before = SystemTime::now() - Duration::from_secs(60);

        entry.commit(None).unwrap();

        assert!(entry.is_committed());
        let mtime = std::fs::metadata(entry.final_path()).unwrap().modified().unwrap();
        assert!(mtime > before);
    }
}
