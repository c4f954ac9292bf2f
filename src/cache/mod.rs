//! Download deduplication engine.
//!
//! [`DownloadCache::classify`] decides, atomically per cache key, whether a
//! request is served from disk, joins a download already in flight, starts a
//! new one, or bypasses the cache. Requests bound to an entry hold an
//! [`EntryLease`]; dropping the lease is the only way an entry is released.

pub mod append_file;
pub mod entry;
pub mod registry;
pub mod sink;

use crate::{
    error::{ProxyError, Result},
    request::PackageRequest,
};
use entry::CacheEntry;
use registry::Registry;
use std::collections::HashMap;
use std::convert::Infallible;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Registry value: the entry plus the number of requests bound to it.
#[derive(Debug)]
struct Slot {
    entry: Arc<CacheEntry>,
    ref_count: usize,
}

type Entries = Registry<String, Slot>;

/// How one request will be handled. Computed once, never stored.
#[derive(Debug)]
pub enum FileStatus {
    /// The finished file is on disk.
    Cached,
    /// Another request is downloading the file; tail it.
    InDownload(EntryLease),
    /// Nobody has the file; this request downloads it.
    Missing(EntryLease),
    /// The file is never cached and always fetched from upstream.
    NoCaching,
}

impl FileStatus {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Cached => "cached",
            Self::InDownload(_) => "in_download",
            Self::Missing(_) => "missing",
            Self::NoCaching => "no_caching",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Role {
    Primary,
    Follower,
}

/// A request's share of a [`CacheEntry`].
///
/// Dropping it re-enters the registry: the primary fires `completed`, the
/// count is decremented, and the last holder closes the file, deletes an
/// uncommitted temporary and removes the entry.
#[derive(Debug)]
pub struct EntryLease {
    entries: Arc<Entries>,
    key: String,
    entry: Arc<CacheEntry>,
    role: Role,
}

impl EntryLease {
    pub fn entry(&self) -> &Arc<CacheEntry> {
        &self.entry
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for EntryLease {
    fn drop(&mut self) {
        let _ = self.entries.locked_do(|map| {
            if self.role == Role::Primary {
                self.entry.completed().fire();
            }

            let Some(slot) = map.get_mut(&self.key) else {
                warn!(file = %self.key, "Released an entry missing from the registry");
                return Ok::<_, Infallible>(());
            };
            slot.ref_count -= 1;
            // Unlink under the lock: a new claim on the key reuses the same
            // temporary path
            if slot.ref_count == 0 {
                if let Err(e) = slot.entry.discard() {
                    warn!(file = %self.key, "Failed to remove temporary file: {}", e);
                }
                map.remove(&self.key);
                debug!(file = %self.key, "Entry removed");
            }
            Ok(())
        });
    }
}

/// Cache directory plus the registry of in-flight downloads.
#[derive(Clone, Debug)]
pub struct DownloadCache {
    dir: Arc<PathBuf>,
    entries: Arc<Entries>,
}

impl DownloadCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Arc::new(dir.into()),
            entries: Arc::new(Registry::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Classify `req` and, for downloads, bind it to the entry.
    ///
    /// # Errors
    /// [`ProxyError::Io`] if the cache file cannot be stat'ed or the
    /// temporary file cannot be created.
    pub fn classify(&self, req: &PackageRequest) -> Result<FileStatus> {
        if !req.is_cacheable() {
            return Ok(FileStatus::NoCaching);
        }

        let key = req.cache_key();
        let final_path = req.cache_path(&self.dir);

        self.entries.locked_do(|map| {
            match std::fs::metadata(&final_path) {
                Ok(_) => return Ok(FileStatus::Cached),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(ProxyError::io(final_path, e)),
            }

            if let Some(slot) = map.get_mut(key) {
                slot.ref_count += 1;
                return Ok(FileStatus::InDownload(
                    self.lease(key, &slot.entry, Role::Follower),
                ));
            }

            let temp_path = req.temp_path(&self.dir);
            let entry = CacheEntry::create(temp_path.clone(), final_path)
                .map(Arc::new)
                .map_err(|e| ProxyError::io(temp_path, e))?;
            let lease = self.lease(key, &entry, Role::Primary);
            map.insert(
                key.to_string(),
                Slot {
                    entry,
                    ref_count: 1,
                },
            );
            Ok(FileStatus::Missing(lease))
        })
    }

    /// Number of entries currently registered.
    pub fn in_flight(&self) -> usize {
        self.entries
            .locked_do(|map| Ok::<_, Infallible>(map.len()))
            .unwrap_or_default()
    }

    /// Requests currently bound to the entry for `key`, if there is one.
    pub fn ref_count(&self, key: &str) -> Option<usize> {
        self.entries
            .locked_do(|map| Ok::<_, Infallible>(map.get(key).map(|slot| slot.ref_count)))
            .unwrap_or_default()
    }

    fn lease(&self, key: &str, entry: &Arc<CacheEntry>, role: Role) -> EntryLease {
        EntryLease {
            entries: Arc::clone(&self.entries),
            key: key.to_string(),
            entry: Arc::clone(entry),
            role,
        }
    }
}

/// Create the cache directory, wiping any previous content unless `keep`.
pub fn prepare_dir(dir: &Path, keep: bool) -> io::Result<()> {
    if !keep {
        destroy_dir(dir)?;
    }
    std::fs::create_dir_all(dir)
}

/// Remove the cache directory and everything in it.
pub fn destroy_dir(dir: &Path) -> io::Result<()> {
    match std::fs::remove_dir_all(dir) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn request(file: &str) -> PackageRequest {
        PackageRequest {
            repo: "extra".to_string(),
            os: "os".to_string(),
            arch: "x86_64".to_string(),
            file: file.to_string(),
        }
    }

    #[test]
    fn database_files_bypass_registry() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DownloadCache::new(dir.path());

        let first = cache.classify(&request("core.db")).unwrap();
        let second = cache.classify(&request("core.db")).unwrap();
        assert!(matches!(first, FileStatus::NoCaching));
        assert!(matches!(second, FileStatus::NoCaching));
        assert_eq!(cache.in_flight(), 0);
        assert!(!dir.path().join(".core.db").exists());
    }

    #[test]
    fn existing_file_is_cached() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("foo.pkg.tar.zst"), b"done").unwrap();
        let cache = DownloadCache::new(dir.path());

        let status = cache.classify(&request("foo.pkg.tar.zst")).unwrap();
        assert!(matches!(status, FileStatus::Cached));
        assert_eq!(cache.in_flight(), 0);
    }

    #[test]
    fn first_request_claims_and_second_joins() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DownloadCache::new(dir.path());
        let req = request("foo.pkg.tar.zst");

        let primary = cache.classify(&req).unwrap();
        assert_eq!(primary.label(), "missing");
        assert!(dir.path().join(".foo.pkg.tar.zst").exists());
        assert_eq!(cache.ref_count("foo.pkg.tar.zst"), Some(1));

        let follower = cache.classify(&req).unwrap();
        assert_eq!(follower.label(), "in_download");
        assert_eq!(cache.ref_count("foo.pkg.tar.zst"), Some(2));

        let (FileStatus::Missing(p), FileStatus::InDownload(f)) = (primary, follower) else {
            panic!("unexpected classification");
        };
        assert!(Arc::ptr_eq(p.entry(), f.entry()));
    }

    #[test]
    fn last_release_removes_entry_and_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DownloadCache::new(dir.path());
        let req = request("foo.pkg.tar.zst");

        let primary = cache.classify(&req).unwrap();
        let follower = cache.classify(&req).unwrap();

        drop(primary);
        assert_eq!(cache.ref_count("foo.pkg.tar.zst"), Some(1));
        assert!(dir.path().join(".foo.pkg.tar.zst").exists());

        drop(follower);
        assert_eq!(cache.ref_count("foo.pkg.tar.zst"), None);
        assert_eq!(cache.in_flight(), 0);
        assert!(!dir.path().join(".foo.pkg.tar.zst").exists());
    }

    #[test]
    fn primary_release_fires_completed() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DownloadCache::new(dir.path());
        let req = request("foo.pkg.tar.zst");

        let primary = cache.classify(&req).unwrap();
        let FileStatus::InDownload(follower) = cache.classify(&req).unwrap() else {
            panic!("expected follower");
        };
        assert!(!follower.entry().completed().is_fired());

        drop(primary);
        assert!(follower.entry().completed().is_fired());
    }

    #[test]
    fn follower_release_does_not_fire_completed() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DownloadCache::new(dir.path());
        let req = request("foo.pkg.tar.zst");

        let FileStatus::Missing(primary) = cache.classify(&req).unwrap() else {
            panic!("expected primary");
        };
        let follower = cache.classify(&req).unwrap();
        drop(follower);

        assert!(!primary.entry().completed().is_fired());
        assert_eq!(cache.ref_count("foo.pkg.tar.zst"), Some(1));
    }

    #[tokio::test]
    async fn committed_file_survives_release() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DownloadCache::new(dir.path());
        let req = request("foo.pkg.tar.zst");

        let FileStatus::Missing(primary) = cache.classify(&req).unwrap() else {
            panic!("expected primary");
        };
        primary
            .entry()
            .file()
            .write(Bytes::from_static(b"package"))
            .await
            .unwrap();
        primary.entry().commit(None).unwrap();
        drop(primary);

        assert_eq!(cache.in_flight(), 0);
        assert_eq!(
            std::fs::read(dir.path().join("foo.pkg.tar.zst")).unwrap(),
            b"package"
        );
        assert!(matches!(cache.classify(&req).unwrap(), FileStatus::Cached));
    }

    #[test]
    fn entry_can_be_reclaimed_after_failed_download() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DownloadCache::new(dir.path());
        let req = request("foo.pkg.tar.zst");

        drop(cache.classify(&req).unwrap());
        let again = cache.classify(&req).unwrap();
        assert_eq!(again.label(), "missing");
        assert!(dir.path().join(".foo.pkg.tar.zst").exists());
    }

    #[tokio::test]
    async fn release_never_unlinks_a_newer_claim() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DownloadCache::new(dir.path());
        let req = request("foo.pkg.tar.zst");

        for round in 0..20u8 {
            let FileStatus::Missing(lease) = cache.classify(&req).unwrap() else {
                panic!("expected a fresh claim");
            };
            lease.entry().file().write(Bytes::from(vec![round])).await.unwrap();
            let releasing = std::thread::spawn(move || drop(lease));

            // Whichever claim comes next owns a temporary file on disk
            let next = loop {
                match cache.classify(&req).unwrap() {
                    FileStatus::Missing(next) => break next,
                    FileStatus::InDownload(joined) => drop(joined),
                    _ => panic!("unexpected classification"),
                }
            };
            releasing.join().unwrap();
            assert!(next.entry().temp_path().exists());
            drop(next);
        }
        assert_eq!(cache.in_flight(), 0);
    }

    #[test]
    fn missing_cache_dir_is_local_error() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DownloadCache::new(dir.path().join("does-not-exist"));

        let err = cache.classify(&request("foo.pkg.tar.zst")).unwrap_err();
        assert!(matches!(err, ProxyError::Io { .. }));
        assert_eq!(cache.in_flight(), 0);
    }

    #[test]
    fn prepare_dir_wipes_unless_kept() {
        let base = tempfile::tempdir().unwrap();
        let dir = base.path().join("pkgproxy");
        prepare_dir(&dir, false).unwrap();
        std::fs::write(dir.join("old.pkg"), b"x").unwrap();

        prepare_dir(&dir, true).unwrap();
        assert!(dir.join("old.pkg").exists());

        prepare_dir(&dir, false).unwrap();
        assert!(dir.exists());
        assert!(!dir.join("old.pkg").exists());

        destroy_dir(&dir).unwrap();
        assert!(!dir.exists());
        destroy_dir(&dir).unwrap();
    }
}
