//! Package request parsing and path/URL derivation.

use crate::error::{ProxyError, Result};
use std::path::{Path, PathBuf};

/// Suffixes of repository database files. These change in place upstream,
/// so they are always fetched fresh and never stored.
const UNCACHEABLE_SUFFIXES: &[&str] = &[".db", ".db.sig"];

/// Shortest file name accepted; rejects degenerate paths like `/a/b/c/x`.
const MIN_FILE_NAME_LEN: usize = 3;

/// One parsed `/{repo}/{os}/{arch}/{file}` request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PackageRequest {
    pub repo: String,
    pub os: String,
    pub arch: String,
    pub file: String,
}

impl PackageRequest {
    /// Parse a request path. Query strings must already be stripped.
    ///
    /// # Errors
    /// Returns [`ProxyError::InvalidPath`] unless the path has exactly four
    /// non-empty segments and the last one is at least three bytes long.
    pub fn parse(path: &str) -> Result<Self> {
        let invalid = || ProxyError::InvalidPath(path.to_string());

        let rest = path.strip_prefix('/').ok_or_else(invalid)?;
        let segments: Vec<&str> = rest.split('/').collect();
        let [repo, os, arch, file] = segments.as_slice() else {
            return Err(invalid());
        };

        if [repo, os, arch, file].iter().any(|s| s.is_empty()) || file.len() < MIN_FILE_NAME_LEN {
            return Err(invalid());
        }

        Ok(Self {
            repo: repo.to_string(),
            os: os.to_string(),
            arch: arch.to_string(),
            file: file.to_string(),
        })
    }

    /// Build the upstream URL from a template containing `$repo` and `$arch`.
    ///
    /// Only the first occurrence of each token is replaced.
    pub fn upstream_url(&self, template: &str) -> String {
        let url = template
            .replacen("$repo", &self.repo, 1)
            .replacen("$arch", &self.arch, 1);
        format!("{}/{}", url, self.file)
    }

    /// Key under which concurrent downloads of this file are deduplicated.
    pub fn cache_key(&self) -> &str {
        &self.file
    }

    /// Whether this file may be stored in, and served from, the cache.
    pub fn is_cacheable(&self) -> bool {
        // A leading dot would alias another file's in-flight temporary
        !self.file.starts_with('.')
            && !UNCACHEABLE_SUFFIXES
                .iter()
                .any(|suffix| self.file.ends_with(suffix))
    }

    /// Final location of the cached file.
    pub fn cache_path(&self, cache_dir: &Path) -> PathBuf {
        cache_dir.join(&self.file)
    }

    /// Location of the file while its download is in progress.
    pub fn temp_path(&self, cache_dir: &Path) -> PathBuf {
        cache_dir.join(format!(".{}", self.file))
    }
}
