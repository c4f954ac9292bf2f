use std::env;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Upstream used when `UPSTREAM_URL` is not set.
pub const DEFAULT_UPSTREAM: &str = "https://mirrors.kernel.org/archlinux/$repo/os/$arch";

/// Subdirectory appended to the cache base path.
const CACHE_SUBDIR: &str = "pkgproxy";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{name} has an invalid value {value:?}")]
    InvalidValue { name: &'static str, value: String },

    #[error("UPSTREAM_URL must be an absolute http(s) URL, got {0:?}")]
    InvalidUpstream(String),

    #[error("unable to determine the user cache directory; set CACHE_DIR")]
    NoCacheDir,
}

/// Application configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    pub port: u16,
    /// Directory holding finished downloads and in-flight temporary files
    pub cache_dir: PathBuf,
    /// Upstream URL template; `$repo` and `$arch` are substituted per request
    pub upstream_url: String,
    /// Keep the cache directory between restarts
    pub keep_cache: bool,
    /// How often a follower checks the growing file for new bytes
    pub poll_interval: Duration,
}

impl Config {
    /// Load configuration from environment variables, falling back to defaults
    /// for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let port = parse_var("PORT", 8080u16)?;

        let base_dir = match env::var("CACHE_DIR") {
            Ok(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => dirs::cache_dir().ok_or(ConfigError::NoCacheDir)?,
        };
        // Always nest, so wiping the cache never touches the caller's directory
        let cache_dir = base_dir.join(CACHE_SUBDIR);

        let upstream_url =
            env::var("UPSTREAM_URL").unwrap_or_else(|_| DEFAULT_UPSTREAM.to_string());
        validate_upstream(&upstream_url)?;

        let keep_cache = parse_var("KEEP_CACHE", false)?;

        let poll_ms: u64 = parse_var("POLL_INTERVAL_MS", 1000)?;
        if poll_ms == 0 {
            return Err(ConfigError::InvalidValue {
                name: "POLL_INTERVAL_MS",
                value: "0".to_string(),
            });
        }

        Ok(Config {
            port,
            cache_dir,
            upstream_url,
            keep_cache,
            poll_interval: Duration::from_millis(poll_ms),
        })
    }
}

fn parse_var<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(value) => {
            let parsed: Result<T, _> = value.trim().to_lowercase().parse();
            parsed.map_err(|_| ConfigError::InvalidValue { name, value })
        }
        Err(_) => Ok(default),
    }
}

fn validate_upstream(template: &str) -> Result<(), ConfigError> {
    match Url::parse(template) {
        Ok(url) if matches!(url.scheme(), "http" | "https") && url.has_host() => Ok(()),
        _ => Err(ConfigError::InvalidUpstream(template.to_string())),
    }
}
