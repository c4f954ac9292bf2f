//! Error type shared by the request handlers and the download engine.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use std::path::PathBuf;
use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Everything that can go wrong while handling one package request.
///
/// Each variant is local to the request that produced it; none of them is
/// fatal to the process.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The request path is not `/{repo}/{os}/{arch}/{file}`.
    #[error("invalid request path: {0}")]
    InvalidPath(String),

    #[error("method {0} not implemented")]
    MethodNotImplemented(String),

    /// Transport-level failure talking to the upstream mirror.
    #[error("upstream request failed: {0}")]
    UpstreamFetch(#[from] reqwest::Error),

    /// Upstream answered with a non-success status.
    #[error("upstream responded with {0}")]
    UpstreamStatus(StatusCode),

    /// Local filesystem failure (stat, open, create, rename).
    #[error("cache I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The download this request joined ended before its headers were known.
    #[error("download ended before response headers were available")]
    DownloadAborted,

    /// The download this request started failed before any headers arrived.
    /// Carries the status the fetch failure maps to.
    #[error("download failed with {0}")]
    DownloadFailed(StatusCode),
}

impl ProxyError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// HTTP status sent to the client for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidPath(_) => StatusCode::BAD_REQUEST,
            Self::MethodNotImplemented(_) => StatusCode::NOT_IMPLEMENTED,
            Self::UpstreamStatus(status) | Self::DownloadFailed(status) => *status,
            Self::UpstreamFetch(_) | Self::Io { .. } | Self::DownloadAborted => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let reason = status.canonical_reason().unwrap_or("Error");
        (status, format!("{reason}\n")).into_response()
    }
}
