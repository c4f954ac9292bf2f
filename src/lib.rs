//! Caching reverse proxy for pacman package downloads.
//!
//! Concurrent requests for the same package share one upstream download:
//! the first request streams it to its client and to the cache, later ones
//! tail the growing file.

pub mod cache;
pub mod config;
pub mod error;
pub mod metrics;
pub mod proxy;
pub mod request;
pub mod server;
pub mod upstream;
