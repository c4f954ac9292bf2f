pub mod handlers;
pub mod state;

use crate::{cache, config::Config};
use axum::{
    Router,
    http::{HeaderValue, header::HeaderName},
    middleware,
    response::Response,
    routing::get,
};
use state::AppState;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

static VERSION_HEADER: HeaderName = HeaderName::from_static("x-pkgproxy-version");

/// Build the router: health and metrics endpoints plus the package
/// catch-all, wrapped in request tracing.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/metrics", get(handlers::health::metrics))
        .fallback(handlers::package::serve_package)
        .layer(middleware::map_response(add_version_header))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn add_version_header(mut response: Response) -> Response {
    response.headers_mut().insert(
        VERSION_HEADER.clone(),
        HeaderValue::from_static(env!("CARGO_PKG_VERSION")),
    );
    response
}

/// Start the Axum HTTP server
///
/// Prepares the cache directory, serves until Ctrl-C or SIGTERM, then removes
/// the cache directory unless it is configured to be kept.
pub async fn start(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let addr = format!("0.0.0.0:{}", config.port);
    let cache_dir = config.cache_dir.clone();
    let keep_cache = config.keep_cache;

    if let Err(e) = cache::prepare_dir(&cache_dir, keep_cache) {
        error!("Failed to prepare cache directory {}: {}", cache_dir.display(), e);
        return Err(e.into());
    }
    info!("Using cache directory {}", cache_dir.display());

    // Create shared application state
    let state = AppState::new(config)?;
    let app = build_router(state);

    // Bind TCP listener
    let listener = match tokio::net::TcpListener::bind(addr.as_str()).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind to address {}: {}", addr, e);
            return Err(e.into());
        }
    };

    info!("Server listening on http://{}", addr);

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    if !keep_cache && let Err(e) = cache::destroy_dir(&cache_dir) {
        warn!("Failed to remove cache directory {}: {}", cache_dir.display(), e);
    }

    if let Err(e) = served {
        error!("Server error: {}", e);
        return Err(e.into());
    }

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Shutdown signal received");
}
