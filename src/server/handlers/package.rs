use crate::{
    error::{ProxyError, Result},
    proxy,
    server::state::AppState,
};
use axum::{
    extract::{Request, State},
    http::Method,
    response::Response,
};
use tracing::warn;

/// Catch-all handler for `/{repo}/{os}/{arch}/{file}`.
///
/// Only GET is served; every other method gets 501.
pub async fn serve_package(State(state): State<AppState>, request: Request) -> Result<Response> {
    if request.method() != Method::GET {
        warn!(method = %request.method(), path = request.uri().path(), "Method not implemented");
        return Err(ProxyError::MethodNotImplemented(request.method().to_string()));
    }

    proxy::handle(&state, request).await
}
