use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::Method,
    middleware::Next,
    response::Response,
};

use crate::router::AppState;
use crate::webhook::{header_pairs, ingest_error_response};

/// Applies the per-caller fixed window to the webhook routes.
///
/// Preflight probes pass through uncounted. The peer address is only known
/// when the server was started with connect info.
pub async fn limit_webhooks(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    if request.method() == Method::OPTIONS {
        return next.run(request).await;
    }

    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    let headers = header_pairs(request.headers());

    match state.pipeline().admit(&headers, peer) {
        Ok(()) => next.run(request).await,
        Err(err) => {
            let listener_id = request.uri().path().rsplit('/').next().unwrap_or_default();
            ingest_error_response(listener_id, err)
        }
    }
}
