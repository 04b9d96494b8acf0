//! HTTP ingress
//!
//! Routes each request by hostname to the channel's fanout handler. The
//! dispatch is synchronous: the caller gets 202 once every subscription
//! accepted the message, 502 if any of them failed. Bodies above
//! `max_body_bytes` are refused with 413.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, FromRequest, Request, State};
use axum::http::{header::HOST, HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::fanout::Message;
use super::table::RoutingTable;
use crate::Error;

/// Shared state for the ingress handlers
#[derive(Clone)]
pub struct IngressState {
    /// Routing table maintained by the dispatcher reconciler
    pub table: Arc<RoutingTable>,
    /// Limit for reading a request body
    pub read_timeout: Duration,
    /// Limit for fanning a message out
    pub write_timeout: Duration,
    /// Largest accepted request body
    pub max_body_bytes: usize,
}

/// Build the ingress router
pub fn router(state: IngressState) -> Router {
    let body_limit = DefaultBodyLimit::max(state.max_body_bytes);
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(|| async { "ok" }))
        .fallback(dispatch_handler)
        .layer(body_limit)
        .with_state(state)
}

/// Hostname a request is addressed to, lowercased and without port
fn request_host(uri: &Uri, headers: &HeaderMap) -> Option<String> {
    let raw = uri
        .host()
        .map(str::to_string)
        .or_else(|| headers.get(HOST)?.to_str().ok().map(str::to_string))?;
    let host = match raw.strip_prefix('[').and_then(|rest| rest.find(']')) {
        // IPv6 literal, keep the brackets
        Some(end) => &raw[..end + 2],
        None => match raw.rsplit_once(':') {
            Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
            _ => raw.as_str(),
        },
    };
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    (!host.is_empty()).then_some(host)
}

async fn dispatch_handler(State(state): State<IngressState>, request: Request) -> Response {
    let Some(host) = request_host(request.uri(), request.headers()) else {
        return (StatusCode::BAD_REQUEST, "missing host").into_response();
    };
    let Some(handler) = state.table.get(&host) else {
        debug!(host = %host, "no channel for host");
        return (StatusCode::NOT_FOUND, "no channel for host").into_response();
    };
    if request.method() != Method::POST {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }

    let headers = request.headers().clone();
    // Oversized bodies are rejected with 413, unreadable ones with 400
    let body = match tokio::time::timeout(state.read_timeout, Bytes::from_request(request, &state)).await {
        Ok(Ok(body)) => body,
        Ok(Err(rejection)) => {
            warn!(host = %host, error = %rejection, "failed to read request body");
            return rejection.into_response();
        }
        Err(_) => return StatusCode::REQUEST_TIMEOUT.into_response(),
    };
    let message = Message::new(&headers, body);

    let results = match tokio::time::timeout(state.write_timeout, handler.dispatch(&message)).await {
        Ok(results) => results,
        Err(_) => {
            warn!(host = %host, "dispatch exceeded write timeout");
            return StatusCode::GATEWAY_TIMEOUT.into_response();
        }
    };

    let failed = results.iter().filter(|r| r.is_err()).count();
    if failed == 0 {
        StatusCode::ACCEPTED.into_response()
    } else {
        warn!(host = %host, failed, total = results.len(), "fanout incomplete");
        StatusCode::BAD_GATEWAY.into_response()
    }
}

/// Serve the ingress on `listener` until `shutdown` fires
///
/// After shutdown no new connections are accepted; in-flight requests get
/// up to `drain` to finish before the server is dropped.
pub async fn serve(
    listener: TcpListener,
    state: IngressState,
    shutdown: CancellationToken,
    drain: Duration,
) -> Result<(), Error> {
    let app = router(state);
    let signal = shutdown.clone();
    let mut server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { signal.cancelled().await })
            .await
    });

    tokio::select! {
        result = &mut server => return flatten(result),
        _ = shutdown.cancelled() => {}
    }

    info!(drain_secs = drain.as_secs(), "ingress draining");
    match tokio::time::timeout(drain, &mut server).await {
        Ok(result) => flatten(result),
        Err(_) => {
            warn!("drain period elapsed with requests in flight");
            server.abort();
            Ok(())
        }
    }
}

fn flatten(result: Result<std::io::Result<()>, tokio::task::JoinError>) -> Result<(), Error> {
    match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(Error::internal(format!("ingress server error: {e}"))),
        Err(e) => Err(Error::internal(format!("ingress task failed: {e}"))),
    }
}

/// Bind `0.0.0.0:port` and serve until `shutdown`
pub async fn run_ingress(
    port: u16,
    state: IngressState,
    shutdown: CancellationToken,
) -> Result<(), Error> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::internal(format!("failed to bind {addr}: {e}")))?;
    info!(%addr, "dispatcher ingress listening");

    let drain = state.write_timeout;
    serve(listener, state, shutdown, drain).await
}
