//! Axum HTTP server: admin routes, broadcast fallback, graceful shutdown.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Request, State};
use axum::http::{Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, MethodRouter};
use axum::Router;
use bytes::Bytes;
use http_body_util::LengthLimitError;
use serde::Deserialize;
use tower_http::trace::TraceLayer;
use tracing::Instrument;

use crate::config::ProxyConfig;
use crate::proxy::forward::{self, InboundRequest};
use crate::proxy::fanout::BackgroundDeliveries;
use crate::proxy::{Dispatch, Dispatcher};
use crate::registry::{BackendRegistry, Registration, Removal};
use crate::stats::ProxyStats;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: ProxyConfig,
    pub registry: BackendRegistry,
    pub dispatcher: Dispatcher,
    pub stats: ProxyStats,
}

/// JSON body accepted by `POST` and `DELETE /backends`.
#[derive(Debug, Deserialize)]
struct BackendRequest {
    url: String,
}

/// Build the router. Registration routes only reach the registry when
/// dynamic backends are enabled.
pub fn router(state: AppState) -> Router {
    let backends: MethodRouter<Arc<AppState>> = if state.config.backends.enable_dynamic {
        get(handle_list_backends)
            .post(handle_register)
            .delete(handle_unregister)
    } else {
        get(handle_list_backends)
            .post(handle_dynamic_disabled)
            .delete(handle_dynamic_disabled)
    };

    Router::new()
        .route("/healthz", get(handle_health))
        .route("/proxy", get(handle_proxy_alive))
        .route("/backends", backends)
        .route("/api/stats", get(handle_get_stats))
        .fallback(handle_broadcast)
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

/// Build and run the HTTP server.
pub async fn run(state: AppState) -> anyhow::Result<()> {
    let listen_addr = state.config.server.listen_address.clone();
    let drain_deadline = Duration::from_secs(state.config.backends.timeout_secs);
    let dispatcher = state.dispatcher.clone();

    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    tracing::info!(address = %listen_addr, "spray-proxy listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!(
        in_flight = dispatcher.in_flight(),
        "Waiting for background deliveries"
    );
    if !dispatcher.drain(drain_deadline).await {
        tracing::warn!(
            in_flight = dispatcher.in_flight(),
            "Background deliveries still running at shutdown"
        );
    }

    tracing::info!("spray-proxy shut down gracefully");
    Ok(())
}

/// Whether a body read failed because it hit `server.max_body_bytes`.
fn exceeds_body_limit(err: &axum::Error) -> bool {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = source {
        if e.is::<LengthLimitError>() {
            return true;
        }
        source = e.source();
    }
    false
}

/// Catch-all handler: broadcast the request to every registered backend and
/// answer with the primary backend's response.
async fn handle_broadcast(State(state): State<Arc<AppState>>, request: Request) -> Response {
    let correlation_id = forward::new_correlation_id();
    let (parts, body) = request.into_parts();
    let span = spray_tracing::proxy_request_span!(correlation_id, parts.method, parts.uri.path());

    async {
        let body = match axum::body::to_bytes(body, state.config.server.max_body_bytes).await {
            Ok(b) => b,
            Err(e) if exceeds_body_limit(&e) => {
                tracing::warn!(
                    limit = state.config.server.max_body_bytes,
                    "Request body too large"
                );
                return (StatusCode::PAYLOAD_TOO_LARGE, "request body too large").into_response();
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to read request body");
                return (StatusCode::BAD_REQUEST, "failed to read request body").into_response();
            }
        };

        state.stats.inc_requests();

        let snapshot = state.registry.snapshot();

        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        let request = InboundRequest {
            method: parts.method,
            path_and_query,
            headers: parts.headers,
            body,
        };

        let dispatch = state.dispatcher.dispatch(request, snapshot, &correlation_id).await;
        tracing::Span::current().record("backends", dispatch.attempted());

        match dispatch {
            Dispatch::NoBackends => {
                tracing::Span::current().record("status", StatusCode::OK.as_u16());
                (StatusCode::OK, "no backends registered").into_response()
            }
            Dispatch::Delivered {
                primary,
                background,
            } => {
                let status = match &primary.outcome {
                    Ok(resp) => resp.status,
                    Err(e) => e.status(),
                };
                tracing::Span::current().record("status", status.as_u16());

                if !background.is_empty() {
                    tokio::spawn(summarize_background(background).in_current_span());
                }
                forward::build_response(primary.outcome, &correlation_id)
            }
        }
    }
    .instrument(span)
    .await
}

/// Log one summary line once every background delivery of a broadcast has
/// finished. Runs detached from the caller's response.
async fn summarize_background(background: BackgroundDeliveries) {
    let reports = background.join().await;
    let failed: Vec<&str> = reports
        .iter()
        .filter(|r| !r.is_delivered())
        .map(|r| r.backend.as_str())
        .collect();
    let slowest_ms = reports
        .iter()
        .map(|r| r.latency.as_millis() as u64)
        .max()
        .unwrap_or_default();

    tracing::info!(
        delivered = reports.len() - failed.len(),
        failed = failed.len(),
        failed_backends = ?failed,
        slowest_ms = slowest_ms,
        "Background deliveries finished"
    );
}

/// Parse the `{"url": "..."}` admin body. Empty URLs never reach the registry.
fn parse_backend_request(body: &[u8]) -> Option<String> {
    serde_json::from_slice::<BackendRequest>(body)
        .ok()
        .map(|req| req.url)
        .filter(|url| !url.is_empty())
}

fn invalid_body() -> Response {
    (StatusCode::BAD_REQUEST, "please provide a valid json body").into_response()
}

/// POST /backends: add a backend to the set.
async fn handle_register(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: Uri,
    body: Bytes,
) -> Response {
    let Some(url) = parse_backend_request(&body) else {
        tracing::info!(
            method = %method,
            path = %uri.path(),
            dynamic_backends = true,
            "backend register request rejected, invalid json body"
        );
        return invalid_body();
    };

    match state.registry.register(url.clone()) {
        Registration::Added => {
            tracing::info!(method = %method, path = %uri.path(), backend = %url, dynamic_backends = true, "server registered");
            (StatusCode::OK, "registered the backend server").into_response()
        }
        Registration::AlreadyPresent => {
            tracing::info!(method = %method, path = %uri.path(), backend = %url, dynamic_backends = true, "server already registered");
            (StatusCode::FOUND, "proxy already registered the backend url").into_response()
        }
    }
}

/// DELETE /backends: remove a backend from the set.
async fn handle_unregister(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: Uri,
    body: Bytes,
) -> Response {
    let Some(url) = parse_backend_request(&body) else {
        tracing::info!(
            method = %method,
            path = %uri.path(),
            dynamic_backends = true,
            "backend unregister request rejected, invalid json body"
        );
        return invalid_body();
    };

    match state.registry.unregister(&url) {
        Removal::Removed => {
            tracing::info!(method = %method, path = %uri.path(), backend = %url, dynamic_backends = true, "server unregistered");
            (
                StatusCode::OK,
                format!("unregistered the requested backend server: {url}"),
            )
                .into_response()
        }
        Removal::NotFound => {
            tracing::info!(method = %method, path = %uri.path(), backend = %url, dynamic_backends = true, "server not found");
            (StatusCode::NOT_FOUND, "backend server not found in the list").into_response()
        }
    }
}

/// Registration routes when dynamic backends are disabled.
async fn handle_dynamic_disabled(method: Method) -> Response {
    tracing::debug!(method = %method, "Dynamic backend registration is disabled");
    (StatusCode::NOT_FOUND, "dynamic backend registration is disabled").into_response()
}

/// GET /backends: registered URLs in dispatch order.
async fn handle_list_backends(State(state): State<Arc<AppState>>) -> Response {
    axum::Json(state.registry.snapshot()).into_response()
}

/// GET /api/stats: return current fan-out statistics.
async fn handle_get_stats(State(state): State<Arc<AppState>>) -> Response {
    axum::Json(state.stats.snapshot()).into_response()
}

/// Health check endpoint.
async fn handle_health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Liveness probe for the proxy path itself, answered without dispatching.
async fn handle_proxy_alive() -> impl IntoResponse {
    (StatusCode::OK, "proxy is alive")
}

/// Wait for SIGINT (Ctrl+C) for graceful shutdown.
async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install CTRL+C signal handler");
    tracing::info!("Shutdown signal received, draining connections...");
}
