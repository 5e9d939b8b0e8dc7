//! Span builder helpers for spray-proxy instrumentation.

/// Create a tracing span for one inbound proxied request.
///
/// Usage: `proxy_request_span!(correlation_id, method, path)`
///
/// `backends` and `status` are recorded once the fan-out has been started
/// and the primary has answered.
#[macro_export]
macro_rules! proxy_request_span {
    ($correlation_id:expr, $method:expr, $path:expr) => {
        tracing::info_span!(
            "proxy_request",
            correlation_id = %$correlation_id,
            method = %$method,
            path = %$path,
            backends = tracing::field::Empty,
            status = tracing::field::Empty,
        )
    };
}

/// Create a tracing span for a single delivery to one backend.
///
/// `role` is either `primary` or `background`.
#[macro_export]
macro_rules! backend_delivery_span {
    ($correlation_id:expr, $backend:expr, $role:expr) => {
        tracing::info_span!(
            "backend_delivery",
            correlation_id = %$correlation_id,
            backend = %$backend,
            role = %$role,
            status = tracing::field::Empty,
            latency_ms = tracing::field::Empty,
        )
    };
}
