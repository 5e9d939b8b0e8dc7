//! Delivery of one request copy to one backend.
//!
//! Request and response bodies are buffered: the inbound body is read once
//! and shared by every copy, and the backend's answer is read in full within
//! the delivery timeout so a slow body counts as a timeout too.

use std::time::Duration;

use axum::body::Body;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use uuid::Uuid;

/// Header carried by every copy of one broadcast and echoed to the caller.
pub const CORRELATION_HEADER: &str = "x-spray-request-id";

/// Headers that should NOT be forwarded (hop-by-hop headers).
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "host",
    "connection",
    "transfer-encoding",
    "keep-alive",
    "upgrade",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
];

/// Generate a new correlation ID (UUID v4).
pub fn new_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

/// A fully buffered inbound request, copied once per backend.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub method: Method,
    /// Path plus optional `?query`, always starting with `/`.
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// A backend's complete answer. Any HTTP status is a successful delivery.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Network-level failure to deliver a copy to a backend.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("backend did not answer within {0:?}")]
    Timeout(Duration),

    #[error("failed to connect to backend: {0}")]
    Connect(#[source] reqwest::Error),

    #[error("invalid backend url {url:?}")]
    InvalidUrl { url: String },

    #[error("request to backend failed: {0}")]
    Request(#[source] reqwest::Error),
}

impl DeliveryError {
    /// Gateway status reported to the caller when the primary fails.
    pub fn status(&self) -> StatusCode {
        match self {
            DeliveryError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::BAD_GATEWAY,
        }
    }

    fn from_reqwest(e: reqwest::Error, timeout: Duration) -> Self {
        if e.is_timeout() {
            DeliveryError::Timeout(timeout)
        } else if e.is_connect() {
            DeliveryError::Connect(e)
        } else {
            DeliveryError::Request(e)
        }
    }
}

/// Join a backend base URL and the inbound path without doubling the slash.
pub fn target_url(base: &str, path_and_query: &str) -> String {
    format!("{}{}", base.trim_end_matches('/'), path_and_query)
}

/// Headers of `source` that may travel across the proxy.
///
/// `content-length` is dropped as well; the outgoing body sets its own.
fn forwardable_headers(source: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(source.len());
    for (name, value) in source.iter() {
        let name_str = name.as_str();
        if HOP_BY_HOP_HEADERS.contains(&name_str)
            || name_str == "content-length"
            || name_str == CORRELATION_HEADER
        {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers
}

/// The upstream `content-length` when it does not describe the buffered body.
///
/// A HEAD answer advertises the size of a body it never sends; the caller must
/// see that size rather than the zero implied by the empty buffer.
fn declared_length(upstream: &UpstreamResponse) -> Option<&HeaderValue> {
    let value = upstream.headers.get(http::header::CONTENT_LENGTH)?;
    let declared: usize = value.to_str().ok()?.trim().parse().ok()?;
    (declared != upstream.body.len()).then_some(value)
}

fn correlation_value(correlation_id: &str) -> HeaderValue {
    HeaderValue::from_str(correlation_id).unwrap_or_else(|_| HeaderValue::from_static("unknown"))
}

/// Send one copy of `request` to `backend` and buffer the answer.
///
/// The whole exchange, including reading the response body, is bounded by
/// `timeout`.
pub async fn deliver(
    client: &reqwest::Client,
    backend: &str,
    request: &InboundRequest,
    correlation_id: &str,
    timeout: Duration,
) -> Result<UpstreamResponse, DeliveryError> {
    let url = target_url(backend, &request.path_and_query);
    let url = reqwest::Url::parse(&url).map_err(|_| DeliveryError::InvalidUrl { url })?;

    let mut headers = forwardable_headers(&request.headers);
    headers.insert(
        HeaderName::from_static(CORRELATION_HEADER),
        correlation_value(correlation_id),
    );

    let exchange = async {
        let resp = client
            .request(request.method.clone(), url)
            .headers(headers)
            .body(request.body.clone())
            .send()
            .await?;
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp.bytes().await?;
        Ok::<_, reqwest::Error>(UpstreamResponse {
            status,
            headers,
            body,
        })
    };

    match tokio::time::timeout(timeout, exchange).await {
        Ok(Ok(resp)) => Ok(resp),
        Ok(Err(e)) => Err(DeliveryError::from_reqwest(e, timeout)),
        Err(_) => Err(DeliveryError::Timeout(timeout)),
    }
}

/// Turn the primary's outcome into the caller-visible response.
///
/// A backend answer is passed through verbatim (minus hop-by-hop headers);
/// a delivery failure becomes 504 for timeouts and 502 otherwise.
pub fn build_response(
    outcome: Result<UpstreamResponse, DeliveryError>,
    correlation_id: &str,
) -> Response {
    let upstream = match outcome {
        Ok(resp) => resp,
        Err(e) => {
            let message = match e {
                DeliveryError::Timeout(_) => "upstream timeout",
                _ => "upstream connection error",
            };
            let mut response = (e.status(), message).into_response();
            response.headers_mut().insert(
                HeaderName::from_static(CORRELATION_HEADER),
                correlation_value(correlation_id),
            );
            return response;
        }
    };

    let mut response_builder = Response::builder().status(upstream.status);
    for (name, value) in forwardable_headers(&upstream.headers).iter() {
        response_builder = response_builder.header(name, value);
    }
    if let Some(length) = declared_length(&upstream) {
        response_builder = response_builder.header(http::header::CONTENT_LENGTH, length.clone());
    }
    response_builder = response_builder.header(CORRELATION_HEADER, correlation_value(correlation_id));

    response_builder
        .body(Body::from(upstream.body))
        .unwrap_or_else(|e| {
            tracing::error!(error = %e, "Failed to build response");
            (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use wiremock::matchers::{body_string, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn inbound(path_and_query: &str, body: &'static str) -> InboundRequest {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        headers.insert("x-github-event", HeaderValue::from_static("push"));
        headers.insert("connection", HeaderValue::from_static("keep-alive"));
        InboundRequest {
            method: Method::POST,
            path_and_query: path_and_query.to_string(),
            headers,
            body: Bytes::from_static(body.as_bytes()),
        }
    }

    #[test]
    fn test_target_url_joins_single_slash() {
        assert_eq!(target_url("http://a", "/"), "http://a/");
        assert_eq!(target_url("http://a/", "/hook?x=1"), "http://a/hook?x=1");
        assert_eq!(target_url("http://a/base", "/hook"), "http://a/base/hook");
    }

    #[test]
    fn test_forwardable_headers_strip_hop_by_hop() {
        let mut source = HeaderMap::new();
        source.insert("host", HeaderValue::from_static("proxy.local"));
        source.insert("connection", HeaderValue::from_static("close"));
        source.insert("content-length", HeaderValue::from_static("12"));
        source.insert(CORRELATION_HEADER, HeaderValue::from_static("spoofed"));
        source.insert("x-hub-signature-256", HeaderValue::from_static("sha256=abc"));
        source.append("x-multi", HeaderValue::from_static("1"));
        source.append("x-multi", HeaderValue::from_static("2"));

        let headers = forwardable_headers(&source);
        assert!(headers.get("host").is_none());
        assert!(headers.get("connection").is_none());
        assert!(headers.get("content-length").is_none());
        assert!(headers.get(CORRELATION_HEADER).is_none());
        assert_eq!(headers.get("x-hub-signature-256").unwrap(), "sha256=abc");
        assert_eq!(headers.get_all("x-multi").iter().count(), 2);
    }

    #[tokio::test]
    async fn test_deliver_copies_method_path_headers_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(query_param("delivery", "7"))
            .and(header("x-github-event", "push"))
            .and(header(CORRELATION_HEADER, "corr-1"))
            .and(body_string(r#"{"foo":"bar"}"#))
            .respond_with(
                ResponseTemplate::new(202)
                    .insert_header("x-backend", "one")
                    .set_body_string("accepted"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let resp = deliver(
            &client,
            &server.uri(),
            &inbound("/hook?delivery=7", r#"{"foo":"bar"}"#),
            "corr-1",
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        assert_eq!(resp.status, StatusCode::ACCEPTED);
        assert_eq!(resp.headers.get("x-backend").unwrap(), "one");
        assert_eq!(resp.body, Bytes::from_static(b"accepted"));
    }

    #[tokio::test]
    async fn test_deliver_server_error_is_not_a_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let resp = deliver(
            &reqwest::Client::new(),
            &server.uri(),
            &inbound("/", "{}"),
            "corr-2",
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        assert_eq!(resp.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(resp.body, Bytes::from_static(b"boom"));
    }

    #[tokio::test]
    async fn test_deliver_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let err = deliver(
            &reqwest::Client::new(),
            &server.uri(),
            &inbound("/", "{}"),
            "corr-3",
            Duration::from_millis(100),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, DeliveryError::Timeout(_)));
        assert_eq!(err.status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[tokio::test]
    async fn test_deliver_rejects_invalid_url() {
        let err = deliver(
            &reqwest::Client::new(),
            "not a url",
            &inbound("/", "{}"),
            "corr-4",
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, DeliveryError::InvalidUrl { .. }));
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_build_response_passes_upstream_through() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("text/plain"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));

        let response = build_response(
            Ok(UpstreamResponse {
                status: StatusCode::CREATED,
                headers,
                body: Bytes::from_static(b"created"),
            }),
            "corr-5",
        );

        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers().get("content-type").unwrap(), "text/plain");
        assert!(response.headers().get("transfer-encoding").is_none());
        assert_eq!(response.headers().get(CORRELATION_HEADER).unwrap(), "corr-5");
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, Bytes::from_static(b"created"));
    }

    #[test]
    fn test_build_response_keeps_declared_length_of_head_answer() {
        let mut headers = HeaderMap::new();
        headers.insert("content-length", HeaderValue::from_static("42"));

        let response = build_response(
            Ok(UpstreamResponse {
                status: StatusCode::OK,
                headers,
                body: Bytes::new(),
            }),
            "corr-6",
        );

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get("content-length").unwrap(), "42");
    }

    #[test]
    fn test_build_response_matching_length_is_left_to_the_body() {
        let mut headers = HeaderMap::new();
        headers.insert("content-length", HeaderValue::from_static("7"));

        let response = build_response(
            Ok(UpstreamResponse {
                status: StatusCode::OK,
                headers,
                body: Bytes::from_static(b"created"),
            }),
            "corr-7",
        );

        assert!(response.headers().get("content-length").is_none());
    }

    #[test]
    fn test_build_response_maps_failures_to_gateway_statuses() {
        let timeout = build_response(Err(DeliveryError::Timeout(Duration::from_secs(1))), "c");
        assert_eq!(timeout.status(), StatusCode::GATEWAY_TIMEOUT);

        let invalid = build_response(
            Err(DeliveryError::InvalidUrl {
                url: "nope".to_string(),
            }),
            "c",
        );
        assert_eq!(invalid.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(invalid.headers().get(CORRELATION_HEADER).unwrap(), "c");
    }
}
