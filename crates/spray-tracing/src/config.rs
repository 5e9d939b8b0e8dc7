//! Settings for spray-proxy's log output and span export.

use serde::Deserialize;

/// The `[tracing]` section of the proxy configuration.
///
/// Log lines always go to stderr, as plain text or one JSON object per line
/// depending on `format`. Delivery spans are additionally exported over OTLP
/// when `otlp_endpoint` is set.
#[derive(Debug, Clone, Deserialize)]
pub struct TracingConfig {
    /// `service.name` resource attribute attached to exported spans.
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// Where to export spans, e.g. "http://collector:4317". Unset keeps the
    /// proxy on stderr logging alone.
    #[serde(default)]
    pub otlp_endpoint: Option<String>,

    /// gRPC (port 4317) or HTTP/protobuf (port 4318).
    #[serde(default)]
    pub protocol: OtlpProtocol,

    /// `EnvFilter` directives. "spray_proxy=debug,info" shows per-backend
    /// delivery detail without dependency noise.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// `text` for terminals, `json` for log shippers.
    #[serde(default)]
    pub format: LogFormat,
}

/// Wire protocol used by the span exporter.
#[derive(Debug, Clone, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OtlpProtocol {
    #[default]
    Grpc,
    Http,
}

/// Shape of each stderr log line.
#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

fn default_service_name() -> String {
    "spray-proxy".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            otlp_endpoint: None,
            protocol: OtlpProtocol::default(),
            log_level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}
