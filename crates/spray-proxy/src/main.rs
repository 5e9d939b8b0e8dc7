//! spray-proxy: broadcasting reverse proxy that replicates every inbound
//! request (typically a webhook delivery) to all registered backends.

mod config;
mod proxy;
mod registry;
mod server;
mod stats;

use std::time::Duration;

use config::ProxyConfig;
use proxy::Dispatcher;
use registry::BackendRegistry;
use server::AppState;
use stats::ProxyStats;

fn main() -> anyhow::Result<()> {
    // Parse CLI args
    let args: Vec<String> = std::env::args().collect();
    let config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1).cloned())
        .or_else(|| args.get(1).filter(|a| !a.starts_with('-')).cloned())
        .or_else(|| std::env::var("SPRAY_PROXY_CONFIG").ok())
        .unwrap_or_else(|| "spray-proxy.toml".to_string());

    let extra_backends: Vec<String> = args
        .iter()
        .enumerate()
        .filter(|(_, a)| *a == "--backend")
        .filter_map(|(i, _)| args.get(i + 1).cloned())
        .collect();

    let listen_override = args
        .iter()
        .position(|a| a == "--listen")
        .and_then(|i| args.get(i + 1).cloned());

    let enable_dynamic = args.iter().any(|a| a == "--enable-dynamic-backends");
    let insecure = args.iter().any(|a| a == "--insecure-skip-tls-verify");

    // Load configuration
    let mut config = ProxyConfig::load(&config_path)?;

    // Apply CLI overrides (take precedence over TOML and env vars)
    config.backends.urls.extend(extra_backends);
    if let Some(addr) = listen_override {
        config.server.listen_address = addr;
    }
    config.backends.enable_dynamic |= enable_dynamic;
    config.backends.insecure_skip_tls_verify |= insecure;

    // Build the tokio runtime first; the tonic gRPC exporter needs a reactor
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let _tracing_guard = spray_tracing::init_tracing(&config.tracing);

        tracing::info!(
            config_path = %config_path,
            listen_address = %config.server.listen_address,
            backends = ?config.backends.urls,
            dynamic_backends = config.backends.enable_dynamic,
            timeout_secs = config.backends.timeout_secs,
            "Starting spray-proxy"
        );
        if config.backends.insecure_skip_tls_verify {
            tracing::warn!("TLS certificate verification for backends is disabled");
        }

        run(config).await
    })
}

async fn run(config: ProxyConfig) -> anyhow::Result<()> {
    // One client for every backend; the dispatcher bounds each delivery
    let client = reqwest::Client::builder()
        .danger_accept_invalid_certs(config.backends.insecure_skip_tls_verify)
        .build()?;

    let stats = ProxyStats::new();
    let dispatcher = Dispatcher::new(
        client,
        Duration::from_secs(config.backends.timeout_secs),
        stats.clone(),
    );
    let registry = BackendRegistry::with_backends(config.backends.urls.iter().cloned());
    tracing::info!(backends = registry.len(), "Backend registry initialized");

    let state = AppState {
        config,
        registry,
        dispatcher,
        stats,
    };

    server::run(state).await
}
