mod conf;
pub mod api;
pub mod error;
pub mod proxy;
pub mod store;
pub mod token;

use std::sync::Arc;

pub use conf::Config;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{
    EnvFilter, layer::SubscriberExt, util::SubscriberInitExt,
};

use crate::proxy::ProxyState;
use crate::store::RouteStore;
use crate::token::TokenCache;

fn init_tracing(json_format: bool) {
    let filter = EnvFilter::builder()
        .with_env_var("RUST_LOG")
        .from_env_lossy()
        .add_directive("info".parse().unwrap_or_default());
    let registry = tracing_subscriber::registry().with(filter);
    if json_format {
        let _ = registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init();
    } else {
        let _ = registry.with(tracing_subscriber::fmt::layer()).try_init();
    }
}

/// Serves both listeners until a shutdown signal arrives: the traffic port
/// (weighted forwarding) and the admin port (route REST API + healthz).
pub async fn start_server(
    config: Config,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let json_format = matches!(
        config
            .log_format
            .as_deref()
            .map(|s| s.to_ascii_lowercase())
            .as_deref(),
        Some("json") | Some("structured")
    );
    init_tracing(json_format);

    let store = Arc::new(RouteStore::new());
    let tokens = Arc::new(TokenCache::new());
    let proxy_state = ProxyState::new(
        store.clone(),
        tokens,
        std::time::Duration::from_millis(config.request_timeout_ms),
        config.max_payload_bytes,
    );

    let admin = api::admin_router(store);
    let traffic = proxy::proxy_router(proxy_state).layer(
        axum::extract::DefaultBodyLimit::max(config.max_payload_bytes),
    );

    let admin_listener =
        TcpListener::bind(format!("0.0.0.0:{}", config.admin_port)).await?;
    let traffic_listener =
        TcpListener::bind(format!("0.0.0.0:{}", config.http_port)).await?;
    info!(
        admin_port = config.admin_port,
        http_port = config.http_port,
        "starting gateway"
    );

    let admin_server = axum::serve(admin_listener, admin)
        .with_graceful_shutdown(shutdown_signal());
    let traffic_server = axum::serve(traffic_listener, traffic)
        .with_graceful_shutdown(shutdown_signal());

    let (admin_result, traffic_result) =
        tokio::join!(admin_server, traffic_server);
    admin_result?;
    traffic_result?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(
            tokio::signal::unix::SignalKind::terminate(),
        )
        .expect("failed to install signal handler")
        .recv()
        .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
