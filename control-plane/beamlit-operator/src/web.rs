//! Health and readiness probes.

use std::net::SocketAddr;

use axum::Router;
use axum::routing::get;
use tokio::net::TcpListener;
use tracing::info;

/// Parses a Go-style bind address (`:8081` or `0.0.0.0:8081`).
pub fn parse_bind_addr(addr: &str) -> Result<SocketAddr, std::net::AddrParseError> {
    if let Some(port) = addr.strip_prefix(':') {
        format!("0.0.0.0:{port}").parse()
    } else {
        addr.parse()
    }
}

pub async fn run_probe_server(addr: SocketAddr) -> anyhow::Result<()> {
    let router = Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(|| async { "ok" }));
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "probe server listening");
    axum::serve(listener, router).await?;
    Ok(())
}

/// Prometheus exposition endpoint. The operator registers no collectors of
/// its own yet, so the body is an empty (but valid) exposition.
pub async fn run_metrics_server(addr: SocketAddr) -> anyhow::Result<()> {
    let router = Router::new().route(
        "/metrics",
        get(|| async {
            (
                [(
                    axum::http::header::CONTENT_TYPE,
                    "text/plain; version=0.0.4",
                )],
                String::new(),
            )
        }),
    );
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "metrics server listening");
    axum::serve(listener, router).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bind_addr_accepts_go_style() {
        assert_eq!(
            parse_bind_addr(":8081").unwrap(),
            "0.0.0.0:8081".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            parse_bind_addr("127.0.0.1:9000").unwrap(),
            "127.0.0.1:9000".parse::<SocketAddr>().unwrap()
        );
        assert!(parse_bind_addr("not-an-addr").is_err());
    }
}
