//! Traffic forwarding.
//!
//! Every request resolves a route by Host header, draws a backend at random
//! proportionally to the configured weights and forwards. A failed upstream
//! triggers a bounded retry against the other backends (zero weights count
//! as one on the retry path so a 0% backend can still take over).

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderName, StatusCode, header};
use axum::response::{IntoResponse, Response};
use beamlit_routes::{AuthType, Backend, Route};
use bytes::Bytes;
use rand::Rng;
use tracing::{debug, instrument, warn};

use crate::error::GatewayError;
use crate::store::RouteStore;
use crate::token::TokenCache;

/// Retries after the initial failure; delays are 10^attempt milliseconds
/// (1ms, 10ms, 100ms, 1s).
const MAX_RETRIES: u32 = 4;

pub struct ProxyState {
    pub store: Arc<RouteStore>,
    pub tokens: Arc<TokenCache>,
    pub http: reqwest::Client,
    pub max_payload_bytes: usize,
}

impl ProxyState {
    pub fn new(
        store: Arc<RouteStore>,
        tokens: Arc<TokenCache>,
        request_timeout: Duration,
        max_payload_bytes: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            tokens,
            http: reqwest::Client::builder()
                .timeout(request_timeout)
                .build()
                .unwrap_or_default(),
            max_payload_bytes,
        })
    }
}

pub fn proxy_router(state: Arc<ProxyState>) -> Router {
    Router::new().fallback(forward).with_state(state)
}

/// Cumulative-weight pick: the first backend whose running sum exceeds the
/// draw wins. `draw` must be in `[0, total)`.
pub(crate) fn pick_backend<'a>(
    backends: &[(&'a Backend, i64)],
    draw: i64,
) -> Option<&'a Backend> {
    let mut cumulative = 0_i64;
    for (backend, weight) in backends {
        cumulative += weight;
        if draw < cumulative {
            return Some(backend);
        }
    }
    backends.last().map(|(backend, _)| *backend)
}

/// Weighted candidates for the first attempt: real weights, skipping
/// non-positive ones.
fn initial_candidates(route: &Route) -> Vec<(&Backend, i64)> {
    route
        .backends
        .iter()
        .filter(|b| b.weight > 0)
        .map(|b| (b, b.weight as i64))
        .collect()
}

/// Candidates for a retry: failed hosts are excluded and zero weights are
/// bumped to one so standby backends participate.
fn retry_candidates<'a>(
    route: &'a Route,
    failed_hosts: &[String],
) -> Vec<(&'a Backend, i64)> {
    route
        .backends
        .iter()
        .filter(|b| {
            !failed_hosts.iter().any(|h| h == b.host_without_port())
        })
        .map(|b| (b, b.weight.max(1) as i64))
        .collect()
}

fn draw_from(candidates: &[(&Backend, i64)]) -> Option<i64> {
    let total: i64 = candidates.iter().map(|(_, w)| w).sum();
    if total <= 0 {
        return None;
    }
    Some(rand::rng().random_range(0..total))
}

#[instrument(skip_all, fields(host))]
async fn forward(
    State(state): State<Arc<ProxyState>>,
    request: Request,
) -> Response {
    let (parts, body) = request.into_parts();
    let host = match parts
        .headers
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
    {
        Some(host) => host.to_string(),
        None => {
            return GatewayError::NoRoute(String::new()).into_response();
        }
    };
    tracing::Span::current().record("host", host.as_str());

    let route = match state.store.by_host(&host) {
        Ok(route) => route,
        Err(error) => return error.into_response(),
    };

    let body = match to_bytes(body, state.max_payload_bytes).await {
        Ok(bytes) => bytes,
        Err(error) => {
            return (StatusCode::PAYLOAD_TOO_LARGE, error.to_string())
                .into_response();
        }
    };

    match forward_with_retries(&state, &route, &parts, body).await {
        Ok(response) => response,
        Err(error) => error.into_response(),
    }
}

async fn forward_with_retries(
    state: &ProxyState,
    route: &Route,
    parts: &http::request::Parts,
    body: Bytes,
) -> Result<Response, GatewayError> {
    let candidates = initial_candidates(route);
    let Some(draw) = draw_from(&candidates) else {
        return Err(GatewayError::NoBackends);
    };
    let backend =
        pick_backend(&candidates, draw).ok_or(GatewayError::NoBackends)?;

    let mut failed_hosts: Vec<String> = Vec::new();
    match send_to_backend(state, backend, parts, body.clone()).await {
        Ok(response) => return Ok(response),
        Err(error) => {
            warn!(backend = %backend.host, %error, "backend failed, retrying");
            failed_hosts.push(backend.host_without_port().to_string());
        }
    }

    for attempt in 0..MAX_RETRIES {
        tokio::time::sleep(Duration::from_millis(10_u64.pow(attempt))).await;
        let candidates = retry_candidates(route, &failed_hosts);
        let Some(draw) = draw_from(&candidates) else {
            break;
        };
        let Some(backend) = pick_backend(&candidates, draw) else {
            break;
        };
        match send_to_backend(state, backend, parts, body.clone()).await {
            Ok(response) => return Ok(response),
            Err(error) => {
                warn!(backend = %backend.host, attempt, %error, "retry failed");
                let bare = backend.host_without_port().to_string();
                if !failed_hosts.contains(&bare) {
                    failed_hosts.push(bare);
                }
            }
        }
    }
    Err(GatewayError::AllBackendsFailed)
}

/// One upstream attempt. 5xx responses count as failures so the retry path
/// can fail over; everything below that is passed through verbatim.
async fn send_to_backend(
    state: &ProxyState,
    backend: &Backend,
    parts: &http::request::Parts,
    body: Bytes,
) -> Result<Response, GatewayError> {
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let url = format!(
        "{}://{}{}{}",
        backend.scheme, backend.host, backend.path_prefix, path_and_query
    );
    debug!(%url, "forwarding");

    let mut headers = filter_hop_headers(&parts.headers);
    for (name, value) in &backend.headers_to_add {
        if let (Ok(name), Ok(value)) = (
            HeaderName::try_from(name.as_str()),
            http::HeaderValue::from_str(value),
        ) {
            headers.insert(name, value);
        }
    }
    if let Some(auth) = &backend.auth {
        if auth.auth_type == AuthType::OAuth {
            if let Some(oauth) = &auth.oauth {
                let bearer = state.tokens.bearer(oauth).await?;
                if let Ok(value) = http::HeaderValue::from_str(&format!(
                    "Bearer {bearer}"
                )) {
                    headers.insert(header::AUTHORIZATION, value);
                }
            }
        }
    }
    if let Ok(value) = http::HeaderValue::from_str(
        parts
            .headers
            .get(header::HOST)
            .and_then(|h| h.to_str().ok())
            .unwrap_or_default(),
    ) {
        headers.insert(HeaderName::from_static("x-forwarded-host"), value);
    }

    let upstream = state
        .http
        .request(parts.method.clone(), url)
        .headers(headers)
        .body(body)
        .send()
        .await?;

    if upstream.status().is_server_error() {
        return Err(GatewayError::UpstreamStatus(upstream.status()));
    }

    let status = upstream.status();
    let response_headers = filter_hop_headers(upstream.headers());
    let bytes = upstream.bytes().await?;
    let mut response = Response::new(Body::from(bytes));
    *response.status_mut() = status;
    *response.headers_mut() = response_headers;
    Ok(response)
}

const HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

fn filter_hop_headers(headers: &HeaderMap) -> HeaderMap {
    let mut filtered = HeaderMap::new();
    for (name, value) in headers {
        let lowered = name.as_str().to_ascii_lowercase();
        if HOP_HEADERS.contains(&lowered.as_str()) || lowered == "host" {
            continue;
        }
        filtered.append(name.clone(), value.clone());
    }
    filtered
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn backend(host: &str, weight: i32) -> Backend {
        Backend {
            host: host.into(),
            weight,
            auth: None,
            path_prefix: String::new(),
            headers_to_add: BTreeMap::new(),
            scheme: "http".into(),
        }
    }

    fn route(backends: Vec<Backend>) -> Route {
        Route {
            name: "r".into(),
            hostnames: vec!["h".into()],
            backends,
        }
    }

    #[test]
    fn pick_backend_walks_cumulative_weights() {
        let a = backend("a", 30);
        let b = backend("b", 70);
        let candidates = vec![(&a, 30_i64), (&b, 70_i64)];
        assert_eq!(pick_backend(&candidates, 0).unwrap().host, "a");
        assert_eq!(pick_backend(&candidates, 29).unwrap().host, "a");
        assert_eq!(pick_backend(&candidates, 30).unwrap().host, "b");
        assert_eq!(pick_backend(&candidates, 99).unwrap().host, "b");
    }

    #[test]
    fn weighted_draw_distribution_converges() {
        // deterministic sweep over the whole draw space stands in for the
        // statistical property: picks are exactly proportional to weights
        let a = backend("a", 25);
        let b = backend("b", 75);
        let candidates = vec![(&a, 25_i64), (&b, 75_i64)];
        let mut picks_b = 0;
        for draw in 0..100 {
            if pick_backend(&candidates, draw).unwrap().host == "b" {
                picks_b += 1;
            }
        }
        assert_eq!(picks_b, 75);
    }

    #[test]
    fn initial_candidates_skip_zero_weights() {
        let route = route(vec![backend("local", 100), backend("remote", 0)]);
        let candidates = initial_candidates(&route);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].0.host, "local");
    }

    #[test]
    fn retry_candidates_revive_zero_weights_and_exclude_failures() {
        let route = route(vec![
            backend("local:8080", 100),
            backend("remote.example.com", 0),
        ]);
        let candidates = retry_candidates(&route, &["local".to_string()]);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].0.host, "remote.example.com");
        assert_eq!(candidates[0].1, 1);
    }

    #[test]
    fn no_candidates_when_everything_failed() {
        let route = route(vec![backend("a", 1), backend("b", 1)]);
        let candidates =
            retry_candidates(&route, &["a".to_string(), "b".to_string()]);
        assert!(candidates.is_empty());
        assert!(draw_from(&candidates).is_none());
    }

    #[test]
    fn hop_headers_are_stripped() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, "svc".parse().unwrap());
        headers.insert(header::CONNECTION, "close".parse().unwrap());
        headers.insert(header::CONTENT_TYPE, "application/json".parse().unwrap());
        let filtered = filter_hop_headers(&headers);
        assert!(filtered.get(header::HOST).is_none());
        assert!(filtered.get(header::CONNECTION).is_none());
        assert!(filtered.get(header::CONTENT_TYPE).is_some());
    }

    #[test]
    fn retry_backoff_progression() {
        // the documented backoff is 10^attempt milliseconds; any change to
        // 10*i or 10<<i must consciously edit this expectation
        let delays: Vec<u64> =
            (0..MAX_RETRIES).map(|i| 10_u64.pow(i)).collect();
        assert_eq!(delays, vec![1, 10, 100, 1000]);
    }
}
