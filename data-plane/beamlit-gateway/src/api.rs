//! Route admin API.
//!
//! `POST /v1alpha1/routes` and `GET|PUT|DELETE /v1alpha1/routes/{name}`
//! with JSON/YAML content negotiation; `/healthz` for probes. Wrong
//! methods on known paths get 405 from the method router.

use std::sync::Arc;

use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use beamlit_routes::Route;

use crate::error::GatewayError;
use crate::store::RouteStore;

pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const CONTENT_TYPE_YAML: &str = "application/yaml";

pub fn admin_router(store: Arc<RouteStore>) -> Router {
    Router::new()
        .route("/v1alpha1/routes", post(create_route))
        .route(
            "/v1alpha1/routes/{name}",
            get(get_route).put(put_route).delete(delete_route),
        )
        .route("/healthz", get(healthz))
        .with_state(store)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

/// Media type from a header value, parameters stripped. Absent headers
/// default to JSON.
fn media_type(headers: &HeaderMap, name: header::HeaderName) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| {
            v.split(';').next().unwrap_or(v).trim().to_ascii_lowercase()
        })
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| CONTENT_TYPE_JSON.to_string())
}

fn decode_route(
    headers: &HeaderMap,
    body: &Bytes,
) -> Result<Route, GatewayError> {
    match media_type(headers, header::CONTENT_TYPE).as_str() {
        CONTENT_TYPE_JSON => serde_json::from_slice(body)
            .map_err(|e| GatewayError::Decode(e.to_string())),
        CONTENT_TYPE_YAML => serde_yaml::from_slice(body)
            .map_err(|e| GatewayError::Decode(e.to_string())),
        other => Err(GatewayError::UnsupportedMediaType(other.to_string())),
    }
}

fn encode_route(
    headers: &HeaderMap,
    route: &Route,
) -> Result<Response, GatewayError> {
    match media_type(headers, header::ACCEPT).as_str() {
        CONTENT_TYPE_YAML => {
            let body = serde_yaml::to_string(route)
                .map_err(|e| GatewayError::Decode(e.to_string()))?;
            Ok((
                [(header::CONTENT_TYPE, CONTENT_TYPE_YAML)],
                body,
            )
                .into_response())
        }
        // default to JSON, including wildcard accepts
        _ => {
            let body = serde_json::to_vec(route)
                .map_err(|e| GatewayError::Decode(e.to_string()))?;
            Ok((
                [(header::CONTENT_TYPE, CONTENT_TYPE_JSON)],
                body,
            )
                .into_response())
        }
    }
}

async fn create_route(
    State(store): State<Arc<RouteStore>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, GatewayError> {
    let route = decode_route(&headers, &body)?;
    tracing::info!(route = %route.name, "admin: registering route");
    let stored = store.register(route)?;
    encode_route(&headers, &stored)
}

async fn get_route(
    State(store): State<Arc<RouteStore>>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Result<Response, GatewayError> {
    let route = store.get(&name)?;
    encode_route(&headers, &route)
}

async fn put_route(
    State(store): State<Arc<RouteStore>>,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, GatewayError> {
    let mut route = decode_route(&headers, &body)?;
    // the path segment is authoritative for upserts
    route.name = name;
    tracing::info!(route = %route.name, "admin: upserting route");
    let stored = store.register(route)?;
    encode_route(&headers, &stored)
}

async fn delete_route(
    State(store): State<Arc<RouteStore>>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Result<Response, GatewayError> {
    tracing::info!(route = %name, "admin: deleting route");
    let route = store.delete(&name)?;
    encode_route(&headers, &route)
}
