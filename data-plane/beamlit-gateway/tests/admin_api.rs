use std::sync::Arc;

use axum::body::Body;
use beamlit_gateway::api::admin_router;
use beamlit_gateway::store::RouteStore;
use http::{Request, StatusCode, header};
use tower::ServiceExt;

fn route_json(name: &str) -> serde_json::Value {
    serde_json::json!({
        "name": name,
        "hostnames": ["10.0.0.5", "svc.default.svc"],
        "backends": [
            {"host": "svc-beamlit.default.svc.cluster.local:8080", "weight": 100, "scheme": "http"},
            {"host": "run.beamlit.com", "weight": 0, "scheme": "https",
             "path_prefix": "/acme/models/llama",
             "headers": {"X-Beamlit-Model": "llama"}}
        ]
    })
}

async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), 1 << 20)
        .await
        .unwrap()
        .to_vec()
}

#[tokio::test]
async fn post_then_get_round_trips_json() {
    let store = Arc::new(RouteStore::new());
    let app = admin_router(store);

    let response = app
        .clone()
        .oneshot(
            Request::post("/v1alpha1/routes")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(route_json("my-model").to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(
            Request::get("/v1alpha1/routes/my-model")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok()),
        Some("application/json")
    );
    let parsed: serde_json::Value =
        serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(parsed["name"], "my-model");
    assert_eq!(parsed["backends"][1]["path_prefix"], "/acme/models/llama");
}

#[tokio::test]
async fn yaml_negotiation_works_both_ways() {
    let store = Arc::new(RouteStore::new());
    let app = admin_router(store);

    let yaml = serde_yaml::to_string(&route_json("yaml-model")).unwrap();
    let response = app
        .clone()
        .oneshot(
            Request::post("/v1alpha1/routes")
                .header(header::CONTENT_TYPE, "application/yaml")
                .body(Body::from(yaml))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(
            Request::get("/v1alpha1/routes/yaml-model")
                .header(header::ACCEPT, "application/yaml")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok()),
        Some("application/yaml")
    );
    let body = String::from_utf8(body_bytes(response).await).unwrap();
    let parsed: beamlit_routes::Route =
        serde_yaml::from_str(&body).unwrap();
    assert_eq!(parsed.name, "yaml-model");
}

#[tokio::test]
async fn put_upserts_under_the_path_name() {
    let store = Arc::new(RouteStore::new());
    let app = admin_router(store);

    // body says "other"; the path segment wins
    let response = app
        .clone()
        .oneshot(
            Request::put("/v1alpha1/routes/my-model")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(route_json("other").to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(
            Request::get("/v1alpha1/routes/my-model")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn delete_removes_and_returns_the_route() {
    let store = Arc::new(RouteStore::new());
    let app = admin_router(store);

    app.clone()
        .oneshot(
            Request::post("/v1alpha1/routes")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(route_json("gone").to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    let response = app
        .clone()
        .oneshot(
            Request::delete("/v1alpha1/routes/gone")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let parsed: serde_json::Value =
        serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(parsed["name"], "gone");

    let response = app
        .oneshot(
            Request::get("/v1alpha1/routes/gone")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn unsupported_media_type_is_rejected() {
    let store = Arc::new(RouteStore::new());
    let app = admin_router(store);
    let response = app
        .oneshot(
            Request::post("/v1alpha1/routes")
                .header(header::CONTENT_TYPE, "text/csv")
                .body(Body::from("name,foo"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
}

#[tokio::test]
async fn malformed_bodies_get_bad_request() {
    let store = Arc::new(RouteStore::new());
    let app = admin_router(store);
    let response = app
        .oneshot(
            Request::post("/v1alpha1/routes")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from("{not json"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn wrong_method_gets_405() {
    let store = Arc::new(RouteStore::new());
    let app = admin_router(store);
    let response = app
        .oneshot(
            Request::patch("/v1alpha1/routes/my-model")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn healthz_answers_ok() {
    let store = Arc::new(RouteStore::new());
    let app = admin_router(store);
    let response = app
        .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
