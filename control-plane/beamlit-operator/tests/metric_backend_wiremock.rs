use beamlit_operator::informers::metric::backend::{
    MetricError, MetricsBackend, PrometheusBackend,
};
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn vector_response(values: &[f64]) -> ResponseTemplate {
    let result: Vec<_> = values
        .iter()
        .map(|v| {
            serde_json::json!({
                "metric": {},
                "value": [1700000000, v.to_string()]
            })
        })
        .collect();
    ResponseTemplate::new(200).set_body_json(serde_json::json!({
        "status": "success",
        "data": {"resultType": "vector", "result": result}
    }))
}

#[tokio::test]
async fn external_metric_parses_vector_samples_into_milli() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/query"))
        .and(query_param(
            "query",
            "queue_depth{app=\"worker\",zone=\"eu\"}",
        ))
        .respond_with(vector_response(&[12.0, 7.5]))
        .expect(1)
        .mount(&server)
        .await;

    let backend = PrometheusBackend::new(&server.uri());
    let samples = backend
        .external_metric("ml", "queue_depth", Some("app=worker,zone=eu"))
        .await
        .unwrap();
    assert_eq!(samples, vec![12_000, 7_500]);
}

#[tokio::test]
async fn empty_result_maps_to_no_metrics() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/query"))
        .respond_with(vector_response(&[]))
        .mount(&server)
        .await;

    let backend = PrometheusBackend::new(&server.uri());
    let error = backend
        .external_metric("ml", "queue_depth", None)
        .await
        .unwrap_err();
    assert!(matches!(error, MetricError::NoMetrics));
}

#[tokio::test]
async fn non_external_sources_are_unsupported() {
    let server = MockServer::start().await;
    let backend = PrometheusBackend::new(&server.uri());
    let error = backend
        .pod_metric("ml", "http_requests", "app=web", None)
        .await
        .unwrap_err();
    assert!(matches!(error, MetricError::Unsupported(_)));
}
