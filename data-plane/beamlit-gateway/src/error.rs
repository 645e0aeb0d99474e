use axum::response::IntoResponse;
use http::StatusCode;

#[derive(thiserror::Error, Debug)]
pub enum GatewayError {
    #[error("no route for host {0:?}")]
    NoRoute(String),
    #[error("route {0:?} not found")]
    RouteNotFound(String),
    #[error("route has no serviceable backend")]
    NoBackends,
    #[error("invalid route: {0}")]
    InvalidRoute(#[from] beamlit_routes::RouteValidationError),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("unsupported media type {0:?}")]
    UnsupportedMediaType(String),
    #[error("all backends failed")]
    AllBackendsFailed,
    #[error("upstream returned {0}")]
    UpstreamStatus(StatusCode),
    #[error("token error: {0}")]
    Token(String),
    #[error("upstream error: {0}")]
    Upstream(#[from] reqwest::Error),
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> axum::response::Response {
        use GatewayError::*;
        let (code, message) = match &self {
            NoRoute(_) | RouteNotFound(_) => {
                (StatusCode::NOT_FOUND, self.to_string())
            }
            NoBackends => (StatusCode::NOT_FOUND, self.to_string()),
            InvalidRoute(_) | Decode(_) => {
                (StatusCode::BAD_REQUEST, self.to_string())
            }
            UnsupportedMediaType(_) => {
                (StatusCode::UNSUPPORTED_MEDIA_TYPE, self.to_string())
            }
            AllBackendsFailed => {
                (StatusCode::SERVICE_UNAVAILABLE, self.to_string())
            }
            Token(_) | Upstream(_) | UpstreamStatus(_) => {
                (StatusCode::BAD_GATEWAY, self.to_string())
            }
        };
        (code, message).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_status_mapping() {
        let cases = [
            (
                GatewayError::NoRoute("10.0.0.5".into()),
                StatusCode::NOT_FOUND,
            ),
            (
                GatewayError::RouteNotFound("m".into()),
                StatusCode::NOT_FOUND,
            ),
            (GatewayError::NoBackends, StatusCode::NOT_FOUND),
            (
                GatewayError::Decode("bad json".into()),
                StatusCode::BAD_REQUEST,
            ),
            (
                GatewayError::UnsupportedMediaType("text/csv".into()),
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
            ),
            (
                GatewayError::AllBackendsFailed,
                StatusCode::SERVICE_UNAVAILABLE,
            ),
        ];
        for (error, status) in cases {
            assert_eq!(error.into_response().status(), status);
        }
    }
}
