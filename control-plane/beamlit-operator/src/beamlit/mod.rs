pub mod auth;
pub mod client;
pub mod types;

pub use auth::BeamlitToken;
pub use client::Client;
pub use types::{Model, RegistryPolicy, ServerlessConfig};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("BEAMLIT_TOKEN is not set")]
    MissingCredentials,
    #[error("BEAMLIT_TOKEN is not base64 `clientId:clientSecret`: {0}")]
    MalformedToken(String),
    #[error("token endpoint returned {0}")]
    TokenRejected(http::StatusCode),
    #[error("http request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("registry returned {status}: {body}")]
    Status {
        status: http::StatusCode,
        body: String,
    },
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}
