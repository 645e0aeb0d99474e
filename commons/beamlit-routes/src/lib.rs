//! Wire schema for gateway routes.
//!
//! A [`Route`] maps a set of hostnames to weighted backends. The operator's
//! embedded-proxy actuator publishes these objects through the gateway admin
//! API (`/v1alpha1/routes`), and the gateway serves traffic from them. Both
//! sides share this crate so the contract cannot drift.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub const SCHEME_HTTP: &str = "http";
pub const SCHEME_HTTPS: &str = "https";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub name: String,
    pub hostnames: Vec<String>,
    pub backends: Vec<Backend>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Backend {
    /// Host of the backend service, optionally with a port
    /// (e.g. `example.com:8080`).
    pub host: String,
    pub weight: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<Auth>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path_prefix: String,
    #[serde(
        default,
        rename = "headers",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub headers_to_add: BTreeMap<String, String>,
    /// `http` or `https`.
    pub scheme: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Auth {
    #[serde(rename = "type")]
    pub auth_type: AuthType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth: Option<OAuth>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthType {
    #[serde(rename = "oauth")]
    OAuth,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuth {
    #[serde(rename = "clientId")]
    pub client_id: String,
    #[serde(rename = "clientSecret")]
    pub client_secret: String,
    #[serde(rename = "token_url")]
    pub token_url: String,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RouteValidationError {
    #[error("route name must not be empty")]
    EmptyName,
    #[error("route {0} has no backends")]
    NoBackends(String),
    #[error("backend {0} has a negative weight")]
    NegativeWeight(String),
    #[error("backend {0} has unsupported scheme {1:?}")]
    UnsupportedScheme(String, String),
}

impl Route {
    pub fn validate(&self) -> Result<(), RouteValidationError> {
        if self.name.is_empty() {
            return Err(RouteValidationError::EmptyName);
        }
        if self.backends.is_empty() {
            return Err(RouteValidationError::NoBackends(self.name.clone()));
        }
        for backend in &self.backends {
            if backend.weight < 0 {
                return Err(RouteValidationError::NegativeWeight(
                    backend.host.clone(),
                ));
            }
            if backend.scheme != SCHEME_HTTP && backend.scheme != SCHEME_HTTPS
            {
                return Err(RouteValidationError::UnsupportedScheme(
                    backend.host.clone(),
                    backend.scheme.clone(),
                ));
            }
        }
        Ok(())
    }

    /// Sum of backend weights; zero means the route cannot serve.
    pub fn total_weight(&self) -> i64 {
        self.backends.iter().map(|b| b.weight as i64).sum()
    }
}

impl Backend {
    /// The host with any `:port` suffix stripped. Used to exclude a failed
    /// backend from retry draws.
    pub fn host_without_port(&self) -> &str {
        self.host.split(':').next().unwrap_or(&self.host)
    }
}
