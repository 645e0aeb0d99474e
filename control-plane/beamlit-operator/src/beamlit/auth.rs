//! Client-credentials token source for the Beamlit API.
//!
//! Credentials come from `BEAMLIT_TOKEN` (base64 `clientId:clientSecret`) and
//! the base URL from `BEAMLIT_BASE_URL`. The token is cached until shortly
//! before expiry; callers re-ask on every use and get the cached value when
//! it is still fresh.

use base64::Engine as _;
use base64::prelude::BASE64_STANDARD;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use tokio::sync::Mutex;

use super::RegistryError;

pub const ENV_BASE_URL: &str = "BEAMLIT_BASE_URL";
pub const ENV_TOKEN: &str = "BEAMLIT_TOKEN";
pub const DEFAULT_BASE_URL: &str = "https://api.beamlit.com/v0";

/// Refresh this many seconds before the token actually expires.
const EXPIRY_SKEW_SECS: i64 = 30;

pub struct BeamlitToken {
    client_id: String,
    client_secret: String,
    token_url: String,
    http: reqwest::Client,
    cached: Mutex<Option<CachedToken>>,
}

#[derive(Clone)]
struct CachedToken {
    access_token: String,
    expires_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

impl BeamlitToken {
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        base_url: &str,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            token_url: format!("{}/oauth/token", base_url.trim_end_matches('/')),
            http: reqwest::Client::new(),
            cached: Mutex::new(None),
        }
    }

    /// Builds a token source from `BEAMLIT_TOKEN` / `BEAMLIT_BASE_URL`.
    pub fn from_env() -> Result<Self, RegistryError> {
        let raw = std::env::var(ENV_TOKEN)
            .map_err(|_| RegistryError::MissingCredentials)?;
        let decoded = BASE64_STANDARD
            .decode(raw.trim())
            .map_err(|e| RegistryError::MalformedToken(e.to_string()))?;
        let decoded = String::from_utf8(decoded)
            .map_err(|e| RegistryError::MalformedToken(e.to_string()))?;
        let (client_id, client_secret) =
            decoded.split_once(':').ok_or_else(|| {
                RegistryError::MalformedToken(
                    "expected `clientId:clientSecret`".to_string(),
                )
            })?;
        let base_url = std::env::var(ENV_BASE_URL)
            .unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        Ok(Self::new(client_id, client_secret, &base_url))
    }

    /// Returns a bearer token, refreshing through the client-credentials
    /// flow when the cached one is absent or close to expiry.
    pub async fn get_token(&self) -> Result<String, RegistryError> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.expires_at - Utc::now()
                > Duration::seconds(EXPIRY_SKEW_SECS)
            {
                return Ok(token.access_token.clone());
            }
        }

        let response = self
            .http
            .post(&self.token_url)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(RegistryError::TokenRejected(response.status()));
        }
        let token: TokenResponse = response.json().await?;
        let expires_in = token.expires_in.unwrap_or(3600);
        let fresh = CachedToken {
            access_token: token.access_token,
            expires_at: Utc::now() + Duration::seconds(expires_in),
        };
        let bearer = fresh.access_token.clone();
        *cached = Some(fresh);
        Ok(bearer)
    }

    /// Drops the cached token so the next `get_token` refreshes. Used by the
    /// actuator's refresh loop to force rotation checks.
    pub async fn invalidate(&self) {
        *self.cached.lock().await = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_url_is_derived_from_base() {
        let token = BeamlitToken::new("id", "secret", "https://api.beamlit.com/v0/");
        assert_eq!(token.token_url, "https://api.beamlit.com/v0/oauth/token");
    }
}
