//! OAuth client-credentials token cache for remote backends.
//!
//! Tokens are cached per token endpoint + client id until shortly before
//! expiry. A failed refresh keeps the last good token in use.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::Deserialize;

use crate::error::GatewayError;

const EXPIRY_SKEW_SECS: i64 = 30;

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

#[derive(Default)]
pub struct TokenCache {
    tokens: DashMap<String, CachedToken>,
    http: reqwest::Client,
}

impl TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn cache_key(oauth: &beamlit_routes::OAuth) -> String {
        format!("{}|{}", oauth.token_url, oauth.client_id)
    }

    pub async fn bearer(
        &self,
        oauth: &beamlit_routes::OAuth,
    ) -> Result<String, GatewayError> {
        let key = Self::cache_key(oauth);
        if let Some(cached) = self.tokens.get(&key) {
            if cached.expires_at - Utc::now()
                > Duration::seconds(EXPIRY_SKEW_SECS)
            {
                return Ok(cached.access_token.clone());
            }
        }

        let last_good = self.tokens.get(&key).map(|c| c.access_token.clone());
        match self.fetch(oauth).await {
            Ok(fresh) => {
                let bearer = fresh.access_token.clone();
                self.tokens.insert(key, fresh);
                Ok(bearer)
            }
            // a stale token beats no token; the upstream will reject it if
            // it is truly dead
            Err(error) => match last_good {
                Some(token) => {
                    tracing::warn!(%error, "token refresh failed, reusing last good token");
                    Ok(token)
                }
                None => Err(error),
            },
        }
    }

    async fn fetch(
        &self,
        oauth: &beamlit_routes::OAuth,
    ) -> Result<CachedToken, GatewayError> {
        let response = self
            .http
            .post(&oauth.token_url)
            .basic_auth(&oauth.client_id, Some(&oauth.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(GatewayError::Token(format!(
                "token endpoint returned {}",
                response.status()
            )));
        }
        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::Token(e.to_string()))?;
        Ok(CachedToken {
            access_token: token.access_token,
            expires_at: Utc::now()
                + Duration::seconds(token.expires_in.unwrap_or(3600)),
        })
    }
}
