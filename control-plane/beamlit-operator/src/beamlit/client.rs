//! HTTP client for the Beamlit registry.
//!
//! Upserts are GET-then-create-or-update so they stay replay-safe; deletes
//! tolerate 404 (the registry entry may already be gone).

use http::StatusCode;
use tracing::{debug, instrument};

use super::auth::BeamlitToken;
use super::types::{LABEL_OFFLOADING, Model, RegistryPolicy};
use super::RegistryError;

pub struct Client {
    base_url: String,
    http: reqwest::Client,
    token: BeamlitToken,
}

impl Client {
    pub fn new(base_url: &str, token: BeamlitToken) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
            token,
        }
    }

    pub fn from_env() -> Result<Self, RegistryError> {
        let base_url = std::env::var(super::auth::ENV_BASE_URL)
            .unwrap_or_else(|_| super::auth::DEFAULT_BASE_URL.to_string());
        Ok(Self::new(&base_url, BeamlitToken::from_env()?))
    }

    async fn bearer(&self) -> Result<String, RegistryError> {
        self.token.get_token().await
    }

    async fn get_model_raw(
        &self,
        model: &str,
        environment: &str,
    ) -> Result<Option<Model>, RegistryError> {
        let response = self
            .http
            .get(format!("{}/models/{}", self.base_url, model))
            .query(&[("environment", environment)])
            .bearer_auth(self.bearer().await?)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = Self::check(response).await?;
        Ok(Some(response.json().await?))
    }

    /// Upserts a model: create when absent, update otherwise. Returns the
    /// registry's view, which carries `workspace` and the timestamps.
    #[instrument(skip_all, fields(model = %model.model, env = %model.environment))]
    pub async fn create_or_update_model(
        &self,
        model: &Model,
    ) -> Result<Model, RegistryError> {
        let existing =
            self.get_model_raw(&model.model, &model.environment).await?;
        let response = match existing {
            None => {
                debug!("registry: creating model");
                self.http
                    .post(format!("{}/models", self.base_url))
                    .bearer_auth(self.bearer().await?)
                    .json(model)
                    .send()
                    .await?
            }
            Some(_) => {
                debug!("registry: updating model");
                self.http
                    .put(format!("{}/models/{}", self.base_url, model.model))
                    .query(&[("environment", model.environment.as_str())])
                    .bearer_auth(self.bearer().await?)
                    .json(model)
                    .send()
                    .await?
            }
        };
        let response = Self::check(response).await?;
        Ok(response.json().await?)
    }

    /// Deletes a model from the registry. A missing entry is not an error.
    #[instrument(skip(self))]
    pub async fn delete_model(
        &self,
        model: &str,
        environment: &str,
    ) -> Result<(), RegistryError> {
        let response = self
            .http
            .delete(format!("{}/models/{}", self.base_url, model))
            .query(&[("environment", environment)])
            .bearer_auth(self.bearer().await?)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Self::check(response).await?;
        Ok(())
    }

    /// Flags the model's offloading state on the registry via its labels.
    #[instrument(skip(self))]
    pub async fn notify_offloading(
        &self,
        model: &str,
        environment: &str,
        offloading: bool,
    ) -> Result<(), RegistryError> {
        let Some(mut current) =
            self.get_model_raw(model, environment).await?
        else {
            return Ok(());
        };
        current
            .labels
            .insert(LABEL_OFFLOADING.to_string(), offloading.to_string());
        let response = self
            .http
            .put(format!("{}/models/{}", self.base_url, model))
            .query(&[("environment", environment)])
            .bearer_auth(self.bearer().await?)
            .json(&current)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn get_policy_raw(
        &self,
        name: &str,
    ) -> Result<Option<RegistryPolicy>, RegistryError> {
        let response = self
            .http
            .get(format!("{}/policies/{}", self.base_url, name))
            .bearer_auth(self.bearer().await?)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = Self::check(response).await?;
        Ok(Some(response.json().await?))
    }

    #[instrument(skip_all, fields(policy = %policy.name))]
    pub async fn create_or_update_policy(
        &self,
        policy: &RegistryPolicy,
    ) -> Result<RegistryPolicy, RegistryError> {
        let existing = self.get_policy_raw(&policy.name).await?;
        let response = match existing {
            None => {
                self.http
                    .post(format!("{}/policies", self.base_url))
                    .bearer_auth(self.bearer().await?)
                    .json(policy)
                    .send()
                    .await?
            }
            Some(_) => {
                self.http
                    .put(format!(
                        "{}/policies/{}",
                        self.base_url, policy.name
                    ))
                    .bearer_auth(self.bearer().await?)
                    .json(policy)
                    .send()
                    .await?
            }
        };
        let response = Self::check(response).await?;
        Ok(response.json().await?)
    }

    #[instrument(skip(self))]
    pub async fn delete_policy(
        &self,
        name: &str,
    ) -> Result<(), RegistryError> {
        let response = self
            .http
            .delete(format!("{}/policies/{}", self.base_url, name))
            .bearer_auth(self.bearer().await?)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Self::check(response).await?;
        Ok(())
    }

    async fn check(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, RegistryError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(RegistryError::Status { status, body })
    }
}
