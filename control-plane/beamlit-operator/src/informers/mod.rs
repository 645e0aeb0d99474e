pub mod health;
pub mod metric;

use crate::controller::index::ModelKey;

/// Health signal for a registered model. Emitted on initial sync and on
/// every transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthStatus {
    pub key: ModelKey,
    pub healthy: bool,
}

/// Sustained-window metric signal for a registered model. Emitted on
/// transitions only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricStatus {
    pub key: ModelKey,
    pub reached: bool,
}

/// Informer-internal failure, surfaced out-of-band so it never poisons the
/// per-model state held by the reconciler.
#[derive(Debug)]
pub struct InformerError {
    pub key: ModelKey,
    pub error: anyhow::Error,
}

impl InformerError {
    pub fn new(key: ModelKey, error: impl Into<anyhow::Error>) -> Self {
        Self {
            key,
            error: error.into(),
        }
    }
}

/// Drains the shared informer error channel. Errors are informational; the
/// informers already detached anything that cannot keep watching.
pub async fn log_informer_errors(
    mut rx: tokio::sync::mpsc::Receiver<InformerError>,
) {
    while let Some(err) = rx.recv().await {
        tracing::warn!(key = %err.key, error = %err.error, "informer error");
    }
}
