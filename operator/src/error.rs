use std::time::Duration;

use kube::Error as KubeError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] KubeError),

    #[error("request for {kind} {name} timed out after {timeout:?}")]
    RequestTimeout {
        kind: &'static str,
        name: String,
        timeout: Duration,
    },

    #[error("MissingObjectKey: {0}")]
    MissingObjectKey(&'static str),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("caches for {pending:?} did not sync within {timeout:?}")]
    CacheSyncTimeout {
        pending: Vec<&'static str>,
        timeout: Duration,
    },

    #[error("Invalid configuration: {0}")]
    Config(#[from] envy::Error),

    #[error("Metrics registry error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl Error {
    /// Whether retrying the same request later can succeed.
    ///
    /// Everything reachable from a reconciliation pass is retried through the
    /// work queue; this only decides how loudly it is reported.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Kube(_) | Error::RequestTimeout { .. } => true,
            _ => false,
        }
    }

    fn api_response(&self) -> Option<&kube::core::ErrorResponse> {
        match self {
            Error::Kube(KubeError::Api(response)) => Some(response),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.api_response().is_some_and(|response| response.code == 404)
    }

    pub fn is_already_exists(&self) -> bool {
        self.api_response()
            .is_some_and(|response| response.code == 409 && response.reason == "AlreadyExists")
    }

    /// A write rejected because of a stale `resourceVersion` precondition.
    pub fn is_conflict(&self) -> bool {
        self.api_response()
            .is_some_and(|response| response.code == 409 && response.reason == "Conflict")
    }

    /// The cluster already differs from what the cache showed when the write
    /// was planned. The watch event carrying that change triggers the next pass.
    pub fn is_stale_read(&self) -> bool {
        self.is_already_exists() || self.is_not_found() || self.is_conflict()
    }
}
