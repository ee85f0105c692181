//! `ClusterError`: a crate-local taxonomy that shields callers from `kube`'s
//! own error shape (spec §4.9).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("{0}")]
    Other(String),
}

impl From<kube::Error> for ClusterError {
    fn from(err: kube::Error) -> Self {
        match &err {
            kube::Error::Api(resp) if resp.code == 404 => ClusterError::NotFound(resp.message.clone()),
            kube::Error::Api(resp) if resp.code == 401 || resp.code == 403 => {
                ClusterError::Unauthorized(resp.message.clone())
            }
            _ => ClusterError::Other(err.to_string()),
        }
    }
}

impl From<kube::config::KubeconfigError> for ClusterError {
    fn from(err: kube::config::KubeconfigError) -> Self {
        ClusterError::Other(err.to_string())
    }
}

impl From<kube::config::InferConfigError> for ClusterError {
    fn from(err: kube::config::InferConfigError) -> Self {
        ClusterError::Other(err.to_string())
    }
}
