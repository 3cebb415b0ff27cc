//! Error types shared across the governor

use crate::conversation::StoreError;
use crate::limiter::{LimiterError, Retryable};
use crate::remote::RemoteError;
use thiserror::Error;

/// Result alias used by the governor and its builders
pub type Result<T> = std::result::Result<T, GovernorError>;

/// Errors surfaced by any step of an exchange
#[derive(Debug, Error)]
pub enum GovernorError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Remote API error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Limiter error: {0}")]
    Limiter(#[from] LimiterError),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl GovernorError {
    /// Short label used for logging and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            GovernorError::Store(_) => "store",
            GovernorError::Remote(e) => e.kind(),
            GovernorError::Limiter(_) => "limiter",
            GovernorError::Configuration(_) => "configuration",
        }
    }
}

impl Retryable for GovernorError {
    fn is_transient(&self) -> bool {
        matches!(self, GovernorError::Remote(e) if e.is_transient())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_remote_errors_retry() {
        assert!(GovernorError::Remote(RemoteError::Transient("429".into())).is_transient());
        assert!(!GovernorError::Remote(RemoteError::BadInput("bad".into())).is_transient());
        assert!(!GovernorError::Store(StoreError::Backend("down".into())).is_transient());
    }

    #[test]
    fn test_kind_labels() {
        assert_eq!(GovernorError::Remote(RemoteError::Other("x".into())).kind(), "other");
        assert_eq!(GovernorError::Configuration("x".into()).kind(), "configuration");
    }
}
