use thiserror::Error;

/// Failure taxonomy shared by every delivery tier and the cache reconciler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    /// Network unreachable, timeout, or a non-2xx response.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("no candidate targets: {0}")]
    NoCandidateTargets(String),

    #[error("validation error: {0}")]
    Validation(String),

    /// The backend already holds a record with the same identity.
    #[error("duplicate: {0}")]
    Duplicate(String),

    #[error("local store error: {0}")]
    Storage(String),
}

pub type RelayResult<T> = std::result::Result<T, RelayError>;

impl RelayError {
    pub fn is_transport(&self) -> bool {
        matches!(self, RelayError::Transport(_))
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, RelayError::Duplicate(_))
    }
}

impl From<reqwest::Error> for RelayError {
    fn from(err: reqwest::Error) -> Self {
        RelayError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::Validation(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for RelayError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        RelayError::Transport("request timed out".to_string())
    }
}

impl From<anyhow::Error> for RelayError {
    fn from(err: anyhow::Error) -> Self {
        RelayError::Storage(format!("{:#}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_display_carries_detail() {
        let err = RelayError::Transport("connection refused".to_string());
        assert_eq!(err.to_string(), "transport error: connection refused");
        assert!(err.is_transport());
        assert!(!err.is_duplicate());
    }

    #[tokio::test]
    async fn test_timeout_maps_to_transport() {
        let elapsed = tokio::time::timeout(Duration::from_millis(1), std::future::pending::<()>())
            .await
            .unwrap_err();
        let err: RelayError = elapsed.into();
        assert!(err.is_transport());
    }

    #[test]
    fn test_anyhow_maps_to_storage() {
        let err: RelayError = anyhow::anyhow!("disk full").into();
        assert_eq!(err, RelayError::Storage("disk full".to_string()));
    }
}
