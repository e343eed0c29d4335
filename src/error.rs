use thiserror::Error;

use crate::machinery::api::ApiError;

/// Errors that stop the operator (or a controller's start). Per-resource
/// reconciliation failures never surface as this type.
#[derive(Debug, Error)]
pub enum OperatorError {
    #[error(
        "Cannot register controller '{name}': another controller named '{existing}' is already registered for kind '{kind}'"
    )]
    DuplicateController {
        name: String,
        existing: String,
        kind: String,
    },

    #[error(
        "Cannot register reconciler '{name}' because its configuration cannot be found. Known controllers are: {known:?}"
    )]
    MissingConfiguration { name: String, known: Vec<String> },

    #[error("No controller registered. Exiting!")]
    NoControllers,

    #[error("Cannot connect to cluster: {0}")]
    CannotConnect(#[source] ApiError),

    #[error("Error retrieving the server version: {0}")]
    ServerVersion(#[source] ApiError),

    #[error("'{kind}' resource kind is not installed on the server")]
    MissingCrd {
        kind: String,
        #[source]
        source: ApiError,
    },

    #[error("failed to start watch for '{kind}': {source}")]
    Watch {
        kind: String,
        #[source]
        source: ApiError,
    },

    #[error("controllers were stopped and cannot be started again")]
    Stopped,

    #[error("invalid settings: {0}")]
    Settings(String),

    #[error("no async runtime available: {0}")]
    Runtime(String),
}

impl OperatorError {
    /// Maps a watch start failure to either the dedicated missing-kind error
    /// (only when the server reports the watched kind itself as unknown) or a
    /// generic watch failure.
    pub fn from_watch_start(kind: &str, source: ApiError) -> Self {
        match &source {
            ApiError::KindNotFound { kind: missing } if missing == kind => Self::MissingCrd {
                kind: kind.to_string(),
                source,
            },
            _ => Self::Watch {
                kind: kind.to_string(),
                source,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_crd_only_for_exact_kind() {
        let error = OperatorError::from_watch_start(
            "samples.overseer.dev",
            ApiError::KindNotFound {
                kind: "samples.overseer.dev".to_string(),
            },
        );
        assert!(matches!(error, OperatorError::MissingCrd { .. }));

        let error = OperatorError::from_watch_start(
            "samples.overseer.dev",
            ApiError::KindNotFound {
                kind: "others.overseer.dev".to_string(),
            },
        );
        assert!(matches!(error, OperatorError::Watch { .. }));

        let error = OperatorError::from_watch_start(
            "samples.overseer.dev",
            ApiError::Unreachable("connection refused".to_string()),
        );
        assert!(matches!(error, OperatorError::Watch { .. }));
    }
}
