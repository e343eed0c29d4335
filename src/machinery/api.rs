use async_trait::async_trait;
use futures_util::stream::BoxStream;
use thiserror::Error;

use crate::resources::{
    Resource,
    metadata::{LabelSelector, ResourceId},
};

#[derive(Debug, Clone, Error)]
pub enum ApiError {
    #[error("{kind} '{id}' not found")]
    NotFound { kind: String, id: ResourceId },

    #[error("the server doesn't have a resource type '{kind}'")]
    KindNotFound { kind: String },

    #[error("{kind} '{id}' already exists")]
    AlreadyExists { kind: String, id: ResourceId },

    #[error(
        "conflict updating '{id}': expected version {expected:?}, found {actual:?}; the object has been modified"
    )]
    Conflict {
        id: ResourceId,
        expected: Option<String>,
        actual: Option<String>,
    },

    #[error("server unreachable: {0}")]
    Unreachable(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("store error: {0}")]
    Store(String),
}

impl ApiError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchAction {
    Added,
    Modified,
    Deleted,
}

/// A single notification of a watch stream. Carries the new object (for
/// deletions, the last known state).
#[derive(Debug, Clone)]
pub struct WatchEvent<R> {
    pub action: WatchAction,
    pub object: R,
}

pub type WatchStream<R> = BoxStream<'static, Result<WatchEvent<R>, ApiError>>;

/// Server-level information, independent of any resource kind.
#[async_trait]
pub trait ClusterInfo: Send + Sync {
    async fn server_version(&self) -> Result<String, ApiError>;
}

/// Typed client of the external store for one resource kind.
#[async_trait]
pub trait ResourceApi<R: Resource>: Send + Sync {
    /// Lists resources in `namespace` (all namespaces when `None`) matching
    /// `selector`.
    async fn list(
        &self,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> Result<Vec<R>, ApiError>;

    /// Opens a watch on changes happening after the call.
    async fn watch(
        &self,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> Result<WatchStream<R>, ApiError>;

    async fn get(&self, id: &ResourceId) -> Result<Option<R>, ApiError>;

    async fn create(&self, resource: R) -> Result<R, ApiError>;

    /// Replaces metadata and spec. The resource version carried by `resource`
    /// is the expected current version; a mismatch yields
    /// [`ApiError::Conflict`]. Status is left untouched.
    async fn replace(&self, resource: R) -> Result<R, ApiError>;

    /// Replaces the status only, with the same optimistic concurrency as
    /// [`ResourceApi::replace`].
    async fn replace_status(&self, resource: R) -> Result<R, ApiError>;

    /// Requests deletion. Resources carrying finalizers are only marked for
    /// deletion.
    async fn delete(&self, id: &ResourceId) -> Result<(), ApiError>;
}
