use std::fmt::Debug;

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::resources::metadata::{ObjectMeta, ResourceId};

pub mod metadata;

/// A resource snapshot owned by the external store. The engine only ever
/// works on clones of it.
pub trait Resource:
    Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Fully qualified resource type name, e.g. `samples.overseer.dev`.
    fn kind() -> &'static str;

    fn meta(&self) -> &ObjectMeta;

    fn meta_mut(&mut self) -> &mut ObjectMeta;

    fn id(&self) -> ResourceId {
        ResourceId::from_meta(self.meta())
    }

    fn generation(&self) -> i64 {
        self.meta().generation
    }

    fn resource_version(&self) -> Option<&str> {
        self.meta().resource_version.as_deref()
    }
}

/// Spec half of a [`CustomResource`]; ties a spec type to its kind name and
/// status type.
pub trait ResourceSpec:
    Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    const KIND: &'static str;

    type Status: Clone + Debug + Default + Serialize + DeserializeOwned + Send + Sync + 'static;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct CustomResource<S: ResourceSpec> {
    pub metadata: ObjectMeta,
    pub spec: S,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<S::Status>,
}

impl<S: ResourceSpec> CustomResource<S> {
    pub fn new(metadata: ObjectMeta, spec: S) -> Self {
        Self {
            metadata,
            spec,
            status: None,
        }
    }

    pub fn status_mut(&mut self) -> &mut S::Status {
        self.status.get_or_insert_with(Default::default)
    }
}

impl<S: ResourceSpec> Resource for CustomResource<S> {
    fn kind() -> &'static str {
        S::KIND
    }

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}
