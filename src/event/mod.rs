use std::fmt;

use async_trait::async_trait;

use crate::resources::metadata::ResourceId;

pub mod controller_source;
pub mod filter;
pub mod source;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceAction {
    Added,
    Updated,
    Deleted,
}

/// A change notification for one identity. Carries no resource body: the
/// current snapshot is read from the cache when the event is dispatched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceEvent {
    pub action: ResourceAction,
    pub id: ResourceId,
}

impl ResourceEvent {
    pub fn new(action: ResourceAction, id: ResourceId) -> Self {
        Self { action, id }
    }
}

impl fmt::Display for ResourceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} {}", self.action, self.id)
    }
}

/// Receiver of the events accepted by an event source.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle_event(&self, event: ResourceEvent);
}
