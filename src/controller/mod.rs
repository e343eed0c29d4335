pub mod config;
pub mod context;
pub mod dependent;
pub mod dispatcher;
pub mod retry;
pub mod runner;
pub mod scheduler;

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::{
    controller::{config::ControllerConfiguration, context::Context},
    resources::Resource,
    utils::naming::default_reconciler_name,
};

/// Changes the engine applies after a successful reconcile.
#[derive(Debug, Clone)]
pub enum UpdateAction<R> {
    NoUpdate,
    UpdateResource(R),
    UpdateStatus(R),
    UpdateResourceAndStatus(R),
}

/// Outcome of [`Reconciler::reconcile`].
#[derive(Debug, Clone)]
pub struct UpdateControl<R> {
    pub action: UpdateAction<R>,
    pub reschedule: Option<Duration>,
}

impl<R> UpdateControl<R> {
    pub fn no_update() -> Self {
        Self {
            action: UpdateAction::NoUpdate,
            reschedule: None,
        }
    }

    pub fn update_resource(resource: R) -> Self {
        Self {
            action: UpdateAction::UpdateResource(resource),
            reschedule: None,
        }
    }

    pub fn update_status(resource: R) -> Self {
        Self {
            action: UpdateAction::UpdateStatus(resource),
            reschedule: None,
        }
    }

    pub fn update_resource_and_status(resource: R) -> Self {
        Self {
            action: UpdateAction::UpdateResourceAndStatus(resource),
            reschedule: None,
        }
    }

    /// Reconciles the resource again after `delay`, independently of any
    /// change.
    pub fn reschedule_after(mut self, delay: Duration) -> Self {
        self.reschedule = Some(delay);
        self
    }
}

/// Outcome of [`Reconciler::cleanup`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteControl {
    /// Cleanup is done; the finalizer is removed and deletion proceeds.
    RemoveFinalizer,
    /// Keep the finalizer; deletion stays blocked.
    NoFinalizerRemoval,
}

impl DeleteControl {
    pub fn default_delete() -> Self {
        Self::RemoveFinalizer
    }

    pub fn no_finalizer_removal() -> Self {
        Self::NoFinalizerRemoval
    }
}

#[async_trait]
pub trait Reconciler<R: Resource>: Send + Sync + 'static {
    fn name(&self) -> String {
        default_reconciler_name(std::any::type_name::<Self>())
    }

    fn configuration(&self) -> ControllerConfiguration<R> {
        ControllerConfiguration::new(self.name())
    }

    async fn reconcile(&self, resource: R, ctx: &Context<R>) -> Result<UpdateControl<R>>;

    /// Called for resources marked for deletion that still carry the
    /// controller's finalizer. May run more than once for a resource.
    async fn cleanup(&self, _resource: R, _ctx: &Context<R>) -> Result<DeleteControl> {
        Ok(DeleteControl::default_delete())
    }

    /// Called once retries are exhausted. A returned resource has its status
    /// persisted.
    async fn update_error_status(
        &self,
        _resource: R,
        _ctx: &Context<R>,
        _error: &anyhow::Error,
    ) -> Option<R> {
        None
    }
}
