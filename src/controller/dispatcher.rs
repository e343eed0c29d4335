use std::{any::Any, panic::AssertUnwindSafe, sync::Arc, time::Duration};

use anyhow::{Context as _, Result, anyhow};
use futures_util::FutureExt;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::{
    controller::{
        DeleteControl, Reconciler, UpdateAction, UpdateControl, config::ControllerConfiguration,
        context::Context, retry::RetryInfo,
    },
    event::{controller_source::ControllerResourceEventSource, source::ResourceCache},
    machinery::api::ResourceApi,
    resources::{Resource, metadata::ResourceId},
};

/// What the scheduler has to do after a dispatch.
#[derive(Debug)]
pub enum PostExecution {
    /// The resource is no longer in the cache.
    Gone,
    Success { reschedule: Option<Duration> },
    Failure { error: anyhow::Error },
}

/// Runs one reconciliation (or cleanup) of a resource and applies its
/// outcome to the store.
pub struct ReconciliationDispatcher<R: Resource> {
    reconciler: Arc<dyn Reconciler<R>>,
    source: Arc<ControllerResourceEventSource<R>>,
}

impl<R: Resource> ReconciliationDispatcher<R> {
    pub fn new(
        reconciler: Arc<dyn Reconciler<R>>,
        source: Arc<ControllerResourceEventSource<R>>,
    ) -> Self {
        Self { reconciler, source }
    }

    fn configuration(&self) -> &ControllerConfiguration<R> {
        self.source.configuration()
    }

    fn api(&self) -> &Arc<dyn ResourceApi<R>> {
        self.source.api()
    }

    fn context(&self, resource: &R, retry_info: Option<RetryInfo>) -> Context<R> {
        Context::new(resource.clone(), retry_info, self.source.clone())
    }

    pub async fn dispatch(&self, id: &ResourceId, retry_info: Option<RetryInfo>) -> PostExecution {
        let Some(resource) = self.source.get(id) else {
            debug!("{} is gone, nothing to reconcile", id);
            return PostExecution::Gone;
        };

        let span = info_span!(
            "reconcile",
            controller = %self.configuration().name(),
            name = %id.name,
            namespace = id.namespace.as_deref().unwrap_or_default(),
        );

        let result = AssertUnwindSafe(async {
            if resource.meta().is_marked_for_deletion() {
                self.cleanup(resource, retry_info).await
            } else {
                self.reconcile(resource, retry_info).await
            }
        })
        .catch_unwind()
        .instrument(span)
        .await;

        match result {
            Ok(Ok(reschedule)) => PostExecution::Success { reschedule },
            Ok(Err(error)) => PostExecution::Failure { error },
            Err(panic) => {
                let error = anyhow!("reconciliation panicked: {}", panic_message(&*panic));
                error!("{}: {}", id, error);
                PostExecution::Failure { error }
            }
        }
    }

    /// Resource version of the cached copy of `id`.
    pub fn cached_version(&self, id: &ResourceId) -> Option<String> {
        self.source
            .get(id)
            .and_then(|resource| resource.resource_version().map(str::to_string))
    }

    async fn cleanup(&self, resource: R, retry_info: Option<RetryInfo>) -> Result<Option<Duration>> {
        let finalizer = self.configuration().finalizer();
        if !self.configuration().use_finalizer() || !resource.meta().has_finalizer(finalizer) {
            debug!("finalizer absent, skipping cleanup");
            return Ok(None);
        }

        let ctx = self.context(&resource, retry_info);
        let control = self.reconciler.cleanup(resource.clone(), &ctx).await?;

        match control {
            DeleteControl::RemoveFinalizer => {
                let mut updated = resource;
                updated.meta_mut().remove_finalizer(finalizer);
                self.api()
                    .replace(updated)
                    .await
                    .context("failed to remove finalizer")?;
                info!("removed finalizer {}", finalizer);
            }
            DeleteControl::NoFinalizerRemoval => {
                debug!("cleanup keeps finalizer {}", finalizer);
            }
        }

        Ok(None)
    }

    async fn reconcile(
        &self,
        resource: R,
        retry_info: Option<RetryInfo>,
    ) -> Result<Option<Duration>> {
        let resource = self.ensure_finalizer(resource).await?;

        for dependent in self.configuration().dependents() {
            dependent
                .reconcile(&resource)
                .await
                .with_context(|| format!("failed to reconcile dependent '{}'", dependent.name()))?;
        }

        let ctx = self.context(&resource, retry_info);
        let control = self.reconciler.reconcile(resource, &ctx).await?;

        let reschedule = control.reschedule;
        self.apply(control).await?;
        Ok(reschedule)
    }

    /// Adds the finalizer before the reconciler runs, so that a later
    /// deletion always goes through cleanup.
    async fn ensure_finalizer(&self, resource: R) -> Result<R> {
        let finalizer = self.configuration().finalizer();
        if !self.configuration().use_finalizer() || resource.meta().has_finalizer(finalizer) {
            return Ok(resource);
        }

        let mut updated = resource;
        updated.meta_mut().add_finalizer(finalizer);
        let updated = self
            .api()
            .replace(updated)
            .await
            .context("failed to add finalizer")?;
        info!("added finalizer {}", finalizer);
        Ok(updated)
    }

    fn with_finalizer(&self, mut resource: R) -> R {
        if self.configuration().use_finalizer() && !resource.meta().is_marked_for_deletion() {
            resource
                .meta_mut()
                .add_finalizer(self.configuration().finalizer());
        }
        resource
    }

    async fn apply(&self, control: UpdateControl<R>) -> Result<()> {
        match control.action {
            UpdateAction::NoUpdate => {
                debug!("no update requested");
            }
            UpdateAction::UpdateResource(resource) => {
                self.api()
                    .replace(self.with_finalizer(resource))
                    .await
                    .context("failed to update resource")?;
                debug!("updated resource");
            }
            UpdateAction::UpdateStatus(resource) => {
                self.api()
                    .replace_status(resource)
                    .await
                    .context("failed to update status")?;
                debug!("updated status");
            }
            UpdateAction::UpdateResourceAndStatus(resource) => {
                let updated = self
                    .api()
                    .replace(self.with_finalizer(resource.clone()))
                    .await
                    .context("failed to update resource")?;

                let mut status = resource;
                status.meta_mut().resource_version = updated.meta().resource_version.clone();
                self.api()
                    .replace_status(status)
                    .await
                    .context("failed to update status")?;
                debug!("updated resource and status");
            }
        }

        Ok(())
    }

    /// Persists the reconciler's error status for a resource whose retries
    /// are exhausted. Failures are logged only.
    pub async fn update_error_status(
        &self,
        id: &ResourceId,
        retry_info: RetryInfo,
        error: &anyhow::Error,
    ) -> Option<String> {
        let resource = self.source.get(id)?;

        let ctx = self.context(&resource, Some(retry_info));
        let hook = AssertUnwindSafe(self.reconciler.update_error_status(resource, &ctx, error));
        let updated = match hook.catch_unwind().await {
            Ok(updated) => updated?,
            Err(panic) => {
                warn!(
                    "error status hook of {} panicked: {}",
                    id,
                    panic_message(&*panic)
                );
                return None;
            }
        };

        match self.api().replace_status(updated).await {
            Ok(stored) => {
                info!("stored error status of {}", id);
                stored.resource_version().map(str::to_string)
            }
            Err(e) => {
                warn!("failed to store error status of {}: {}", id, e);
                None
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        *message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}
