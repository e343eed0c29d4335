use std::sync::Arc;

use anyhow::{Result, anyhow};

use crate::{
    controller::{config::ControllerConfiguration, retry::RetryInfo},
    event::controller_source::ControllerResourceEventSource,
    resources::Resource,
};

/// Passed to every reconcile and cleanup call.
pub struct Context<R: Resource> {
    primary: R,
    retry_info: Option<RetryInfo>,
    source: Arc<ControllerResourceEventSource<R>>,
}

impl<R: Resource> Context<R> {
    pub fn new(
        primary: R,
        retry_info: Option<RetryInfo>,
        source: Arc<ControllerResourceEventSource<R>>,
    ) -> Self {
        Self {
            primary,
            retry_info,
            source,
        }
    }

    /// `None` on a first execution, set on retries.
    pub fn retry_info(&self) -> Option<RetryInfo> {
        self.retry_info
    }

    pub fn configuration(&self) -> &ControllerConfiguration<R> {
        self.source.configuration()
    }

    /// Current instance of the dependent named `name`, as seen by its
    /// event source.
    pub fn secondary<D: Resource>(&self, name: &str) -> Option<D> {
        let dependent = self
            .configuration()
            .dependents()
            .iter()
            .find(|d| d.name() == name)?;

        dependent
            .fetch_any(&self.primary)?
            .downcast::<D>()
            .ok()
            .map(|resource| *resource)
    }

    /// Desired instance of the dependent named `name` for the current
    /// primary.
    pub fn desired<D: Resource>(&self, name: &str) -> Result<D> {
        let dependent = self
            .configuration()
            .dependents()
            .iter()
            .find(|d| d.name() == name)
            .ok_or_else(|| anyhow!("no dependent named '{}'", name))?;

        dependent
            .desired_any(&self.primary)?
            .downcast::<D>()
            .map(|resource| *resource)
            .map_err(|_| anyhow!("dependent '{}' is not a {}", name, D::kind()))
    }

    /// Lets the next change of the current resource through the event
    /// filters even if it does not bump the generation.
    pub fn whitelist_next_event(&self) {
        self.source.whitelist_next_event(self.primary.id());
    }
}
