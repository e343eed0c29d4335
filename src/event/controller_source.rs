use std::sync::Arc;

use tracing::debug;

use crate::{
    controller::config::ControllerConfiguration,
    error::OperatorError,
    event::{
        EventHandler,
        filter::{
            BoxedEventFilter, OnceWhitelistEventFilter, and, finalizer_needed_and_applied,
            generation_aware, marked_for_deletion, or,
        },
        source::{AcceptFn, ResourceCache, ResourceEventSource},
    },
    machinery::api::ResourceApi,
    resources::{Resource, metadata::ResourceId},
};

/// Event source of a controller's primary kind.
///
/// A change is accepted when any of these holds: the finalizer still has to
/// be added, the resource is marked for deletion, the user filter and the
/// generation check both accept, or the identity was whitelisted for one
/// event (generation-aware controllers only).
pub struct ControllerResourceEventSource<R: Resource> {
    configuration: Arc<ControllerConfiguration<R>>,
    whitelist: Option<Arc<OnceWhitelistEventFilter>>,
    source: ResourceEventSource<R>,
}

impl<R: Resource> ControllerResourceEventSource<R> {
    pub fn new(configuration: Arc<ControllerConfiguration<R>>, api: Arc<dyn ResourceApi<R>>) -> Self {
        let mut filters: Vec<BoxedEventFilter<R, ControllerConfiguration<R>>> = vec![
            finalizer_needed_and_applied(),
            marked_for_deletion(),
            and(vec![configuration.event_filter().clone(), generation_aware()]),
        ];

        let whitelist = configuration
            .generation_aware()
            .then(|| Arc::new(OnceWhitelistEventFilter::new()));
        if let Some(whitelist) = &whitelist {
            filters.push(whitelist.clone());
        }

        let chain = or(filters);
        let accept: AcceptFn<R> = {
            let configuration = configuration.clone();
            Arc::new(move |old: Option<&R>, new: &R| {
                chain.accept_change(&configuration, old, new)
            })
        };

        let source = ResourceEventSource::for_resource(
            configuration.name(),
            api,
            configuration.resource().clone(),
            accept,
        );

        Self {
            configuration,
            whitelist,
            source,
        }
    }

    pub fn configuration(&self) -> &Arc<ControllerConfiguration<R>> {
        &self.configuration
    }

    pub fn api(&self) -> &Arc<dyn ResourceApi<R>> {
        self.source.api()
    }

    pub async fn start(&self, handler: Arc<dyn EventHandler>) -> Result<(), OperatorError> {
        self.source.start(handler).await
    }

    pub fn stop(&self) {
        self.source.stop();
    }

    /// Lets the next event for `id` through regardless of the other
    /// filters. No-op for controllers that are not generation-aware, which
    /// see every change anyway.
    pub fn whitelist_next_event(&self, id: ResourceId) {
        match &self.whitelist {
            Some(whitelist) => {
                debug!("whitelisting next event for {}", id);
                whitelist.whitelist_next_event(id);
            }
            None => debug!("not generation aware, ignoring whitelist for {}", id),
        }
    }
}

impl<R: Resource> ResourceCache<R> for ControllerResourceEventSource<R> {
    fn get(&self, id: &ResourceId) -> Option<R> {
        self.source.get(id)
    }
}
