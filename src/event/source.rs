use std::sync::Arc;

use async_trait::async_trait;
use papaya::HashMap;
use tracing::{debug, info};

use crate::{
    constants::ANY_NAMESPACE_KEY,
    controller::config::{Namespaces, ResourceConfiguration},
    error::OperatorError,
    event::{EventHandler, ResourceAction, ResourceEvent},
    machinery::{
        api::ResourceApi,
        informer::{Informer, ResourceEventHandler},
    },
    resources::{Resource, metadata::ResourceId},
};

/// Read-only view of the watch-maintained store. Every returned value is a
/// clone; absence means the resource is gone.
pub trait ResourceCache<R: Resource>: Send + Sync {
    fn get(&self, id: &ResourceId) -> Option<R>;
}

/// Accepts or rejects a change given the previous and the new snapshot.
pub type AcceptFn<R> = Arc<dyn Fn(Option<&R>, &R) -> bool + Send + Sync>;

/// Maps a changed resource to the identity that has to be reconciled.
pub type TargetFn<R> = Arc<dyn Fn(&R) -> Option<ResourceId> + Send + Sync>;

/// One informer per watched namespace (or a single any-namespace informer)
/// for a resource kind. Changes passing `accept` are forwarded as
/// [`ResourceEvent`]s for the identity returned by `target`.
pub struct ResourceEventSource<R: Resource> {
    name: String,
    api: Arc<dyn ResourceApi<R>>,
    resource: ResourceConfiguration,
    accept: AcceptFn<R>,
    target: TargetFn<R>,
    informers: HashMap<String, Arc<Informer<R>>>,
}

impl<R: Resource> ResourceEventSource<R> {
    pub fn new(
        name: impl AsRef<str>,
        api: Arc<dyn ResourceApi<R>>,
        resource: ResourceConfiguration,
        accept: AcceptFn<R>,
        target: TargetFn<R>,
    ) -> Self {
        Self {
            name: name.as_ref().to_string(),
            api,
            resource,
            accept,
            target,
            informers: HashMap::new(),
        }
    }

    /// Source forwarding every change of `R` as an event for the resource
    /// itself.
    pub fn for_resource(
        name: impl AsRef<str>,
        api: Arc<dyn ResourceApi<R>>,
        resource: ResourceConfiguration,
        accept: AcceptFn<R>,
    ) -> Self {
        Self::new(name, api, resource, accept, Arc::new(|r: &R| Some(r.id())))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn api(&self) -> &Arc<dyn ResourceApi<R>> {
        &self.api
    }

    /// Starts an informer for every target namespace that has none yet.
    pub async fn start(&self, handler: Arc<dyn EventHandler>) -> Result<(), OperatorError> {
        let scopes: Vec<(String, Option<String>)> = match &self.resource.namespaces {
            Namespaces::All => vec![(ANY_NAMESPACE_KEY.to_string(), None)],
            Namespaces::Explicit(namespaces) => namespaces
                .iter()
                .map(|ns| (ns.clone(), Some(ns.clone())))
                .collect(),
        };

        for (key, namespace) in scopes {
            if self.informers.pin().contains_key(&key) {
                debug!("{}: informer for {} already running", self.name, key);
                continue;
            }

            let forwarder = Arc::new(EventForwarder {
                source: self.name.clone(),
                accept: self.accept.clone(),
                target: self.target.clone(),
                handler: handler.clone(),
            });

            let informer = Informer::start(
                self.api.clone(),
                namespace,
                self.resource.label_selector.clone(),
                forwarder,
            )
            .await
            .map_err(|e| OperatorError::from_watch_start(R::kind(), e))?;

            debug!("{}: registered informer for {}", self.name, key);
            self.informers.pin().insert(key, Arc::new(informer));
        }

        Ok(())
    }

    /// Stops every informer. Never fails; a stop that cannot complete is
    /// only logged.
    pub fn stop(&self) {
        let informers = self.informers.pin();
        for (key, informer) in informers.iter() {
            info!("{}: stopping informer for {}", self.name, key);
            informer.stop();
        }
        informers.clear();
    }

    pub fn is_running(&self) -> bool {
        !self.informers.pin().is_empty()
    }

    /// All cached resources across namespaces.
    pub fn list(&self) -> Vec<R> {
        self.informers
            .pin()
            .values()
            .flat_map(|informer| informer.list())
            .collect()
    }
}

impl<R: Resource> ResourceCache<R> for ResourceEventSource<R> {
    fn get(&self, id: &ResourceId) -> Option<R> {
        let informers = self.informers.pin();
        id.namespace
            .as_deref()
            .and_then(|ns| informers.get(ns))
            .or_else(|| informers.get(ANY_NAMESPACE_KEY))
            .and_then(|informer| informer.get(id))
    }
}

struct EventForwarder<R: Resource> {
    source: String,
    accept: AcceptFn<R>,
    target: TargetFn<R>,
    handler: Arc<dyn EventHandler>,
}

impl<R: Resource> EventForwarder<R> {
    async fn received(&self, action: ResourceAction, old: Option<&R>, new: &R) {
        if !(self.accept)(old, new) {
            debug!(
                "{}: skipping {:?} of {} with version {:?}",
                self.source,
                action,
                new.id(),
                new.resource_version()
            );
            return;
        }

        let Some(id) = (self.target)(new) else {
            debug!("{}: no target for {:?} of {}", self.source, action, new.id());
            return;
        };

        self.handler
            .handle_event(ResourceEvent::new(action, id))
            .await;
    }
}

#[async_trait]
impl<R: Resource> ResourceEventHandler<R> for EventForwarder<R> {
    async fn on_add(&self, resource: R) {
        self.received(ResourceAction::Added, None, &resource).await;
    }

    async fn on_update(&self, old: R, new: R) {
        self.received(ResourceAction::Updated, Some(&old), &new)
            .await;
    }

    async fn on_delete(&self, resource: R) {
        self.received(ResourceAction::Deleted, None, &resource)
            .await;
    }
}
