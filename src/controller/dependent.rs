use std::{any::Any, marker::PhantomData, sync::Arc};

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, info};

use crate::{
    controller::config::ResourceConfiguration,
    error::OperatorError,
    event::{
        EventHandler,
        source::{ResourceCache, ResourceEventSource},
    },
    machinery::api::ResourceApi,
    resources::{
        Resource,
        metadata::{OwnerReference, ResourceId},
    },
    utils::naming::default_reconciler_name,
};

/// An auxiliary resource `D` derived from a primary resource `P`.
///
/// By default a dependent is created when missing, never updated, and owned
/// by its primary (tagged with an owner reference, through which its events
/// are routed back to the primary).
pub trait DependentResource<D: Resource, P: Resource>: Send + Sync {
    fn name(&self) -> String {
        default_reconciler_name(std::any::type_name::<Self>())
    }

    /// Desired state of the dependent for `owner`.
    fn build(&self, owner: &P) -> Result<D>;

    /// Reconciles an existing instance; returned unchanged by default.
    fn update(&self, fetched: D, _owner: &P) -> Result<D> {
        Ok(fetched)
    }

    fn created(&self) -> bool {
        true
    }

    fn updated(&self) -> bool {
        false
    }

    fn owned(&self) -> bool {
        true
    }

    /// Identity of the dependent belonging to `owner`: same name and
    /// namespace unless overridden.
    fn associated_id(&self, owner: &P) -> ResourceId {
        ResourceId::from_meta(owner.meta())
    }

    /// Watch scope of the dependent kind.
    fn resource(&self) -> ResourceConfiguration {
        ResourceConfiguration::default()
    }
}

/// Type-erased dependent as driven by a controller of `P`.
#[async_trait]
pub trait DependentResourceController<P: Resource>: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> &'static str;

    /// Starts watching the dependent kind; changes are reported to `handler`
    /// as events for the owning primary.
    async fn start(&self, handler: Arc<dyn EventHandler>) -> Result<(), OperatorError>;

    fn stop(&self);

    async fn reconcile(&self, owner: &P) -> Result<()>;

    /// Current instance for `owner`, boxed as the concrete dependent type.
    fn fetch_any(&self, owner: &P) -> Option<Box<dyn Any + Send>>;

    /// Desired instance for `owner`, boxed as the concrete dependent type.
    fn desired_any(&self, owner: &P) -> Result<Box<dyn Any + Send>>;
}

pub struct ManagedDependent<D: Resource, P: Resource, T> {
    name: String,
    dependent: T,
    source: ResourceEventSource<D>,
    _marker: PhantomData<fn() -> P>,
}

impl<D, P, T> ManagedDependent<D, P, T>
where
    D: Resource,
    P: Resource,
    T: DependentResource<D, P>,
{
    pub fn new(dependent: T, api: Arc<dyn ResourceApi<D>>) -> Self {
        let name = dependent.name();
        let source = ResourceEventSource::new(
            format!("{} ({})", name, D::kind()),
            api,
            dependent.resource(),
            Arc::new(|_: Option<&D>, _: &D| true),
            Arc::new(owner_of::<D, P>),
        );

        Self {
            name,
            dependent,
            source,
            _marker: PhantomData,
        }
    }

    fn with_owner(&self, mut desired: D, owner: &P) -> D {
        let meta = desired.meta_mut();
        if meta.controller_owner(P::kind()).is_none() {
            meta.owner_references.push(OwnerReference {
                kind: P::kind().to_string(),
                name: owner.meta().name.clone(),
                uid: owner.meta().uid.clone(),
                controller: true,
            });
        }
        desired
    }

    async fn fetch(&self, id: &ResourceId) -> Result<Option<D>> {
        if let Some(cached) = self.source.get(id) {
            return Ok(Some(cached));
        }
        // the cache may not have caught up with our own create yet
        Ok(self.source.api().get(id).await?)
    }
}

/// Maps a dependent to its primary: through the owner reference when there
/// is one, otherwise to the primary with the same identity.
fn owner_of<D: Resource, P: Resource>(dependent: &D) -> Option<ResourceId> {
    let meta = dependent.meta();
    match meta.controller_owner(P::kind()) {
        Some(owner) => Some(ResourceId::new(&owner.name, meta.namespace.as_ref())),
        None => Some(dependent.id()),
    }
}

#[async_trait]
impl<D, P, T> DependentResourceController<P> for ManagedDependent<D, P, T>
where
    D: Resource,
    P: Resource,
    T: DependentResource<D, P> + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        D::kind()
    }

    async fn start(&self, handler: Arc<dyn EventHandler>) -> Result<(), OperatorError> {
        self.source.start(handler).await
    }

    fn stop(&self) {
        self.source.stop();
    }

    async fn reconcile(&self, owner: &P) -> Result<()> {
        let id = self.dependent.associated_id(owner);
        let current = self.fetch(&id).await?;

        match current {
            None if self.dependent.created() => {
                let mut desired = self.dependent.build(owner)?;
                if self.dependent.owned() {
                    desired = self.with_owner(desired, owner);
                }
                info!("creating dependent {} {}", D::kind(), desired.id());
                self.source.api().create(desired).await?;
            }
            None => debug!("dependent {} {} absent, not created", D::kind(), id),
            Some(current) if self.dependent.updated() => {
                let reconciled = self.dependent.update(current.clone(), owner)?;
                if serde_json::to_value(&reconciled)? != serde_json::to_value(&current)? {
                    info!("updating dependent {} {}", D::kind(), id);
                    self.source.api().replace(reconciled).await?;
                }
            }
            Some(_) => {}
        }

        Ok(())
    }

    fn fetch_any(&self, owner: &P) -> Option<Box<dyn Any + Send>> {
        let id = self.dependent.associated_id(owner);
        self.source
            .get(&id)
            .map(|resource| Box::new(resource) as Box<dyn Any + Send>)
    }

    fn desired_any(&self, owner: &P) -> Result<Box<dyn Any + Send>> {
        let mut desired = self.dependent.build(owner)?;
        if self.dependent.owned() {
            desired = self.with_owner(desired, owner);
        }
        Ok(Box::new(desired))
    }
}
