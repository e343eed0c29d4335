use std::{collections::BTreeSet, fmt, sync::Arc};

use crate::{
    constants::NO_FINALIZER,
    controller::{
        dependent::{DependentResource, DependentResourceController, ManagedDependent},
        retry::RetryPolicy,
    },
    event::filter::{BoxedEventFilter, EventFilter, boxed, pass_through},
    machinery::api::ResourceApi,
    resources::{Resource, metadata::LabelSelector},
    utils::naming::default_finalizer_name,
};

/// Namespaces a source watches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Namespaces {
    #[default]
    All,
    Explicit(BTreeSet<String>),
}

impl Namespaces {
    /// An empty list means every namespace.
    pub fn from_list<I, S>(namespaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let namespaces: BTreeSet<String> = namespaces
            .into_iter()
            .map(|ns| ns.as_ref().to_string())
            .filter(|ns| !ns.is_empty())
            .collect();

        if namespaces.is_empty() {
            Self::All
        } else {
            Self::Explicit(namespaces)
        }
    }
}

impl fmt::Display for Namespaces {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "[all namespaces]"),
            Self::Explicit(namespaces) => {
                let namespaces: Vec<&str> = namespaces.iter().map(String::as_str).collect();
                write!(f, "[{}]", namespaces.join(", "))
            }
        }
    }
}

/// Watch scope shared by primary and dependent sources.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceConfiguration {
    pub namespaces: Namespaces,
    pub label_selector: LabelSelector,
}

impl ResourceConfiguration {
    pub fn watch_all_namespaces(&self) -> bool {
        matches!(self.namespaces, Namespaces::All)
    }
}

/// Static per-kind configuration of a controller.
pub struct ControllerConfiguration<R: Resource> {
    name: String,
    resource: ResourceConfiguration,
    finalizer: String,
    generation_aware: bool,
    retry: RetryPolicy,
    event_filter: BoxedEventFilter<R, ControllerConfiguration<R>>,
    dependents: Vec<Arc<dyn DependentResourceController<R>>>,
    concurrent_reconciliations: Option<usize>,
}

impl<R: Resource> Clone for ControllerConfiguration<R> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            resource: self.resource.clone(),
            finalizer: self.finalizer.clone(),
            generation_aware: self.generation_aware,
            retry: self.retry.clone(),
            event_filter: self.event_filter.clone(),
            dependents: self.dependents.clone(),
            concurrent_reconciliations: self.concurrent_reconciliations,
        }
    }
}

impl<R: Resource> ControllerConfiguration<R> {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self {
            name: name.as_ref().to_string(),
            resource: ResourceConfiguration::default(),
            finalizer: default_finalizer_name(R::kind()),
            generation_aware: true,
            retry: RetryPolicy::default(),
            event_filter: pass_through(),
            dependents: Vec::new(),
            concurrent_reconciliations: None,
        }
    }

    pub fn with_name(mut self, name: impl AsRef<str>) -> Self {
        self.name = name.as_ref().to_string();
        self
    }

    pub fn with_namespaces<I, S>(mut self, namespaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.resource.namespaces = Namespaces::from_list(namespaces);
        self
    }

    pub fn with_all_namespaces(mut self) -> Self {
        self.resource.namespaces = Namespaces::All;
        self
    }

    pub fn with_label_selector(mut self, selector: LabelSelector) -> Self {
        self.resource.label_selector = selector;
        self
    }

    /// [`NO_FINALIZER`] (or an empty name) disables finalizer handling.
    pub fn with_finalizer(mut self, finalizer: impl AsRef<str>) -> Self {
        self.finalizer = finalizer.as_ref().to_string();
        self
    }

    pub fn with_generation_aware(mut self, generation_aware: bool) -> Self {
        self.generation_aware = generation_aware;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// User filter, combined with generation awareness.
    pub fn with_event_filter(
        mut self,
        filter: impl EventFilter<R, ControllerConfiguration<R>> + 'static,
    ) -> Self {
        self.event_filter = boxed(filter);
        self
    }

    /// Appends a dependent resource; dependents are reconciled in the order
    /// they are added.
    pub fn with_dependent<D, T>(mut self, dependent: T, api: Arc<dyn ResourceApi<D>>) -> Self
    where
        D: Resource,
        T: DependentResource<D, R> + 'static,
    {
        self.dependents
            .push(Arc::new(ManagedDependent::new(dependent, api)));
        self
    }

    pub fn with_concurrent_reconciliations(mut self, workers: usize) -> Self {
        self.concurrent_reconciliations = Some(workers.max(1));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &'static str {
        R::kind()
    }

    pub fn resource(&self) -> &ResourceConfiguration {
        &self.resource
    }

    pub fn namespaces(&self) -> &Namespaces {
        &self.resource.namespaces
    }

    pub fn label_selector(&self) -> &LabelSelector {
        &self.resource.label_selector
    }

    pub fn watch_all_namespaces(&self) -> bool {
        self.resource.watch_all_namespaces()
    }

    pub fn finalizer(&self) -> &str {
        &self.finalizer
    }

    pub fn use_finalizer(&self) -> bool {
        !self.finalizer.is_empty() && self.finalizer != NO_FINALIZER
    }

    pub fn generation_aware(&self) -> bool {
        self.generation_aware
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn event_filter(&self) -> &BoxedEventFilter<R, ControllerConfiguration<R>> {
        &self.event_filter
    }

    pub fn dependents(&self) -> &[Arc<dyn DependentResourceController<R>>] {
        &self.dependents
    }

    pub fn concurrent_reconciliations(&self) -> Option<usize> {
        self.concurrent_reconciliations
    }
}

impl<R: Resource> fmt::Debug for ControllerConfiguration<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dependents: Vec<&str> = self.dependents.iter().map(|d| d.name()).collect();
        f.debug_struct("ControllerConfiguration")
            .field("name", &self.name)
            .field("kind", &R::kind())
            .field("resource", &self.resource)
            .field("finalizer", &self.finalizer)
            .field("generation_aware", &self.generation_aware)
            .field("retry", &self.retry)
            .field("dependents", &dependents)
            .field("concurrent_reconciliations", &self.concurrent_reconciliations)
            .finish()
    }
}
