use std::sync::Arc;

use papaya::HashSet;

use crate::{
    controller::config::ControllerConfiguration,
    resources::{Resource, metadata::ResourceId},
};

/// Decides whether a change of a resource is worth an event.
pub trait EventFilter<R, C>: Send + Sync {
    fn accept_change(&self, configuration: &C, old: Option<&R>, new: &R) -> bool;
}

impl<R, C, F> EventFilter<R, C> for F
where
    F: Fn(&C, Option<&R>, &R) -> bool + Send + Sync,
{
    fn accept_change(&self, configuration: &C, old: Option<&R>, new: &R) -> bool {
        self(configuration, old, new)
    }
}

pub type BoxedEventFilter<R, C> = Arc<dyn EventFilter<R, C>>;

pub fn boxed<R: 'static, C: 'static>(filter: impl EventFilter<R, C> + 'static) -> BoxedEventFilter<R, C> {
    Arc::new(filter)
}

struct And<R, C>(Vec<BoxedEventFilter<R, C>>);

impl<R, C> EventFilter<R, C> for And<R, C> {
    fn accept_change(&self, configuration: &C, old: Option<&R>, new: &R) -> bool {
        self.0
            .iter()
            .all(|filter| filter.accept_change(configuration, old, new))
    }
}

struct Or<R, C>(Vec<BoxedEventFilter<R, C>>);

impl<R, C> EventFilter<R, C> for Or<R, C> {
    fn accept_change(&self, configuration: &C, old: Option<&R>, new: &R) -> bool {
        self.0
            .iter()
            .any(|filter| filter.accept_change(configuration, old, new))
    }
}

/// Accepts when every filter accepts; stops at the first rejection.
pub fn and<R: 'static, C: 'static>(filters: Vec<BoxedEventFilter<R, C>>) -> BoxedEventFilter<R, C> {
    Arc::new(And(filters))
}

/// Accepts when any filter accepts; stops at the first acceptance.
pub fn or<R: 'static, C: 'static>(filters: Vec<BoxedEventFilter<R, C>>) -> BoxedEventFilter<R, C> {
    Arc::new(Or(filters))
}

pub fn pass_through<R: 'static, C: 'static>() -> BoxedEventFilter<R, C> {
    boxed(|_: &C, _: Option<&R>, _: &R| true)
}

pub fn reject_all<R: 'static, C: 'static>() -> BoxedEventFilter<R, C> {
    boxed(|_: &C, _: Option<&R>, _: &R| false)
}

/// Accepts when finalizers are in use and the resource does not carry the
/// configured one yet, so the engine gets a chance to add it.
pub fn finalizer_needed_and_applied<R: Resource>()
-> BoxedEventFilter<R, ControllerConfiguration<R>> {
    boxed(
        |configuration: &ControllerConfiguration<R>, _: Option<&R>, new: &R| {
            configuration.use_finalizer() && !new.meta().has_finalizer(configuration.finalizer())
        },
    )
}

pub fn marked_for_deletion<R: Resource>() -> BoxedEventFilter<R, ControllerConfiguration<R>> {
    boxed(
        |_: &ControllerConfiguration<R>, _: Option<&R>, new: &R| {
            new.meta().is_marked_for_deletion()
        },
    )
}

/// Accepts generation changes only, unless generation awareness is off.
/// Events without an old resource are always accepted.
pub fn generation_aware<R: Resource>() -> BoxedEventFilter<R, ControllerConfiguration<R>> {
    boxed(
        |configuration: &ControllerConfiguration<R>, old: Option<&R>, new: &R| {
            if !configuration.generation_aware() {
                return true;
            }
            match old {
                Some(old) => old.generation() != new.generation(),
                None => true,
            }
        },
    )
}

/// Lets exactly one upcoming event through for each whitelisted identity.
#[derive(Default)]
pub struct OnceWhitelistEventFilter {
    whitelist: HashSet<ResourceId>,
}

impl OnceWhitelistEventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn whitelist_next_event(&self, id: ResourceId) {
        self.whitelist.pin().insert(id);
    }

    pub fn is_whitelisted(&self, id: &ResourceId) -> bool {
        self.whitelist.pin().contains(id)
    }
}

impl<R: Resource, C> EventFilter<R, C> for OnceWhitelistEventFilter {
    fn accept_change(&self, _configuration: &C, _old: Option<&R>, new: &R) -> bool {
        self.whitelist.pin().remove(&new.id())
    }
}
