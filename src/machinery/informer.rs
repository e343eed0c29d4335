use std::{collections::HashSet, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures_util::StreamExt;
use papaya::HashMap;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{
    machinery::api::{ApiError, ResourceApi, WatchAction, WatchEvent, WatchStream},
    resources::{
        Resource,
        metadata::{LabelSelector, ResourceId},
    },
};

const WATCH_RESTART_DELAY: Duration = Duration::from_secs(1);

/// Callbacks invoked by an [`Informer`] after its cache has been updated.
#[async_trait]
pub trait ResourceEventHandler<R: Resource>: Send + Sync {
    async fn on_add(&self, resource: R);

    async fn on_update(&self, old: R, new: R);

    async fn on_delete(&self, resource: R);
}

/// Keeps a local mirror of one list+watch scope and notifies a handler of
/// every change.
pub struct Informer<R: Resource> {
    namespace: Option<String>,
    cache: Arc<HashMap<ResourceId, R>>,
    task: JoinHandle<()>,
}

struct InformerLoop<R: Resource> {
    api: Arc<dyn ResourceApi<R>>,
    namespace: Option<String>,
    selector: LabelSelector,
    cache: Arc<HashMap<ResourceId, R>>,
    handler: Arc<dyn ResourceEventHandler<R>>,
}

impl<R: Resource> Informer<R> {
    /// Performs the initial list and opens the watch before returning, so
    /// that failures to establish the watch surface to the caller.
    pub async fn start(
        api: Arc<dyn ResourceApi<R>>,
        namespace: Option<String>,
        selector: LabelSelector,
        handler: Arc<dyn ResourceEventHandler<R>>,
    ) -> Result<Self, ApiError> {
        let cache = Arc::new(HashMap::new());
        let informer_loop = InformerLoop {
            api,
            namespace: namespace.clone(),
            selector,
            cache: cache.clone(),
            handler,
        };

        // watch first so nothing between the list and the watch is missed
        let stream = informer_loop
            .api
            .watch(namespace.as_deref(), &informer_loop.selector)
            .await?;
        informer_loop.resync().await?;

        let task = tokio::spawn(informer_loop.run(stream));

        Ok(Self {
            namespace,
            cache,
            task,
        })
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub fn get(&self, id: &ResourceId) -> Option<R> {
        let cache = self.cache.pin();
        cache.get(id).cloned()
    }

    pub fn list(&self) -> Vec<R> {
        let cache = self.cache.pin();
        cache.values().cloned().collect()
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}

impl<R: Resource> Drop for Informer<R> {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl<R: Resource> InformerLoop<R> {
    async fn run(self, mut stream: WatchStream<R>) {
        loop {
            while let Some(event) = stream.next().await {
                match event {
                    Ok(event) => self.apply(event).await,
                    Err(e) => {
                        warn!("watch error for {}: {}", R::kind(), e);
                        break;
                    }
                }
            }

            info!("restarting watch for {}", R::kind());
            stream = loop {
                tokio::time::sleep(WATCH_RESTART_DELAY).await;

                let stream = match self
                    .api
                    .watch(self.namespace.as_deref(), &self.selector)
                    .await
                {
                    Ok(stream) => stream,
                    Err(e) => {
                        warn!("failed to re-establish watch for {}: {}", R::kind(), e);
                        continue;
                    }
                };

                match self.resync().await {
                    Ok(()) => break stream,
                    Err(e) => warn!("failed to resync {}: {}", R::kind(), e),
                }
            };
        }
    }

    /// Lists the scope and reconciles the cache against it, emitting
    /// callbacks for every difference.
    async fn resync(&self) -> Result<(), ApiError> {
        let listed = self
            .api
            .list(self.namespace.as_deref(), &self.selector)
            .await?;

        let mut seen = HashSet::new();
        for resource in listed {
            seen.insert(resource.id());
            self.apply(WatchEvent {
                action: WatchAction::Modified,
                object: resource,
            })
            .await;
        }

        let gone: Vec<R> = {
            let cache = self.cache.pin();
            cache
                .iter()
                .filter(|(id, _)| !seen.contains(*id))
                .map(|(_, resource)| resource.clone())
                .collect()
        };
        for resource in gone {
            self.apply(WatchEvent {
                action: WatchAction::Deleted,
                object: resource,
            })
            .await;
        }

        Ok(())
    }

    async fn apply(&self, event: WatchEvent<R>) {
        let id = event.object.id();

        match event.action {
            WatchAction::Added | WatchAction::Modified => {
                let old = {
                    let cache = self.cache.pin();
                    match cache.get(&id) {
                        Some(cached) if !supersedes(&event.object, cached) => {
                            debug!(
                                "skipping version {} of {}, already at {}",
                                event.object.resource_version().unwrap_or("?"),
                                id,
                                cached.resource_version().unwrap_or("?")
                            );
                            return;
                        }
                        _ => cache.insert(id.clone(), event.object.clone()).cloned(),
                    }
                };

                match old {
                    Some(old) => self.handler.on_update(old, event.object).await,
                    None => self.handler.on_add(event.object).await,
                }
            }
            WatchAction::Deleted => {
                let removed = {
                    let cache = self.cache.pin();
                    cache.remove(&id).cloned()
                };

                if removed.is_none() {
                    debug!("skipping delete of unknown {}", id);
                    return;
                }
                self.handler.on_delete(event.object).await;
            }
        }
    }
}

/// Whether `new` is a later state of the object than `cached`. Resource
/// versions are compared numerically within one incarnation (uid); a
/// replayed older event never wins.
fn supersedes<R: Resource>(new: &R, cached: &R) -> bool {
    if new.meta().uid != cached.meta().uid {
        return true;
    }

    let number = |resource: &R| resource.resource_version()?.parse::<u64>().ok();
    match (number(new), number(cached)) {
        (Some(new), Some(cached)) => new > cached,
        _ => new.resource_version() != cached.resource_version(),
    }
}
