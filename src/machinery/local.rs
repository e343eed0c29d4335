use std::{
    any::Any,
    marker::PhantomData,
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use async_broadcast::{InactiveReceiver, Sender};
use async_trait::async_trait;
use chrono::Utc;
use futures_util::{StreamExt, future};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::{
    machinery::{
        api::{ApiError, ClusterInfo, ResourceApi, WatchAction, WatchEvent, WatchStream},
        store::{Key, Prefix, Store, StoreWrite},
    },
    resources::{
        Resource,
        metadata::{LabelSelector, ResourceId},
    },
};

const WATCH_CHANNEL_CAPACITY: usize = 1024;

fn resource_key<R: Resource>(id: &ResourceId) -> Key<R> {
    Key::object(R::kind(), id)
}

fn store_error(err: anyhow::Error) -> ApiError {
    match err.downcast::<ApiError>() {
        Ok(api_error) => api_error,
        Err(err) => ApiError::Store(err.to_string()),
    }
}

fn next_version(version: Option<&str>) -> String {
    let current = version.and_then(|v| v.parse::<u64>().ok()).unwrap_or(0);
    (current + 1).to_string()
}

fn check_version<R: Resource>(requested: &R, current: &R) -> Result<(), ApiError> {
    match requested.resource_version() {
        Some(expected) if Some(expected) != current.resource_version() => {
            Err(ApiError::Conflict {
                id: current.id(),
                expected: Some(expected.to_string()),
                actual: current.resource_version().map(str::to_string),
            })
        }
        _ => Ok(()),
    }
}

/// Copies the `status` field of `source` onto `target`. Resources are
/// expected to serialize as `{ metadata, spec, status }`.
fn with_status_of<R: Resource>(target: &R, source: &R) -> Result<R, ApiError> {
    let mut value = serde_json::to_value(target)?;
    let status = serde_json::to_value(source)?.get("status").cloned();
    if let Some(object) = value.as_object_mut() {
        match status {
            Some(status) => {
                object.insert("status".to_string(), status);
            }
            None => {
                object.remove("status");
            }
        }
    }
    Ok(serde_json::from_value(value)?)
}

fn desired_state<R: Resource>(resource: &R) -> Result<Value, ApiError> {
    let mut value = serde_json::to_value(resource)?;
    if let Some(object) = value.as_object_mut() {
        object.remove("metadata");
        object.remove("status");
    }
    Ok(value)
}

/// A store-backed api server. Hands out one shared [`LocalApi`] per
/// resource kind so that every client of a kind observes the same watch
/// stream.
pub struct LocalCluster {
    store: Arc<Store>,
    reachable: Arc<AtomicBool>,
    apis: papaya::HashMap<&'static str, Arc<dyn Any + Send + Sync>>,
}

impl LocalCluster {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            reachable: Arc::new(AtomicBool::new(true)),
            apis: papaya::HashMap::new(),
        }
    }

    pub async fn open(dir_path: impl AsRef<Path>) -> anyhow::Result<Arc<Self>> {
        let store = Arc::new(Store::new(dir_path).await?);
        Ok(Arc::new(Self::new(store)))
    }

    pub fn api<R: Resource>(&self) -> Arc<LocalApi<R>> {
        let apis = self.apis.pin();
        let api = apis
            .get_or_insert_with(R::kind(), || {
                Arc::new(LocalApi::<R>::new(self.store.clone(), self.reachable.clone()))
                    as Arc<dyn Any + Send + Sync>
            })
            .clone();

        match api.downcast::<LocalApi<R>>() {
            Ok(api) => api,
            Err(_) => {
                warn!(
                    "kind {} is already served with another type; using a detached api",
                    R::kind()
                );
                Arc::new(LocalApi::new(self.store.clone(), self.reachable.clone()))
            }
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }
}

#[async_trait]
impl ClusterInfo for LocalCluster {
    async fn server_version(&self) -> Result<String, ApiError> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(ApiError::Unreachable("connection refused".to_string()));
        }
        Ok(format!("overseer-local/{}", env!("CARGO_PKG_VERSION")))
    }
}

/// Store-backed implementation of [`ResourceApi`] for one resource kind.
///
/// Generation is bumped whenever anything outside `metadata` and `status`
/// changes. Deleting a resource that carries finalizers only sets its
/// deletion timestamp; the object is removed once the last finalizer is
/// gone.
pub struct LocalApi<R: Resource> {
    store: Arc<Store>,
    events: Sender<WatchEvent<R>>,
    _events_keepalive: InactiveReceiver<WatchEvent<R>>,
    write_lock: Mutex<()>,
    installed: AtomicBool,
    reachable: Arc<AtomicBool>,
    _marker: PhantomData<R>,
}

impl<R: Resource> LocalApi<R> {
    fn new(store: Arc<Store>, reachable: Arc<AtomicBool>) -> Self {
        let (mut events, rx) = async_broadcast::broadcast(WATCH_CHANNEL_CAPACITY);
        events.set_await_active(false);

        Self {
            store,
            events,
            _events_keepalive: rx.deactivate(),
            write_lock: Mutex::new(()),
            installed: AtomicBool::new(true),
            reachable,
            _marker: PhantomData,
        }
    }

    /// Simulates the kind being (un)known to the server.
    pub fn set_installed(&self, installed: bool) {
        self.installed.store(installed, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> Result<(), ApiError> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(ApiError::Unreachable("connection refused".to_string()));
        }
        if !self.installed.load(Ordering::SeqCst) {
            return Err(ApiError::KindNotFound {
                kind: R::kind().to_string(),
            });
        }
        Ok(())
    }

    async fn notify(&self, event: Option<WatchEvent<R>>) {
        let Some(event) = event else {
            return;
        };

        debug!(
            "{} {:?} {} (version {:?})",
            R::kind(),
            event.action,
            event.object.id(),
            event.object.resource_version()
        );

        if let Err(e) = self.events.broadcast(event).await {
            debug!("no active watchers for {}: {}", R::kind(), e);
        }
    }

    async fn write(
        &self,
        id: &ResourceId,
        f: impl FnOnce(Option<R>) -> Result<(StoreWrite<R>, R, Option<WatchEvent<R>>), ApiError>,
    ) -> Result<R, ApiError> {
        self.ensure_available()?;

        // commit and broadcast under one lock so watchers observe commit order
        let _guard = self.write_lock.lock().await;
        let (resource, event) = self
            .store
            .update(&resource_key::<R>(id), |current| {
                let (write, resource, event) = f(current)?;
                Ok((write, (resource, event)))
            })
            .map_err(store_error)?;

        self.notify(event).await;
        Ok(resource)
    }
}

#[async_trait]
impl<R: Resource> ResourceApi<R> for LocalApi<R> {
    async fn list(
        &self,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> Result<Vec<R>, ApiError> {
        self.ensure_available()?;

        let resources: Vec<R> = match namespace {
            Some(namespace) => self.store.list(&Prefix::namespace(R::kind(), namespace)),
            None => self.store.list(&Prefix::kind(R::kind())),
        }
        .map_err(store_error)?;

        Ok(resources
            .into_iter()
            .filter(|r| selector.matches(&r.meta().labels))
            .collect())
    }

    async fn watch(
        &self,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> Result<WatchStream<R>, ApiError> {
        self.ensure_available()?;

        let namespace = namespace.map(str::to_string);
        let selector = selector.clone();
        let stream = self
            .events
            .new_receiver()
            .filter(move |event: &WatchEvent<R>| {
                let meta = event.object.meta();
                let in_namespace = match &namespace {
                    Some(namespace) => meta.namespace.as_ref() == Some(namespace),
                    None => true,
                };
                future::ready(in_namespace && selector.matches(&meta.labels))
            })
            .map(Ok)
            .boxed();

        Ok(stream)
    }

    async fn get(&self, id: &ResourceId) -> Result<Option<R>, ApiError> {
        self.ensure_available()?;
        self.store.get(&resource_key::<R>(id)).map_err(store_error)
    }

    async fn create(&self, resource: R) -> Result<R, ApiError> {
        let id = resource.id();
        self.write(&id, |current| {
            if current.is_some() {
                return Err(ApiError::AlreadyExists {
                    kind: R::kind().to_string(),
                    id: resource.id(),
                });
            }

            let mut created = resource;
            let meta = created.meta_mut();
            meta.uid = Some(uuid::Uuid::new_v4().to_string());
            meta.resource_version = Some(next_version(None));
            meta.generation = 1;
            meta.deletion_timestamp = None;

            let event = WatchEvent {
                action: WatchAction::Added,
                object: created.clone(),
            };
            Ok((StoreWrite::Put(created.clone()), created, Some(event)))
        })
        .await
    }

    async fn replace(&self, resource: R) -> Result<R, ApiError> {
        let id = resource.id();
        self.write(&id, |current| {
            let Some(current) = current else {
                return Err(ApiError::NotFound {
                    kind: R::kind().to_string(),
                    id: resource.id(),
                });
            };
            check_version(&resource, &current)?;

            let mut updated = with_status_of(&resource, &current)?;
            let generation_bump = desired_state(&updated)? != desired_state(&current)?;
            {
                let meta = updated.meta_mut();
                meta.uid = current.meta().uid.clone();
                meta.deletion_timestamp = current.meta().deletion_timestamp;
                meta.resource_version = Some(next_version(current.resource_version()));
                meta.generation = current.generation() + i64::from(generation_bump);
            }

            if updated.meta().is_marked_for_deletion() && updated.meta().finalizers.is_empty() {
                let event = WatchEvent {
                    action: WatchAction::Deleted,
                    object: updated.clone(),
                };
                return Ok((StoreWrite::Delete, updated, Some(event)));
            }

            let event = WatchEvent {
                action: WatchAction::Modified,
                object: updated.clone(),
            };
            Ok((StoreWrite::Put(updated.clone()), updated, Some(event)))
        })
        .await
    }

    async fn replace_status(&self, resource: R) -> Result<R, ApiError> {
        let id = resource.id();
        self.write(&id, |current| {
            let Some(current) = current else {
                return Err(ApiError::NotFound {
                    kind: R::kind().to_string(),
                    id: resource.id(),
                });
            };
            check_version(&resource, &current)?;

            let mut updated = with_status_of(&current, &resource)?;
            updated.meta_mut().resource_version = Some(next_version(current.resource_version()));

            let event = WatchEvent {
                action: WatchAction::Modified,
                object: updated.clone(),
            };
            Ok((StoreWrite::Put(updated.clone()), updated, Some(event)))
        })
        .await
    }

    async fn delete(&self, id: &ResourceId) -> Result<(), ApiError> {
        self.write(id, |current| {
            let Some(current) = current else {
                return Err(ApiError::NotFound {
                    kind: R::kind().to_string(),
                    id: id.clone(),
                });
            };

            if current.meta().finalizers.is_empty() {
                let event = WatchEvent {
                    action: WatchAction::Deleted,
                    object: current.clone(),
                };
                return Ok((StoreWrite::Delete, current, Some(event)));
            }

            if current.meta().is_marked_for_deletion() {
                return Ok((StoreWrite::Keep, current, None));
            }

            let mut marked = current.clone();
            let meta = marked.meta_mut();
            meta.deletion_timestamp = Some(Utc::now());
            meta.resource_version = Some(next_version(current.resource_version()));

            let event = WatchEvent {
                action: WatchAction::Modified,
                object: marked.clone(),
            };
            Ok((StoreWrite::Put(marked.clone()), marked, Some(event)))
        })
        .await
        .map(|_| ())
    }
}
