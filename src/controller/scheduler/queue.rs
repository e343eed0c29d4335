use std::{collections::HashMap, sync::Arc, time::Duration};

use async_channel::{Receiver, Sender};
use tokio::{sync::Mutex, task::JoinHandle};
use tracing::{debug, warn};

use crate::resources::metadata::ResourceId;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum KeyStatus {
    /// Sitting in the channel, not picked up yet.
    Queued,
    InFlight,
    /// In flight, with another run requested once it is done.
    Pending,
}

/// Coalescing work queue: an identity is in the channel at most once and is
/// never handed to two workers at the same time.
#[derive(Clone)]
pub struct WorkQueue {
    keys: Arc<Mutex<HashMap<ResourceId, KeyStatus>>>,
    tx: Sender<ResourceId>,
}

impl WorkQueue {
    pub fn new() -> (Self, Receiver<ResourceId>) {
        let (tx, rx) = async_channel::unbounded();

        (
            Self {
                keys: Arc::new(Mutex::new(HashMap::new())),
                tx,
            },
            rx,
        )
    }

    pub async fn push(&self, key: &ResourceId) {
        let mut keys = self.keys.lock().await;

        match keys.get(key) {
            None => {
                keys.insert(key.clone(), KeyStatus::Queued);
                self.send(key);
            }
            Some(KeyStatus::InFlight) => {
                keys.insert(key.clone(), KeyStatus::Pending);
            }
            Some(KeyStatus::Queued) | Some(KeyStatus::Pending) => {
                debug!("key {} is already queued", key);
            }
        }
    }

    pub fn push_after(&self, key: &ResourceId, delay: Duration) -> JoinHandle<()> {
        let this = self.clone();
        let key = key.clone();

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.push(&key).await;
        })
    }

    /// Marks a received key as being worked on.
    pub async fn start(&self, key: &ResourceId) {
        let mut keys = self.keys.lock().await;
        keys.insert(key.clone(), KeyStatus::InFlight);
    }

    /// Releases a key; re-queues it when it was pushed while in flight.
    pub async fn done(&self, key: &ResourceId) {
        let mut keys = self.keys.lock().await;

        if let Some(KeyStatus::Pending) = keys.get(key) {
            keys.insert(key.clone(), KeyStatus::Queued);
            self.send(key);
        } else {
            keys.remove(key);
        }
    }

    pub async fn has_pending(&self, key: &ResourceId) -> bool {
        let keys = self.keys.lock().await;
        matches!(keys.get(key), Some(KeyStatus::Pending))
    }

    pub fn close(&self) {
        self.tx.close();
    }

    fn send(&self, key: &ResourceId) {
        if let Err(e) = self.tx.try_send(key.clone()) {
            warn!("failed to queue key {}: {}", key, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_coalesces_pushes() {
        let (queue, rx) = WorkQueue::new();
        let key = ResourceId::namespaced("default", "a");

        queue.push(&key).await;
        queue.push(&key).await;
        assert_eq!(rx.len(), 1);

        let received = rx.recv().await.unwrap();
        queue.start(&received).await;

        // pushes while in flight collapse into a single re-run
        queue.push(&key).await;
        queue.push(&key).await;
        assert!(queue.has_pending(&key).await);
        assert!(rx.is_empty());

        queue.done(&key).await;
        assert_eq!(rx.len(), 1);

        let received = rx.recv().await.unwrap();
        queue.start(&received).await;
        queue.done(&received).await;
        assert!(rx.is_empty());
        assert!(!queue.has_pending(&key).await);
    }

    #[tokio::test]
    async fn test_push_after() {
        let (queue, rx) = WorkQueue::new();
        let key = ResourceId::namespaced("default", "a");

        let timer = queue.push_after(&key, Duration::from_millis(20));
        assert!(rx.is_empty());
        timer.await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), key);

        let cancelled = queue.push_after(&ResourceId::cluster_scoped("b"), Duration::from_millis(20));
        cancelled.abort();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.is_empty());
    }
}
