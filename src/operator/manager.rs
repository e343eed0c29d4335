use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use futures_util::future::{join_all, try_join_all};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::{error::OperatorError, operator::executor::Executor};

/// A controller as seen by the [`ControllerManager`], independent of its
/// resource type.
#[async_trait]
pub trait ManagedController: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> &'static str;

    /// Watched namespaces, for logging.
    fn namespaces(&self) -> String;

    async fn start(&self, executor: &Executor) -> Result<(), OperatorError>;

    async fn stop(&self) -> Result<(), OperatorError>;
}

#[derive(Default)]
struct ManagerState {
    controllers: BTreeMap<&'static str, Arc<dyn ManagedController>>,
    executor: Option<Executor>,
    /// Set once controllers were stopped; their queues are closed for good.
    stopped: bool,
}

/// Registry of controllers, at most one per resource kind.
#[derive(Default)]
pub struct ControllerManager {
    state: Mutex<ManagerState>,
}

impl ControllerManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a controller; if the manager is already started the
    /// controller is started right away.
    pub async fn add(&self, controller: Arc<dyn ManagedController>) -> Result<(), OperatorError> {
        let mut state = self.state.lock().await;

        if let Some(existing) = state.controllers.get(controller.kind()) {
            return Err(OperatorError::DuplicateController {
                name: controller.name().to_string(),
                existing: existing.name().to_string(),
                kind: controller.kind().to_string(),
            });
        }

        if let Some(executor) = &state.executor {
            controller.start(executor).await?;
        }

        state.controllers.insert(controller.kind(), controller);
        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.controllers.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn is_started(&self) -> bool {
        self.state.lock().await.executor.is_some()
    }

    /// Starts every controller concurrently. Fails on the first controller
    /// that cannot start, after stopping the others. A manager that was
    /// stopped cannot be started again.
    pub async fn start(&self, executor: Executor) -> Result<(), OperatorError> {
        let mut state = self.state.lock().await;
        if state.executor.is_some() {
            return Ok(());
        }
        if state.stopped {
            return Err(OperatorError::Stopped);
        }
        if state.controllers.is_empty() {
            return Err(OperatorError::NoControllers);
        }

        let controllers: Vec<_> = state.controllers.values().cloned().collect();
        let started = try_join_all(controllers.iter().map(|c| c.start(&executor))).await;

        if let Err(e) = started {
            stop_all(&controllers).await;
            state.stopped = true;
            return Err(e);
        }

        info!("started {} controllers", controllers.len());
        state.executor = Some(executor);
        Ok(())
    }

    /// Stops every controller; errors are logged and never prevent the
    /// other controllers from stopping.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        if state.executor.take().is_none() {
            return;
        }
        state.stopped = true;

        let controllers: Vec<_> = state.controllers.values().cloned().collect();
        stop_all(&controllers).await;
    }
}

async fn stop_all(controllers: &[Arc<dyn ManagedController>]) {
    let results = join_all(controllers.iter().map(|c| c.stop())).await;
    for (controller, result) in controllers.iter().zip(results) {
        if let Err(e) = result {
            warn!("failed to stop controller {}: {}", controller.name(), e);
        }
    }
}
