use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::{
    controller::{
        Reconciler,
        config::ControllerConfiguration,
        dispatcher::ReconciliationDispatcher,
        scheduler::{EventProcessor, SchedulerConfig},
    },
    error::OperatorError,
    event::{controller_source::ControllerResourceEventSource, source::ResourceCache},
    machinery::api::ResourceApi,
    operator::{executor::Executor, manager::ManagedController},
    resources::{Resource, metadata::ResourceId},
};

/// Everything needed to run one reconciler: its primary event source, the
/// dependents' sources and the event processor.
pub struct Controller<R: Resource> {
    configuration: Arc<ControllerConfiguration<R>>,
    source: Arc<ControllerResourceEventSource<R>>,
    processor: Arc<EventProcessor<R>>,
}

impl<R: Resource> std::fmt::Debug for Controller<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("configuration", &self.configuration)
            .finish_non_exhaustive()
    }
}

impl<R: Resource> Controller<R> {
    pub fn new(
        reconciler: Arc<dyn Reconciler<R>>,
        configuration: ControllerConfiguration<R>,
        api: Arc<dyn ResourceApi<R>>,
        default_workers: usize,
    ) -> Self {
        let configuration = Arc::new(configuration);
        let source = Arc::new(ControllerResourceEventSource::new(
            configuration.clone(),
            api,
        ));
        let dispatcher = Arc::new(ReconciliationDispatcher::new(reconciler, source.clone()));

        let worker_count = configuration
            .concurrent_reconciliations()
            .unwrap_or(default_workers);
        let processor = Arc::new(EventProcessor::new(
            configuration.name(),
            SchedulerConfig { worker_count },
            dispatcher,
            configuration.retry().clone(),
        ));

        Self {
            configuration,
            source,
            processor,
        }
    }

    pub fn configuration(&self) -> &Arc<ControllerConfiguration<R>> {
        &self.configuration
    }

    /// Cached snapshot of a primary resource.
    pub fn get(&self, id: &ResourceId) -> Option<R> {
        self.source.get(id)
    }

    pub fn whitelist_next_event(&self, id: ResourceId) {
        self.source.whitelist_next_event(id);
    }

    fn stop_sources(&self) {
        self.source.stop();
        for dependent in self.configuration.dependents() {
            dependent.stop();
        }
    }
}

#[async_trait]
impl<R: Resource> ManagedController for Controller<R> {
    fn name(&self) -> &str {
        self.configuration.name()
    }

    fn kind(&self) -> &'static str {
        R::kind()
    }

    fn namespaces(&self) -> String {
        self.configuration.namespaces().to_string()
    }

    async fn start(&self, executor: &Executor) -> Result<(), OperatorError> {
        // workers first: the initial list of every source is delivered as events
        self.processor.start_workers(executor).await;

        let started = async {
            for dependent in self.configuration.dependents() {
                dependent.start(self.processor.clone()).await?;
            }
            self.source.start(self.processor.clone()).await
        }
        .await;

        if let Err(e) = started {
            self.stop_sources();
            self.processor.stop().await;
            return Err(e);
        }

        info!(
            "started controller {} for {} in {}",
            self.configuration.name(),
            R::kind(),
            self.configuration.namespaces()
        );
        Ok(())
    }

    async fn stop(&self) -> Result<(), OperatorError> {
        self.stop_sources();
        self.processor.stop().await;
        info!("stopped controller {}", self.configuration.name());
        Ok(())
    }
}
