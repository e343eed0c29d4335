pub mod configuration;
pub mod executor;
pub mod manager;

use std::sync::Arc;

use tracing::{error, info};

use crate::{
    controller::{Reconciler, config::ControllerConfiguration, runner::Controller},
    error::OperatorError,
    machinery::api::{ApiError, ClusterInfo, ResourceApi},
    operator::{configuration::ConfigurationService, executor::Executor, manager::ControllerManager},
    resources::Resource,
    settings::Settings,
};

/// Process-wide owner of all controllers.
pub struct Operator {
    cluster: Arc<dyn ClusterInfo>,
    configuration: ConfigurationService,
    manager: ControllerManager,
}

impl Operator {
    pub fn new(cluster: Arc<dyn ClusterInfo>, settings: Settings) -> Self {
        Self {
            cluster,
            configuration: ConfigurationService::new(settings),
            manager: ControllerManager::new(),
        }
    }

    pub fn configuration_service(&self) -> &ConfigurationService {
        &self.configuration
    }

    /// Registers `reconciler` with the configuration it declares, merged
    /// with the settings overrides.
    pub async fn register<R, T>(
        &self,
        reconciler: T,
        api: Arc<dyn ResourceApi<R>>,
    ) -> Result<Arc<Controller<R>>, OperatorError>
    where
        R: Resource,
        T: Reconciler<R>,
    {
        let configuration = reconciler.configuration();
        self.register_with_configuration(reconciler, api, configuration)
            .await
    }

    pub async fn register_with_configuration<R, T>(
        &self,
        reconciler: T,
        api: Arc<dyn ResourceApi<R>>,
        configuration: ControllerConfiguration<R>,
    ) -> Result<Arc<Controller<R>>, OperatorError>
    where
        R: Resource,
        T: Reconciler<R>,
    {
        let configuration = self.configuration.configuration_for(configuration)?;
        let name = configuration.name().to_string();
        let namespaces = configuration.namespaces().to_string();

        let controller = Arc::new(Controller::new(
            Arc::new(reconciler),
            configuration,
            api,
            self.configuration.concurrent_reconciliations(),
        ));
        self.manager.add(controller.clone()).await?;

        info!(
            "Registered reconciler: '{}' for resource: '{}' for namespace(s): {}",
            name,
            R::kind(),
            namespaces
        );
        Ok(controller)
    }

    /// Checks the connection to the server and starts every registered
    /// controller.
    pub async fn start(&self) -> Result<(), OperatorError> {
        if self.manager.is_empty().await {
            error!("No controller registered. Exiting!");
            return Err(OperatorError::NoControllers);
        }

        info!("Operator overseer {} starting", env!("CARGO_PKG_VERSION"));

        if self.configuration.check_server_version() {
            match self.cluster.server_version().await {
                Ok(version) => info!("Server version: {}", version),
                Err(e) => {
                    let err = match e {
                        ApiError::Unreachable(_) => OperatorError::CannotConnect(e),
                        e => OperatorError::ServerVersion(e),
                    };
                    error!("{}", err);
                    return Err(err);
                }
            }
        }

        self.manager.start(Executor::current()?).await
    }

    pub async fn stop(&self) {
        if !self.manager.is_started().await {
            return;
        }
        info!("Operator overseer {} is shutting down...", env!("CARGO_PKG_VERSION"));
        self.manager.stop().await;
    }
}
