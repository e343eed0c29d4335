use crate::{
    controller::config::ControllerConfiguration,
    error::OperatorError,
    resources::{Resource, metadata::LabelSelector},
    settings::Settings,
};

/// Resolves the effective configuration of a controller from the
/// reconciler's own configuration and the operator settings.
#[derive(Debug, Clone, Default)]
pub struct ConfigurationService {
    settings: Settings,
}

impl ConfigurationService {
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn known_controllers(&self) -> Vec<String> {
        self.settings.controllers.keys().cloned().collect()
    }

    pub fn concurrent_reconciliations(&self) -> usize {
        self.settings.concurrent_reconciliations
    }

    pub fn check_server_version(&self) -> bool {
        self.settings.check_server_version
    }

    pub fn configuration_for<R: Resource>(
        &self,
        configuration: ControllerConfiguration<R>,
    ) -> Result<ControllerConfiguration<R>, OperatorError> {
        let Some(overrides) = self.settings.controllers.get(configuration.name()) else {
            if self.settings.strict_configuration {
                return Err(OperatorError::MissingConfiguration {
                    name: configuration.name().to_string(),
                    known: self.known_controllers(),
                });
            }
            return validated(configuration);
        };

        let mut configuration = configuration;
        if let Some(namespaces) = &overrides.namespaces {
            configuration = configuration.with_namespaces(namespaces);
        }
        if let Some(finalizer) = &overrides.finalizer {
            configuration = configuration.with_finalizer(finalizer);
        }
        if let Some(generation_aware) = overrides.generation_aware {
            configuration = configuration.with_generation_aware(generation_aware);
        }
        if let Some(selector) = &overrides.label_selector {
            let Some(selector) = LabelSelector::parse(selector) else {
                return Err(OperatorError::Settings(format!(
                    "invalid label selector '{}' for controller '{}'",
                    selector,
                    configuration.name()
                )));
            };
            configuration = configuration.with_label_selector(selector);
        }
        if let Some(workers) = overrides.concurrent_reconciliations {
            configuration = configuration.with_concurrent_reconciliations(workers);
        }
        if let Some(retry) = &overrides.retry {
            configuration = configuration.with_retry(retry.clone());
        }

        validated(configuration)
    }
}

fn validated<R: Resource>(
    configuration: ControllerConfiguration<R>,
) -> Result<ControllerConfiguration<R>, OperatorError> {
    configuration.retry().validate().map_err(|e| {
        OperatorError::Settings(format!(
            "invalid retry policy for controller '{}': {}",
            configuration.name(),
            e
        ))
    })?;
    Ok(configuration)
}
