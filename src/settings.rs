use std::{collections::BTreeMap, path::PathBuf};

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use tokio::fs::read_to_string;
use tracing::warn;

use crate::{
    constants::{
        CONFIG_ENV_VAR, DEFAULT_CONCURRENT_RECONCILIATIONS, DEFAULT_CONFIG_FILE, SYSTEM_CONFIG_PATH,
    },
    controller::retry::RetryPolicy,
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Settings {
    #[serde(skip_serializing, skip_deserializing)]
    pub config_path: PathBuf,
    #[serde(skip_serializing, skip_deserializing)]
    pub config_dir: PathBuf,

    #[serde(rename = "data-dir", default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Workers per controller, unless the controller sets its own.
    #[serde(
        rename = "concurrent-reconciliations",
        default = "default_concurrent_reconciliations"
    )]
    pub concurrent_reconciliations: usize,

    #[serde(rename = "check-server-version", default = "default_true")]
    pub check_server_version: bool,

    /// Refuse to register reconcilers without a `[controllers.<name>]`
    /// section.
    #[serde(rename = "strict-configuration", default)]
    pub strict_configuration: bool,

    #[serde(rename = "controllers", default)]
    pub controllers: BTreeMap<String, ControllerOverrides>,
}

/// Per-controller overrides, keyed by controller name.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ControllerOverrides {
    #[serde(rename = "namespaces")]
    pub namespaces: Option<Vec<String>>,
    #[serde(rename = "finalizer")]
    pub finalizer: Option<String>,
    #[serde(rename = "generation-aware")]
    pub generation_aware: Option<bool>,
    /// `key=value[,key=value]`
    #[serde(rename = "label-selector")]
    pub label_selector: Option<String>,
    #[serde(rename = "concurrent-reconciliations")]
    pub concurrent_reconciliations: Option<usize>,
    #[serde(rename = "retry")]
    pub retry: Option<RetryPolicy>,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_concurrent_reconciliations() -> usize {
    DEFAULT_CONCURRENT_RECONCILIATIONS
}

fn default_true() -> bool {
    true
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            config_path: PathBuf::new(),
            config_dir: PathBuf::new(),
            data_dir: default_data_dir(),
            concurrent_reconciliations: DEFAULT_CONCURRENT_RECONCILIATIONS,
            check_server_version: true,
            strict_configuration: false,
            controllers: BTreeMap::new(),
        }
    }
}

async fn resolve_config_path(path_override: Option<PathBuf>) -> Result<PathBuf> {
    let config_path =
        path_override.or_else(|| std::env::var(CONFIG_ENV_VAR).ok().map(PathBuf::from));

    if let Some(path) = config_path {
        return Ok(path);
    }

    warn!("No config path override found, looking for config in default locations");

    let cwd = std::env::current_dir()?;

    let path = cwd.join(DEFAULT_CONFIG_FILE);
    if path.exists() {
        return Ok(path);
    }
    warn!("No config found in current directory ({})", path.display());

    let Some(project_dirs) = directories::ProjectDirs::from("dev", "overseer", "overseer") else {
        bail!("Failed to get config dir");
    };

    let path = project_dirs.config_dir().join("config.toml");
    if path.exists() {
        return Ok(path);
    }
    warn!("No config found in home config dir ({})", path.display());

    let path = PathBuf::from(SYSTEM_CONFIG_PATH);
    if path.exists() {
        return Ok(path);
    }
    warn!("No config found in global config dir ({})", path.display());

    bail!("Couldn't load config file.");
}

impl Settings {
    pub async fn load(path_override: Option<PathBuf>) -> Result<Self> {
        let config_path = resolve_config_path(path_override).await?;

        let config_str = read_to_string(&config_path).await?;
        let mut settings: Self = toml::from_str(&config_str)?;
        settings.config_path = config_path.clone();

        let Some(config_dir) = config_path.parent().map(|p| p.to_path_buf()) else {
            bail!("Couldn't determine config dir");
        };
        settings.config_dir = config_dir;

        Ok(settings)
    }

    /// Settings from `path_override` or the default locations, falling back
    /// to defaults when no file exists anywhere.
    pub async fn load_or_default(path_override: Option<PathBuf>) -> Result<Self> {
        let explicit = path_override.is_some();
        match Self::load(path_override).await {
            Ok(settings) => Ok(settings),
            Err(e) if !explicit && std::env::var(CONFIG_ENV_VAR).is_err() => {
                warn!("{}; using default settings", e);
                Ok(Self::default())
            }
            Err(e) => Err(e),
        }
    }

    pub fn absolute_data_dir(&self) -> PathBuf {
        self.config_dir.join(self.data_dir.clone())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    const SETTINGS: &str = r#"
data-dir = "state"
concurrent-reconciliations = 2
strict-configuration = true

[controllers.samplereconciler]
namespaces = ["default", "staging"]
generation-aware = false
label-selector = "app=web"

[controllers.samplereconciler.retry]
initial-interval = "150ms"
multiplier = 1.0
max-attempts = 5
"#;

    #[tokio::test]
    async fn test_load_from_path() {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let path = dir.path().join("overseer.toml");
        tokio::fs::write(&path, SETTINGS).await.unwrap();

        let settings = Settings::load(Some(path.clone())).await.unwrap();
        assert_eq!(settings.config_path, path);
        assert_eq!(settings.absolute_data_dir(), dir.path().join("state"));
        assert_eq!(settings.concurrent_reconciliations, 2);
        assert!(settings.check_server_version);
        assert!(settings.strict_configuration);

        let overrides = &settings.controllers["samplereconciler"];
        assert_eq!(
            overrides.namespaces,
            Some(vec!["default".to_string(), "staging".to_string()])
        );
        assert_eq!(overrides.generation_aware, Some(false));
        assert_eq!(overrides.finalizer, None);
        let retry = overrides.retry.clone().unwrap();
        assert_eq!(retry.initial_interval, Duration::from_millis(150));
        assert_eq!(retry.max_attempts, Some(5));
    }

    #[test]
    fn test_defaults() {
        let settings: Settings = toml::from_str("").unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.concurrent_reconciliations, 5);
        assert!(settings.controllers.is_empty());
    }

    #[tokio::test]
    async fn test_missing_explicit_path_fails() {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let result = Settings::load_or_default(Some(dir.path().join("absent.toml"))).await;
        assert!(result.is_err());
    }
}
