use std::time::Duration;

/// Appended to a resource kind to form its default finalizer name.
pub const FINALIZER_NAME_SUFFIX: &str = "/finalizer";

/// Finalizer name that disables finalizer handling for a controller.
pub const NO_FINALIZER: &str = "overseer.dev/no-finalizer";

/// Informer key used when a source watches every namespace.
pub const ANY_NAMESPACE_KEY: &str = "anyNamespace";

pub const DEFAULT_CONCURRENT_RECONCILIATIONS: usize = 5;

pub const DEFAULT_RETRY_INITIAL_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_RETRY_MULTIPLIER: f64 = 1.5;
pub const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 5;

pub const DEFAULT_CONFIG_FILE: &str = "overseer.toml";
pub const CONFIG_ENV_VAR: &str = "OVERSEER_CONFIG";
pub const SYSTEM_CONFIG_PATH: &str = "/etc/overseer/config.toml";
