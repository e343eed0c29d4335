use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_RETRY_INITIAL_INTERVAL, DEFAULT_RETRY_MAX_ATTEMPTS, DEFAULT_RETRY_MULTIPLIER,
};

/// Backoff configuration for failed reconciliations.
///
/// The first retry waits `initial_interval`; every further retry multiplies
/// the previous delay by `multiplier`, capped at `max_interval`. A multiplier
/// of 1 gives a linear (fixed interval) policy. `max_attempts` counts
/// retries, not executions; `None` retries forever.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RetryPolicy {
    #[serde(default = "default_initial_interval", with = "humantime_serde_compat")]
    pub initial_interval: Duration,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "humantime_serde_compat::option"
    )]
    pub max_interval: Option<Duration>,
}

fn default_initial_interval() -> Duration {
    DEFAULT_RETRY_INITIAL_INTERVAL
}

fn default_multiplier() -> f64 {
    DEFAULT_RETRY_MULTIPLIER
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: DEFAULT_RETRY_INITIAL_INTERVAL,
            multiplier: DEFAULT_RETRY_MULTIPLIER,
            max_attempts: Some(DEFAULT_RETRY_MAX_ATTEMPTS),
            max_interval: None,
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: Some(0),
            ..Default::default()
        }
    }

    pub fn with_linear_retry(mut self) -> Self {
        self.multiplier = 1.0;
        self
    }

    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_unlimited_attempts(mut self) -> Self {
        self.max_attempts = None;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = Some(interval);
        self
    }

    /// Rejects policies whose backoff cannot be computed.
    pub fn validate(&self) -> Result<(), String> {
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(format!(
                "retry multiplier must be a finite number >= 1, got {}",
                self.multiplier
            ));
        }
        if let Some(max) = self.max_interval {
            if max < self.initial_interval {
                return Err(format!(
                    "retry max-interval ({}) is shorter than initial-interval ({})",
                    humantime::format_duration(max),
                    humantime::format_duration(self.initial_interval)
                ));
            }
        }
        Ok(())
    }

    pub fn initial_execution(&self) -> RetryExecution {
        RetryExecution {
            policy: self.clone(),
            attempts: 0,
            current: self.initial_interval,
        }
    }
}

/// Progress through a [`RetryPolicy`] for one resource identity.
#[derive(Debug, Clone)]
pub struct RetryExecution {
    policy: RetryPolicy,
    attempts: u32,
    current: Duration,
}

impl RetryExecution {
    /// Delay before the next retry, or `None` once retries are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.is_last_attempt() {
            return None;
        }

        if self.attempts > 0 {
            let cap = self.policy.max_interval.unwrap_or(Duration::MAX);
            let next = self.current.as_secs_f64() * self.policy.multiplier.max(1.0);
            self.current = Duration::try_from_secs_f64(next)
                .unwrap_or(Duration::MAX)
                .min(cap);
        }

        self.attempts += 1;
        Some(self.current)
    }

    /// Number of retries scheduled so far.
    pub fn attempt_count(&self) -> u32 {
        self.attempts
    }

    pub fn is_last_attempt(&self) -> bool {
        self.policy
            .max_attempts
            .is_some_and(|max| self.attempts >= max)
    }

    pub fn info(&self) -> RetryInfo {
        RetryInfo {
            attempt_count: self.attempts,
            last_attempt: self.is_last_attempt(),
        }
    }
}

/// What a reconciler sees of the retry state of its current execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryInfo {
    pub attempt_count: u32,
    pub last_attempt: bool,
}

impl RetryInfo {
    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn is_last_attempt(&self) -> bool {
        self.last_attempt
    }
}

/// humantime (de)serialization of durations, e.g. `"150ms"` or `"2s"`.
pub(crate) mod humantime_serde_compat {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let value = String::deserialize(deserializer)?;
        humantime::parse_duration(&value).map_err(D::Error::custom)
    }

    pub mod option {
        use std::time::Duration;

        use serde::{Deserialize, Deserializer, Serializer, de::Error};

        pub fn serialize<S: Serializer>(
            duration: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match duration {
                Some(duration) => super::serialize(duration, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Duration>, D::Error> {
            let value = Option::<String>::deserialize(deserializer)?;
            value
                .map(|value| humantime::parse_duration(&value).map_err(D::Error::custom))
                .transpose()
        }
    }
}
