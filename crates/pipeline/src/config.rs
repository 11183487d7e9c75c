use std::str::FromStr;
use std::time::Duration;

use genflow_core::backoff::BackoffPolicy;

/// A malformed configuration value.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{name} must be a valid {expected}, got \"{value}\"")]
    Invalid {
        name: &'static str,
        expected: &'static str,
        value: String,
    },

    #[error("{0}")]
    Inconsistent(String),
}

/// Read `name` through `lookup`, falling back to `default` when unset.
///
/// Shared with the API crate's server config so every variable is parsed
/// the same way.
pub fn env_or<T, F>(lookup: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid {
            name,
            expected: std::any::type_name::<T>(),
            value: raw,
        }),
    }
}

/// Orchestration tuning, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Global admission capacity.
    pub max_concurrent_jobs: usize,
    /// Longest a job waits for an admission ticket before failing.
    pub admission_timeout: Duration,
    /// How long a callback-capable job waits before polling starts.
    pub callback_wait: Duration,
    /// Status-check schedule.
    pub polling: BackoffPolicy,
    /// Provider submission retry schedule.
    pub submit_retry: BackoffPolicy,
    /// How long consumed tokens are kept for duplicate detection.
    pub token_grace: Duration,
    /// How long an unconsumed token may live.
    pub token_max_staleness: Duration,
    pub token_sweep_interval: Duration,
    /// Public base URL used to build `/callback/{provider}` URLs. Without
    /// one, providers are never offered a callback.
    pub callback_base_url: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 1,
            admission_timeout: Duration::from_secs(300),
            callback_wait: Duration::from_secs(120),
            polling: BackoffPolicy::polling(),
            submit_retry: BackoffPolicy::provider_submit(),
            token_grace: Duration::from_secs(600),
            token_max_staleness: Duration::from_secs(86_400),
            token_sweep_interval: Duration::from_secs(60),
            callback_base_url: None,
        }
    }
}

impl PipelineConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                      | Default |
    /// |------------------------------|---------|
    /// | `MAX_CONCURRENT_JOBS`        | `1`     |
    /// | `ADMISSION_TIMEOUT_SECS`     | `300`   |
    /// | `CALLBACK_WAIT_SECS`         | `120`   |
    /// | `POLL_INITIAL_SECS`          | `5`     |
    /// | `POLL_MULTIPLIER`            | `1.5`   |
    /// | `POLL_MAX_INTERVAL_SECS`     | `60`    |
    /// | `POLL_MAX_ATTEMPTS`          | `40`    |
    /// | `SUBMIT_INITIAL_SECS`        | `2`     |
    /// | `SUBMIT_MAX_INTERVAL_SECS`   | `120`   |
    /// | `SUBMIT_MAX_ATTEMPTS`        | `5`     |
    /// | `TOKEN_GRACE_SECS`           | `600`   |
    /// | `TOKEN_MAX_STALENESS_SECS`   | `86400` |
    /// | `TOKEN_SWEEP_INTERVAL_SECS`  | `60`    |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an arbitrary variable
    /// source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let secs = |name: &'static str, default: Duration| -> Result<Duration, ConfigError> {
            env_or(&lookup, name, default.as_secs()).map(Duration::from_secs)
        };

        let polling = BackoffPolicy {
            initial_interval: secs("POLL_INITIAL_SECS", defaults.polling.initial_interval)?,
            multiplier: env_or(&lookup, "POLL_MULTIPLIER", defaults.polling.multiplier)?,
            max_interval: secs("POLL_MAX_INTERVAL_SECS", defaults.polling.max_interval)?,
            max_attempts: env_or(&lookup, "POLL_MAX_ATTEMPTS", defaults.polling.max_attempts)?,
        };
        let submit_retry = BackoffPolicy {
            initial_interval: secs("SUBMIT_INITIAL_SECS", defaults.submit_retry.initial_interval)?,
            multiplier: defaults.submit_retry.multiplier,
            max_interval: secs("SUBMIT_MAX_INTERVAL_SECS", defaults.submit_retry.max_interval)?,
            max_attempts: env_or(
                &lookup,
                "SUBMIT_MAX_ATTEMPTS",
                defaults.submit_retry.max_attempts,
            )?,
        };

        let config = Self {
            max_concurrent_jobs: env_or(&lookup, "MAX_CONCURRENT_JOBS", defaults.max_concurrent_jobs)?,
            admission_timeout: secs("ADMISSION_TIMEOUT_SECS", defaults.admission_timeout)?,
            callback_wait: secs("CALLBACK_WAIT_SECS", defaults.callback_wait)?,
            polling,
            submit_retry,
            token_grace: secs("TOKEN_GRACE_SECS", defaults.token_grace)?,
            token_max_staleness: secs("TOKEN_MAX_STALENESS_SECS", defaults.token_max_staleness)?,
            token_sweep_interval: secs("TOKEN_SWEEP_INTERVAL_SECS", defaults.token_sweep_interval)?,
            callback_base_url: None,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn with_callback_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.callback_base_url = Some(base_url.into().trim_end_matches('/').to_string());
        self
    }

    /// Callback URL handed to the named provider, if callbacks are possible.
    pub fn callback_url(&self, provider: &str) -> Option<String> {
        self.callback_base_url
            .as_ref()
            .map(|base| format!("{base}/callback/{provider}"))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_jobs == 0 {
            return Err(ConfigError::Inconsistent(
                "MAX_CONCURRENT_JOBS must be at least 1".into(),
            ));
        }
        if self.token_sweep_interval.is_zero() {
            return Err(ConfigError::Inconsistent(
                "TOKEN_SWEEP_INTERVAL_SECS must be at least 1".into(),
            ));
        }
        self.polling
            .validate()
            .map_err(|e| ConfigError::Inconsistent(format!("polling policy: {e}")))?;
        self.submit_retry
            .validate()
            .map_err(|e| ConfigError::Inconsistent(format!("submit retry policy: {e}")))?;
        Ok(())
    }
}
