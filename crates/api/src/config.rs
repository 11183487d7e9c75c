use std::path::PathBuf;

use genflow_pipeline::config::env_or;
use genflow_pipeline::ConfigError;

/// Where one job type's generations are sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSettings {
    /// Name used in the provider's callback URL (`/callback/{name}`).
    pub name: String,
    /// Base URL of the REST service. `None` selects the in-process
    /// scripted provider.
    pub url: Option<String>,
    /// Whether the service pushes completion callbacks.
    pub callbacks: bool,
}

/// Server configuration loaded from environment variables.
///
/// All fields have defaults suitable for local development.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address (default: `0.0.0.0`).
    pub host: String,
    /// Bind port (default: `3000`).
    pub port: u16,
    /// Allowed CORS origins, parsed from comma-separated `CORS_ORIGINS`.
    pub cors_origins: Vec<String>,
    /// HTTP request timeout in seconds (default: `30`).
    pub request_timeout_secs: u64,
    /// How long shutdown waits for running jobs to stop (default: `30`).
    pub shutdown_timeout_secs: u64,
    /// Externally reachable base URL, used to build callback URLs.
    pub public_base_url: Option<String>,
    /// HMAC key providers sign inbound callbacks with.
    pub callback_secret: Option<String>,
    /// HMAC key for outbound submitter webhooks. Never falls back to
    /// `callback_secret`.
    pub webhook_secret: Option<String>,
    /// JSON-lines event journal location.
    pub event_journal_path: Option<PathBuf>,
    pub image_provider: ProviderSettings,
    pub video_provider: ProviderSettings,
}

impl ServerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                    | Default                 |
    /// |----------------------------|-------------------------|
    /// | `HOST`                     | `0.0.0.0`               |
    /// | `PORT`                     | `3000`                  |
    /// | `CORS_ORIGINS`             | `http://localhost:5173` |
    /// | `REQUEST_TIMEOUT_SECS`     | `30`                    |
    /// | `SHUTDOWN_TIMEOUT_SECS`    | `30`                    |
    /// | `PUBLIC_BASE_URL`          | unset                   |
    /// | `CALLBACK_SECRET`          | unset                   |
    /// | `WEBHOOK_SECRET`           | unset                   |
    /// | `EVENT_JOURNAL_PATH`       | unset                   |
    /// | `IMAGE_PROVIDER_URL`       | unset (scripted)        |
    /// | `IMAGE_PROVIDER_NAME`      | `image`                 |
    /// | `IMAGE_PROVIDER_CALLBACKS` | `true`                  |
    /// | `VIDEO_PROVIDER_URL`       | unset (scripted)        |
    /// | `VIDEO_PROVIDER_NAME`      | `video`                 |
    /// | `VIDEO_PROVIDER_CALLBACKS` | `true`                  |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let optional = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let cors_origins: Vec<String> = optional("CORS_ORIGINS")
            .unwrap_or_else(|| "http://localhost:5173".into())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let public_base_url = optional("PUBLIC_BASE_URL").map(|u| u.trim_end_matches('/').to_string());
        if let Some(url) = &public_base_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(ConfigError::Invalid {
                    name: "PUBLIC_BASE_URL",
                    expected: "http(s) URL",
                    value: url.clone(),
                });
            }
        }

        Ok(Self {
            host: optional("HOST").unwrap_or_else(|| "0.0.0.0".into()),
            port: env_or(&lookup, "PORT", 3000)?,
            cors_origins,
            request_timeout_secs: env_or(&lookup, "REQUEST_TIMEOUT_SECS", 30)?,
            shutdown_timeout_secs: env_or(&lookup, "SHUTDOWN_TIMEOUT_SECS", 30)?,
            public_base_url,
            callback_secret: optional("CALLBACK_SECRET"),
            webhook_secret: optional("WEBHOOK_SECRET"),
            event_journal_path: optional("EVENT_JOURNAL_PATH").map(PathBuf::from),
            image_provider: ProviderSettings {
                name: optional("IMAGE_PROVIDER_NAME").unwrap_or_else(|| "image".into()),
                url: optional("IMAGE_PROVIDER_URL"),
                callbacks: env_or(&lookup, "IMAGE_PROVIDER_CALLBACKS", true)?,
            },
            video_provider: ProviderSettings {
                name: optional("VIDEO_PROVIDER_NAME").unwrap_or_else(|| "video".into()),
                url: optional("VIDEO_PROVIDER_URL"),
                callbacks: env_or(&lookup, "VIDEO_PROVIDER_CALLBACKS", true)?,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<ServerConfig, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(move |name| map.get(name).cloned())
    }

    #[test]
    fn defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.port, 3000);
        assert_eq!(config.cors_origins, vec!["http://localhost:5173"]);
        assert!(config.public_base_url.is_none());
        assert!(config.callback_secret.is_none());
        assert!(config.webhook_secret.is_none());
        assert_eq!(config.image_provider.name, "image");
        assert!(config.image_provider.url.is_none());
        assert!(config.video_provider.callbacks);
    }

    #[test]
    fn overrides() {
        let config = load(&[
            ("PORT", "8080"),
            ("CORS_ORIGINS", "http://a.test, http://b.test,"),
            ("PUBLIC_BASE_URL", "https://genflow.example.com/"),
            ("CALLBACK_SECRET", "s3cret"),
            ("VIDEO_PROVIDER_URL", "https://video.example.com"),
            ("VIDEO_PROVIDER_NAME", "kling"),
            ("VIDEO_PROVIDER_CALLBACKS", "false"),
        ])
        .unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.cors_origins, vec!["http://a.test", "http://b.test"]);
        assert_eq!(config.public_base_url.as_deref(), Some("https://genflow.example.com"));
        assert_eq!(config.callback_secret.as_deref(), Some("s3cret"));
        assert_eq!(config.video_provider.name, "kling");
        assert!(!config.video_provider.callbacks);
    }

    #[test]
    fn webhook_secret_is_independent_of_callback_secret() {
        let config = load(&[("CALLBACK_SECRET", "inbound")]).unwrap();
        assert_eq!(config.callback_secret.as_deref(), Some("inbound"));
        assert!(config.webhook_secret.is_none());

        let config = load(&[("CALLBACK_SECRET", "inbound"), ("WEBHOOK_SECRET", "outbound")]).unwrap();
        assert_eq!(config.webhook_secret.as_deref(), Some("outbound"));
    }

    #[test]
    fn malformed_values_name_the_variable() {
        assert_matches!(
            load(&[("PORT", "eighty")]),
            Err(ConfigError::Invalid { name: "PORT", .. })
        );
        assert_matches!(
            load(&[("PUBLIC_BASE_URL", "genflow.local")]),
            Err(ConfigError::Invalid { name: "PUBLIC_BASE_URL", .. })
        );
    }
}
