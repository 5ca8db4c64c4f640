//! Connection and polling configuration.
//!
//! [`LiveConfig`] is the serde-loadable top-level configuration;
//! [`ContextConfig`] is the subset a [`Context`](crate::context::Context)
//! needs to open sessions.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PmapiError, Result};

/// Host specification sent when creating a session.
pub const DEFAULT_HOSTSPEC: &str = "127.0.0.1";

/// Session poll timeout in seconds.
pub const DEFAULT_POLLTIMEOUT_SECS: u64 = 30;

/// Settings used to open and bind a backend session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextConfig {
    /// Base URL of the backend, without trailing slash.
    pub url: String,
    /// Host specification for new sessions.
    pub hostspec: String,
    /// Session poll timeout in seconds.
    pub polltimeout_secs: u64,
    /// Container the session is bound to, if any.
    pub container: Option<String>,
}

impl ContextConfig {
    /// Creates a configuration for the given base URL.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            url: url.trim_end_matches('/').to_string(),
            hostspec: DEFAULT_HOSTSPEC.to_string(),
            polltimeout_secs: DEFAULT_POLLTIMEOUT_SECS,
            container: None,
        }
    }

    /// Binds sessions to a container. Blank names are ignored.
    #[must_use]
    pub fn with_container(mut self, container: impl Into<String>) -> Self {
        let container = container.into();
        self.container = if container.trim().is_empty() {
            None
        } else {
            Some(container)
        };
        self
    }

    /// Sets the host specification.
    #[must_use]
    pub fn with_hostspec(mut self, hostspec: impl Into<String>) -> Self {
        self.hostspec = hostspec.into();
        self
    }

    /// Sets the session poll timeout.
    #[must_use]
    pub const fn with_polltimeout_secs(mut self, secs: u64) -> Self {
        self.polltimeout_secs = secs;
        self
    }
}

/// Main configuration for a live polling client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LiveConfig {
    /// Base URL of pmproxy (or pmwebd).
    pub url: String,
    /// Container to bind sessions to.
    #[serde(default)]
    pub container: Option<String>,
    /// Host specification for new sessions.
    #[serde(default = "default_hostspec")]
    pub hostspec: String,
    /// Session poll timeout in seconds.
    #[serde(default = "default_polltimeout_secs")]
    pub polltimeout_secs: u64,
    /// Seconds between two polls.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Seconds a metric keeps being polled after it was last requested.
    #[serde(default = "default_poll_max_age_secs")]
    pub poll_max_age_secs: u64,
    /// Seconds of history retained per series.
    #[serde(default = "default_data_max_age_secs")]
    pub data_max_age_secs: u64,
    /// HTTP request timeout in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_hostspec() -> String {
    DEFAULT_HOSTSPEC.to_string()
}

const fn default_polltimeout_secs() -> u64 {
    DEFAULT_POLLTIMEOUT_SECS
}

const fn default_poll_interval_secs() -> u64 {
    1
}

const fn default_poll_max_age_secs() -> u64 {
    20
}

const fn default_data_max_age_secs() -> u64 {
    5 * 60
}

const fn default_request_timeout_secs() -> u64 {
    10
}

impl LiveConfig {
    /// Creates a configuration with defaults for the given URL.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            container: None,
            hostspec: default_hostspec(),
            polltimeout_secs: default_polltimeout_secs(),
            poll_interval_secs: default_poll_interval_secs(),
            poll_max_age_secs: default_poll_max_age_secs(),
            data_max_age_secs: default_data_max_age_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }

    /// Load configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| PmapiError::Config {
            reason: format!(
                "failed to read config file '{}': {e}",
                path.as_ref().display()
            ),
        })?;

        Self::from_json(&content)
    }

    /// Write the configuration to a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = serde_json::to_string_pretty(self).map_err(|e| PmapiError::Config {
            reason: format!("failed to serialize config: {e}"),
        })?;
        std::fs::write(path.as_ref(), content).map_err(|e| PmapiError::Config {
            reason: format!(
                "failed to write config file '{}': {e}",
                path.as_ref().display()
            ),
        })
    }

    /// Parse configuration from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is invalid or fails validation.
    pub fn from_json(content: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(content).map_err(|e| PmapiError::Config {
            reason: format!("invalid JSON: {e}"),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<()> {
        if self.url.is_empty() {
            return Err(config_error("url cannot be empty"));
        }

        let url = url::Url::parse(&self.url)
            .map_err(|e| config_error(format!("invalid url '{}': {e}", self.url)))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(config_error("url must start with http:// or https://"));
        }

        if self.hostspec.is_empty() {
            return Err(config_error("hostspec cannot be empty"));
        }

        for (field, value) in [
            ("polltimeout_secs", self.polltimeout_secs),
            ("poll_interval_secs", self.poll_interval_secs),
            ("poll_max_age_secs", self.poll_max_age_secs),
            ("data_max_age_secs", self.data_max_age_secs),
            ("request_timeout_secs", self.request_timeout_secs),
        ] {
            if value == 0 {
                return Err(config_error(format!("{field} must be greater than 0")));
            }
        }

        Ok(())
    }

    /// Set the container.
    #[must_use]
    pub fn with_container(mut self, container: impl Into<String>) -> Self {
        self.container = Some(container.into());
        self
    }

    /// Set the poll interval.
    #[must_use]
    pub const fn with_poll_interval_secs(mut self, secs: u64) -> Self {
        self.poll_interval_secs = secs;
        self
    }

    /// Set how long a metric keeps being polled after its last request.
    #[must_use]
    pub const fn with_poll_max_age_secs(mut self, secs: u64) -> Self {
        self.poll_max_age_secs = secs;
        self
    }

    /// Set the retained history window.
    #[must_use]
    pub const fn with_data_max_age_secs(mut self, secs: u64) -> Self {
        self.data_max_age_secs = secs;
        self
    }

    /// Returns the poll interval.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Returns the poll-target interest window.
    #[must_use]
    pub const fn poll_max_age(&self) -> Duration {
        Duration::from_secs(self.poll_max_age_secs)
    }

    /// Returns the retained history window.
    #[must_use]
    pub const fn data_max_age(&self) -> Duration {
        Duration::from_secs(self.data_max_age_secs)
    }

    /// Returns the HTTP request timeout.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Derives the session settings.
    #[must_use]
    pub fn context_config(&self) -> ContextConfig {
        let config = ContextConfig::new(&self.url)
            .with_hostspec(&self.hostspec)
            .with_polltimeout_secs(self.polltimeout_secs);
        match &self.container {
            Some(container) => config.with_container(container),
            None => config,
        }
    }
}

fn config_error(reason: impl Into<String>) -> PmapiError {
    PmapiError::Config {
        reason: reason.into(),
    }
}
