//! Implementation of the configuration module.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use serde::Deserialize;
use serde::Serialize;

use crate::request::retry::RetryPolicy;

/// Default API protocol.
const DEFAULT_PROTOCOL: &str = "https";

/// Default API host.
const DEFAULT_HOST: &str = "api.pylon.sh";

/// Default API port.
const DEFAULT_PORT: u16 = 443;

/// Default delay between workflow polls, in milliseconds.
const DEFAULT_POLLING_DELAY_MS: u64 = 5000;

/// The API refuses polling faster than once per second.
const MIN_POLLING_DELAY_MS: u64 = 1000;

/// Represents the configuration for the Pylon CLI tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields, default)]
pub struct Config {
    /// Protocol used to reach the API.
    pub protocol: String,
    /// API hostname.
    pub host: String,
    /// API port.
    pub port: u16,
    /// Session token, if stored in the config file rather than the
    /// environment.
    pub session: Option<String>,
    /// Maximum number of HTTP retries (capped at 10).
    pub http_max_retries: u32,
    /// Base retry backoff in seconds (floor of 3).
    pub http_retry_backoff: u64,
    /// Delay between workflow polls in milliseconds (floor of 1000).
    pub workflow_polling_delay_ms: u64,
    /// Diverts requests away from the network, logging what would have been
    /// sent.
    pub test_mode: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            protocol: DEFAULT_PROTOCOL.to_string(),
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            session: None,
            http_max_retries: RetryPolicy::DEFAULT_MAX_RETRIES,
            http_retry_backoff: RetryPolicy::DEFAULT_BACKOFF_SECS,
            workflow_polling_delay_ms: DEFAULT_POLLING_DELAY_MS,
            test_mode: false,
        }
    }
}

impl Config {
    /// Read a configuration file from the specified path.
    pub fn read_config(path: &Path) -> Result<Self> {
        let data = std::fs::read(path).context("Failed to open config file")?;
        let text = String::from_utf8(data).context("Failed to read config file")?;
        let config: Config = toml::from_str(&text).context("Failed to parse config file")?;
        Ok(config)
    }

    /// Load configuration from an optional file path, applying environment
    /// overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::read_config(path)?,
            None => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    /// Applies `PYLON_*` environment variable overrides.
    fn apply_env(&mut self) {
        if let Ok(protocol) = std::env::var("PYLON_PROTOCOL") {
            self.protocol = protocol;
        }
        if let Ok(host) = std::env::var("PYLON_HOST") {
            self.host = host;
        }
        if let Ok(port) = std::env::var("PYLON_PORT")
            && let Ok(port) = port.parse()
        {
            self.port = port;
        }
        if let Ok(value) = std::env::var("PYLON_TEST_MODE") {
            self.test_mode = value == "1" || value.eq_ignore_ascii_case("true");
        }
    }

    /// The base URI all relative API paths are resolved against.
    pub fn base_url(&self) -> String {
        format!(
            "{protocol}://{host}:{port}",
            protocol = self.protocol,
            host = self.host,
            port = self.port
        )
    }

    /// The retry policy for HTTP requests, with the cap and floor applied.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.http_max_retries, self.http_retry_backoff)
    }

    /// The delay between workflow polls, with the one-second floor applied.
    pub fn polling_interval(&self) -> Duration {
        Duration::from_millis(self.workflow_polling_delay_ms.max(MIN_POLLING_DELAY_MS))
    }
}
