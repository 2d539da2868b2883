use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_API_URL: &str = "http://127.0.0.1:5000/api";

/// Settings for talking to the reader backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Base URL of the API, without the trailing endpoint path
    pub base_url: String,
    /// Seconds between two health probes
    pub probe_interval_secs: u64,
    /// Upper bound for one health probe
    pub probe_timeout_secs: u64,
    /// Upper bound for one card read request
    pub read_timeout_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_API_URL.to_string(),
            probe_interval_secs: 5,
            probe_timeout_secs: 3,
            read_timeout_secs: 10,
        }
    }
}

impl ClientConfig {
    /// Load a JSON config file; missing keys fall back to defaults
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: ClientConfig = serde_json::from_str(&text)
            .with_context(|| format!("Invalid config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            bail!("API URL must start with http:// or https://: '{}'", self.base_url);
        }
        if self.probe_interval_secs == 0 {
            bail!("Probe interval must be at least one second");
        }
        if self.probe_timeout_secs == 0 || self.read_timeout_secs == 0 {
            bail!("Timeouts must be at least one second");
        }
        Ok(())
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    /// Full URL of an endpoint below the API base
    pub fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}
