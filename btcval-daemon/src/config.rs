use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(&'static str),
}

/// Behaviour shared by every validator the daemon runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    /// First height to scan when automatic scanning is off
    pub static_chain_scanning_start_height: Option<u64>,
    /// Resume from the persisted `last_processed_height`
    pub auto_chain_scanning_mode: bool,
    pub poll_interval_ms: u64,
    /// Start polling as soon as registration lands
    pub auto_start_on_registration: bool,
    /// Manager mailbox bound
    pub mailbox_capacity: usize,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            static_chain_scanning_start_height: None,
            auto_chain_scanning_mode: true,
            poll_interval_ms: 1000,
            auto_start_on_registration: true,
            mailbox_capacity: 64,
        }
    }
}

impl ValidatorConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let reader = BufReader::new(File::open(path)?);
        let config: ValidatorConfig = serde_json::from_reader(reader)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("poll_interval_ms must be positive"));
        }
        if self.mailbox_capacity == 0 {
            return Err(ConfigError::Invalid("mailbox_capacity must be positive"));
        }
        if !self.auto_chain_scanning_mode && self.static_chain_scanning_start_height.is_none() {
            return Err(ConfigError::Invalid(
                "static_chain_scanning_start_height is required when auto_chain_scanning_mode is off",
            ));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Height the polling loop jumps to before its first vote, if any.
    pub fn scanning_start_height(&self) -> Option<u64> {
        if self.auto_chain_scanning_mode {
            None
        } else {
            self.static_chain_scanning_start_height
        }
    }
}
