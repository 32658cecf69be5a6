//! CLI configuration management
//!
//! Configuration is read from a TOML file. Every key is optional; missing
//! keys fall back to the defaults below.
//!
//! ```toml
//! [central]
//! scan_mode = "unfiltered"
//! requested_unit_size = 185
//! notify_characteristics = ["72a83fec-0e1d-4f0b-9a6f-8d3c0b5e1a21"]
//!
//! [runtime]
//! ready_timeout_secs = 30
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use blemesh_central::CentralConfig;

use crate::error::{CliError, Result};

/// Smallest transport unit a BLE link may use
const MIN_UNIT_SIZE: u16 = 23;

/// Largest transport unit a BLE link may negotiate
const MAX_UNIT_SIZE: u16 = 517;

// ----------------------------------------------------------------------------
// Application Configuration
// ----------------------------------------------------------------------------

/// Complete configuration for the blemesh CLI
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Central connection manager settings
    pub central: CentralConfig,

    /// CLI runtime behavior
    pub runtime: RuntimeConfig,
}

/// Runtime behavior of the CLI commands
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Fixed local advertisement nonce; random when unset
    pub advertise_nonce: Option<i32>,

    /// How long `send` waits for the peer to become ready (seconds)
    pub ready_timeout_secs: u64,

    /// How long `send` waits for the write to complete (seconds)
    pub write_timeout_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            advertise_nonce: None,
            ready_timeout_secs: 30,
            write_timeout_secs: 5,
        }
    }
}

// ----------------------------------------------------------------------------
// Loading and Validation
// ----------------------------------------------------------------------------

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&contents)
    }

    /// Parse and validate a TOML document
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Render the configuration as TOML
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Validate the configuration for consistency
    pub fn validate(&self) -> Result<()> {
        let size = self.central.requested_unit_size;
        if !(MIN_UNIT_SIZE..=MAX_UNIT_SIZE).contains(&size) {
            return Err(CliError::Config(format!(
                "requested_unit_size must be between {} and {}, got {}",
                MIN_UNIT_SIZE, MAX_UNIT_SIZE, size
            )));
        }

        if self.central.connect_routes.is_empty() {
            return Err(CliError::Config(
                "at least one connect route is required".to_string(),
            ));
        }

        if self.runtime.ready_timeout_secs == 0 || self.runtime.write_timeout_secs == 0 {
            return Err(CliError::Config(
                "timeouts must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}
