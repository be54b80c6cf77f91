// Reconstruction configuration
//
// Loaded from TOML or built in code; every field has a default so an empty
// file is a valid configuration.

use crate::error::ConfigError;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Knobs for building a [`Machine`](crate::machine::Machine) and its summaries
///
/// # Example
/// ```
/// use kdscope::config::MachineConfig;
///
/// let config = MachineConfig::default();
/// assert_eq!(config.future_window_multiplier, 5);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineConfig {
    /// Stable-sort the event array by timestamp before dispatch.
    ///
    /// Needed for traces that interleave IOP events out of order when the
    /// consumer wants them in time order; AP order is already guaranteed.
    pub sort_events: bool,

    /// Length of the future-run window as a multiple of the query window
    ///
    /// Default: 5
    pub future_window_multiplier: u64,

    /// Record voucher attribute bytes from `VOUCHER_CREATE_ATTR_DATA` records
    pub capture_voucher_contents: bool,

    /// Correlate disk I/O issue/completion records
    pub track_io: bool,

    /// Chunk size, in events, of the parallel event renderer
    pub render_chunk_size: usize,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            sort_events: false,
            future_window_multiplier: 5,
            capture_voucher_contents: true,
            track_io: true,
            render_chunk_size: 4096,
        }
    }
}

impl MachineConfig {
    /// Load configuration from a TOML file
    ///
    /// # Example TOML
    /// ```toml
    /// sort_events = true
    /// future_window_multiplier = 3
    /// track_io = false
    /// ```
    pub fn from_toml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).with_context(|| {
            format!("Failed to read config file: {}", path.as_ref().display())
        })?;
        let config: MachineConfig =
            toml::from_str(&content).context("Failed to parse TOML machine config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.future_window_multiplier < 1 {
            return Err(ConfigError::FutureWindowMultiplier(
                self.future_window_multiplier,
            ));
        }
        if self.render_chunk_size == 0 {
            return Err(ConfigError::RenderChunkSize);
        }
        Ok(())
    }
}
