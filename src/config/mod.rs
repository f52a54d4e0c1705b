//! Engine configuration.
//!
//! An [`EngineConfig`] holds everything an operator sets before a chain is
//! built: block geometry, timing supervision, visualization channel sizing,
//! runner pacing and free-form stage parameters.
//!
//! # Files
//!
//! Configurations load from and save to `.json` or `.toml`, chosen by file
//! extension. Every field has a default, so partial files are fine.
//!
//! # Example
//!
//! ```ignore
//! use filter_chain::config::EngineConfig;
//!
//! let config = EngineConfig::load("session.toml")?;
//! let env = Environment::from_config(&config);
//! ```

use crate::error::{EngineError, Result, ResultExt};
use crate::pipeline::params::ParamValue;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Default sampling rate in Hz
pub const DEFAULT_SAMPLING_RATE: f64 = 256.0;

/// Default number of samples per block
pub const DEFAULT_SAMPLE_BLOCK_SIZE: usize = 32;

/// Default visualization channel capacity (messages)
pub const DEFAULT_VIS_CAPACITY: usize = 256;

/// Default runner command/message channel capacity
pub const DEFAULT_RUNNER_CAPACITY: usize = 1024;

// ==================== Sections ====================

/// Block geometry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockConfig {
    /// Sampling rate in Hz
    pub sampling_rate: f64,
    /// Samples per block
    pub sample_block_size: usize,
    /// Channels of the external input block fed into the first stage
    pub input_channels: usize,
}

impl Default for BlockConfig {
    fn default() -> Self {
        Self {
            sampling_rate: DEFAULT_SAMPLING_RATE,
            sample_block_size: DEFAULT_SAMPLE_BLOCK_SIZE,
            input_channels: 0,
        }
    }
}

/// Timing supervision and profiling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Warn when a stage call exceeds one block duration
    pub evaluate_timing: bool,
    /// Accumulate per-stage performance data
    pub profiling: bool,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            evaluate_timing: true,
            profiling: false,
        }
    }
}

/// Visualization sink sizing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VisualizationConfig {
    /// Bounded channel capacity; messages beyond it are dropped
    pub channel_capacity: usize,
}

impl Default for VisualizationConfig {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_VIS_CAPACITY,
        }
    }
}

/// Block runner behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Sleep to the nominal block duration between blocks
    pub realtime: bool,
    /// Stop the run after this many blocks (0 = unlimited)
    pub max_blocks: u64,
    /// Command and message channel capacity
    pub channel_capacity: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            realtime: true,
            max_blocks: 0,
            channel_capacity: DEFAULT_RUNNER_CAPACITY,
        }
    }
}

// ==================== Engine Config ====================

/// Complete engine configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub block: BlockConfig,
    pub timing: TimingConfig,
    pub visualization: VisualizationConfig,
    pub runner: RunnerConfig,
    /// Operator parameter values, by parameter name
    pub parameters: BTreeMap<String, ParamValue>,
}

impl EngineConfig {
    /// Load from a `.json` or `.toml` file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;

        let config = match Format::of(path)? {
            Format::Json => serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse {}", path.display()))?,
            Format::Toml => toml::from_str(&content)
                .with_context(|| format!("Failed to parse {}", path.display()))?,
        };

        tracing::info!("Loaded engine configuration from {:?}", path);
        Ok(config)
    }

    /// Save to a `.json` or `.toml` file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = match Format::of(path)? {
            Format::Json => serde_json::to_string_pretty(self)?,
            Format::Toml => toml::to_string_pretty(self)?,
        };

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write {}", path.display()))?;

        tracing::info!("Saved engine configuration to {:?}", path);
        Ok(())
    }

    /// Set an operator parameter value.
    pub fn set_parameter(&mut self, name: impl Into<String>, value: impl Into<ParamValue>) {
        self.parameters.insert(name.into(), value.into());
    }

    /// Reject geometry that cannot produce a block.
    pub fn validate(&self) -> Result<()> {
        if self.block.sample_block_size == 0 {
            return Err(EngineError::Config(
                "sample_block_size must be at least 1".to_string(),
            ));
        }
        if !(self.block.sampling_rate > 0.0) {
            return Err(EngineError::Config(format!(
                "sampling_rate must be positive, got {}",
                self.block.sampling_rate
            )));
        }
        Ok(())
    }
}

enum Format {
    Json,
    Toml,
}

impl Format {
    fn of(path: &Path) -> Result<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => Ok(Format::Json),
            Some(ext) if ext.eq_ignore_ascii_case("toml") => Ok(Format::Toml),
            _ => Err(EngineError::Config(format!(
                "Unsupported configuration file: {}",
                path.display()
            ))),
        }
    }
}
