//! Configuration loading with JSON file support and environment variable
//! overrides.
//!
//! Pattern: `TREESYNC_*` environment variables override config file values.
//! Example: `TREESYNC_DATA__BATCH_SIZE=32` overrides `data.batch_size`.

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::context::ComputeMode;
use crate::data::Phase;
use crate::data::ReaderConfig;
use crate::utils::error::{Result, TreeSyncError};

/// Device-set configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device ids to train on, one synchronized worker per id
    #[serde(default = "default_device_ids")]
    pub device_ids: Vec<i32>,

    /// Attempt direct peer links between paired devices
    #[serde(default = "default_true")]
    pub enable_peer_access: bool,
}

/// Data-feeding configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    /// Name of the consuming component (part of the source key)
    #[serde(default = "default_owner")]
    pub owner: String,

    /// Source path
    #[serde(default)]
    pub source: String,

    /// Records per batch per worker
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Batches to read ahead per worker
    #[serde(default = "default_prefetch")]
    pub prefetch: usize,

    #[serde(default)]
    pub phase: Phase,
}

/// Runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Base pseudo-random seed; fresh entropy when unset
    #[serde(default)]
    pub seed: Option<u64>,

    #[serde(default)]
    pub mode: ComputeMode,
}

/// Complete configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TreeSyncConfig {
    #[serde(default)]
    pub devices: DeviceConfig,

    #[serde(default)]
    pub data: DataConfig,

    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Additional key-value configuration
    #[serde(default)]
    pub extra: HashMap<String, serde_json::Value>,
}

// Default value functions
fn default_device_ids() -> Vec<i32> {
    vec![0]
}
fn default_true() -> bool {
    true
}
fn default_owner() -> String {
    "train".to_string()
}
fn default_batch_size() -> usize {
    32
}
fn default_prefetch() -> usize {
    4
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device_ids: default_device_ids(),
            enable_peer_access: default_true(),
        }
    }
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            owner: default_owner(),
            source: String::new(),
            batch_size: default_batch_size(),
            prefetch: default_prefetch(),
            phase: Phase::default(),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            seed: None,
            mode: ComputeMode::default(),
        }
    }
}

impl TreeSyncConfig {
    /// Load configuration from a JSON file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| TreeSyncError::Config(format!("failed to parse config: {e}")))?;

        info!(config_file = %path.display(), "loaded configuration from file");
        Ok(config)
    }

    /// Load configuration with environment variable overrides.
    ///
    /// Environment variables are prefixed with `TREESYNC_` and use uppercase.
    /// Nested keys use double underscore: `TREESYNC_DATA__BATCH_SIZE`.
    pub fn from_file_with_env<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load configuration from environment only (no file).
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Apply environment variable overrides.
    fn apply_env_overrides(&mut self) {
        for (key, value) in env::vars() {
            if !key.starts_with("TREESYNC_") {
                continue;
            }

            let config_key = key[9..].to_lowercase();
            let parts: Vec<&str> = config_key.split("__").collect();

            match parts.as_slice() {
                ["devices", field] => self.apply_devices_override(field, &value),
                ["data", field] => self.apply_data_override(field, &value),
                ["runtime", field] => self.apply_runtime_override(field, &value),
                [field] => {
                    // Try each section for simple keys
                    self.apply_devices_override(field, &value);
                    self.apply_data_override(field, &value);
                    self.apply_runtime_override(field, &value);
                }
                _ => {
                    debug!(key = %key, "unknown config key pattern");
                }
            }
        }
    }

    fn apply_devices_override(&mut self, field: &str, value: &str) {
        match field {
            "device_ids" | "devices" => {
                let ids: std::result::Result<Vec<i32>, _> =
                    value.split(',').map(|s| s.trim().parse()).collect();
                if let Ok(ids) = ids {
                    self.devices.device_ids = ids;
                }
            }
            "enable_peer_access" => {
                self.devices.enable_peer_access = value.to_lowercase() == "true" || value == "1";
            }
            _ => {}
        }
    }

    fn apply_data_override(&mut self, field: &str, value: &str) {
        match field {
            "owner" => self.data.owner = value.to_string(),
            "source" => self.data.source = value.to_string(),
            "batch_size" => {
                if let Ok(v) = value.parse() {
                    self.data.batch_size = v;
                }
            }
            "prefetch" => {
                if let Ok(v) = value.parse() {
                    self.data.prefetch = v;
                }
            }
            "phase" => match value.to_lowercase().as_str() {
                "train" => self.data.phase = Phase::Train,
                "eval" | "test" => self.data.phase = Phase::Eval,
                _ => {}
            },
            _ => {}
        }
    }

    fn apply_runtime_override(&mut self, field: &str, value: &str) {
        match field {
            "seed" => {
                if let Ok(v) = value.parse() {
                    self.runtime.seed = Some(v);
                }
            }
            "mode" => match value.to_lowercase().as_str() {
                "cpu" => self.runtime.mode = ComputeMode::Cpu,
                "gpu" => self.runtime.mode = ComputeMode::Gpu,
                _ => {}
            },
            _ => {}
        }
    }

    /// Validate configuration consistency.
    pub fn validate(&self) -> Result<()> {
        if self.devices.device_ids.is_empty() {
            return Err(TreeSyncError::Config(
                "at least one device id is required".to_string(),
            ));
        }
        for (i, id) in self.devices.device_ids.iter().enumerate() {
            if *id < 0 {
                return Err(TreeSyncError::Config(format!(
                    "device ids must be non-negative, got {id}"
                )));
            }
            if self.devices.device_ids[i + 1..].contains(id) {
                return Err(TreeSyncError::Config(format!(
                    "device id {id} is listed twice"
                )));
            }
        }
        if self.data.batch_size == 0 {
            return Err(TreeSyncError::Config(
                "batch_size must be at least 1".to_string(),
            ));
        }
        if self.data.prefetch == 0 {
            return Err(TreeSyncError::Config(
                "prefetch must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Reader parameters for the configured data section.
    pub fn reader(&self) -> ReaderConfig {
        ReaderConfig {
            owner: self.data.owner.clone(),
            source: self.data.source.clone(),
            batch_size: self.data.batch_size,
            prefetch: self.data.prefetch,
            phase: self.data.phase,
        }
    }

    /// Save configuration to a JSON file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| TreeSyncError::Config(format!("failed to serialize config: {e}")))?;
        fs::write(path, json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = TreeSyncConfig::default();
        assert_eq!(config.devices.device_ids, vec![0]);
        assert_eq!(config.data.batch_size, 32);
        assert_eq!(config.data.prefetch, 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_save_load() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");

        let config = TreeSyncConfig::default();
        config.save(&path)?;

        let loaded = TreeSyncConfig::from_file(&path)?;
        assert_eq!(loaded.data.batch_size, config.data.batch_size);
        assert_eq!(loaded.devices.device_ids, config.devices.device_ids);

        Ok(())
    }

    #[test]
    fn test_env_override() {
        env::set_var("TREESYNC_BATCH_SIZE", "64");
        env::set_var("TREESYNC_DEVICES__DEVICE_IDS", "0,1,2");
        env::set_var("TREESYNC_DATA__PHASE", "eval");

        let config = TreeSyncConfig::from_env();
        assert_eq!(config.data.batch_size, 64);
        assert_eq!(config.devices.device_ids, vec![0, 1, 2]);
        assert_eq!(config.data.phase, Phase::Eval);

        env::remove_var("TREESYNC_BATCH_SIZE");
        env::remove_var("TREESYNC_DEVICES__DEVICE_IDS");
        env::remove_var("TREESYNC_DATA__PHASE");
    }

    #[test]
    fn test_validation() {
        let mut config = TreeSyncConfig::default();
        config.devices.device_ids = vec![0, 1, 1];
        assert!(config.validate().is_err());

        config.devices.device_ids = vec![];
        assert!(config.validate().is_err());

        config.devices.device_ids = vec![0, 1];
        config.data.prefetch = 0;
        assert!(config.validate().is_err());
    }
}
