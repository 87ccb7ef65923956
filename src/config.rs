// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Configuration module.
//!
//! Handles loading and saving application settings.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;
use uuid::Uuid;

/// Application configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Scanner settings.
    pub scanner: ScannerConfig,

    /// Device connection settings.
    pub device: DeviceConfig,

    /// Logging settings.
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    /// Stop scanning after this many seconds. 0 scans until stopped.
    pub scan_timeout_secs: u64,

    /// Only report devices advertising one of these services.
    pub service_filter: Vec<Uuid>,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            scan_timeout_secs: 30,
            service_filter: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Give up connecting after this many milliseconds.
    pub connect_timeout_ms: u64,

    /// Discover services as soon as a device is connected.
    pub auto_discover_services: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            auto_discover_services: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Directive used when `RUST_LOG` is not set.
    pub default_directive: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            default_directive: "btstate=info".to_string(),
        }
    }
}

impl Config {
    /// Default location of the configuration file.
    pub fn path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("btstate")
            .join("config.toml")
    }

    /// Load configuration from file or create default.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::path())
    }

    /// Load configuration from `path`, writing the defaults there if the
    /// file does not exist yet.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            return toml::from_str(&content)
                .with_context(|| format!("invalid configuration in {}", path.display()));
        }

        let config = Self::default();
        config.save_to(path)?;
        info!("Wrote default configuration to {}", path.display());
        Ok(config)
    }

    /// Save configuration to the default location.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::uuids::HEART_RATE_SERVICE_UUID;

    #[test]
    fn test_load_creates_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("btstate").join("config.toml");

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config, Config::default());
        assert!(path.exists());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = Config::default();
        config.scanner.scan_timeout_secs = 0;
        config.scanner.service_filter.push(HEART_RATE_SERVICE_UUID);
        config.device.auto_discover_services = false;
        config.save_to(&path).unwrap();

        assert_eq!(Config::load_from(&path).unwrap(), config);
    }

    #[test]
    fn test_missing_sections_use_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[device]\nconnect_timeout_ms = 500\n").unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.device.connect_timeout_ms, 500);
        assert!(config.device.auto_discover_services);
        assert_eq!(config.scanner, ScannerConfig::default());
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "scanner = 3").unwrap();
        assert!(Config::load_from(&path).is_err());
    }
}
