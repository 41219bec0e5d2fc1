//! Configuration types and loading
//!
//! Defines the manager timing knobs and the setup commands sent to every
//! controller once it finishes initializing.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};

use crate::protocol::{InputMode, PlayerLights};

/// Root configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Configuration name/description
    #[serde(default)]
    pub name: String,

    /// Event loop and transport settings
    #[serde(default)]
    pub manager: ManagerConfig,

    /// Commands issued when a controller becomes ready
    #[serde(default)]
    pub on_connect: OnConnectConfig,
}

/// Event loop and transport settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Deadline for a subcommand reply in milliseconds
    #[serde(default = "default_subcommand_timeout")]
    pub subcommand_timeout_ms: u64,

    /// Interval between device enumerations in milliseconds
    #[serde(default = "default_scan_interval")]
    pub scan_interval_ms: u64,

    /// Blocking read timeout of each reader thread in milliseconds
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: i32,

    /// Buffered events per subscriber before the slowest one lags
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_subcommand_timeout() -> u64 {
    1000
}

fn default_scan_interval() -> u64 {
    1000
}

fn default_read_timeout() -> i32 {
    5
}

fn default_event_capacity() -> usize {
    1024
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            subcommand_timeout_ms: default_subcommand_timeout(),
            scan_interval_ms: default_scan_interval(),
            read_timeout_ms: default_read_timeout(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl ManagerConfig {
    pub fn subcommand_timeout(&self) -> Duration {
        Duration::from_millis(self.subcommand_timeout_ms)
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }
}

/// Setup commands for newly connected controllers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnConnectConfig {
    /// Report mode to switch to (null leaves the device untouched)
    #[serde(default = "default_input_mode")]
    pub input_mode: Option<InputMode>,

    /// Turn on the motion sensors where present
    #[serde(default = "default_true")]
    pub enable_imu: bool,

    #[serde(default)]
    pub enable_vibration: bool,

    /// Player light pattern such as "1000" or "f000"
    #[serde(default)]
    pub player_lights: Option<String>,
}

fn default_input_mode() -> Option<InputMode> {
    Some(InputMode::StandardFull)
}

fn default_true() -> bool {
    true
}

impl Default for OnConnectConfig {
    fn default() -> Self {
        Self {
            input_mode: default_input_mode(),
            enable_imu: default_true(),
            enable_vibration: false,
            player_lights: None,
        }
    }
}

impl OnConnectConfig {
    /// Setup that sends nothing
    pub fn none() -> Self {
        Self {
            input_mode: None,
            enable_imu: false,
            enable_vibration: false,
            player_lights: None,
        }
    }

    pub fn lights(&self) -> Option<PlayerLights> {
        self.player_lights
            .as_deref()
            .and_then(PlayerLights::from_pattern)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: "Default Configuration".to_string(),
            manager: ManagerConfig::default(),
            on_connect: OnConnectConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Load from `path` if it exists, otherwise fall back to defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Config::default())
        }
    }

    /// Save configuration to a JSON file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// `<config dir>/joycon-cmd/config.json`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("joycon-cmd").join("config.json"))
    }

    fn validate(&self) -> Result<()> {
        if let Some(pattern) = &self.on_connect.player_lights {
            if PlayerLights::from_pattern(pattern).is_none() {
                anyhow::bail!("Invalid player light pattern: {:?}", pattern);
            }
        }
        if self.manager.event_capacity == 0 {
            anyhow::bail!("event_capacity must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_json() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.manager.subcommand_timeout_ms, 1000);
        assert_eq!(config.manager.read_timeout_ms, 5);
        assert_eq!(config.on_connect.input_mode, Some(InputMode::StandardFull));
        assert!(config.on_connect.enable_imu);
        assert!(!config.on_connect.enable_vibration);
    }

    #[test]
    fn test_null_input_mode_is_kept() {
        let config: Config =
            serde_json::from_str(r#"{"on_connect": {"input_mode": null, "player_lights": "f001"}}"#)
                .unwrap();
        assert_eq!(config.on_connect.input_mode, None);
        assert_eq!(config.on_connect.lights().unwrap().encode(), 0x18);
    }

    #[test]
    fn test_save_and_load() {
        let dir = std::env::temp_dir().join(format!("joycon-cmd-test-{}", std::process::id()));
        let path = dir.join("config.json");
        let mut config = Config::default();
        config.on_connect.input_mode = Some(InputMode::Simple);
        config.save(&path).unwrap();
        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.on_connect.input_mode, Some(InputMode::Simple));
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_invalid_lights_rejected() {
        let dir = std::env::temp_dir().join(format!("joycon-cmd-bad-{}", std::process::id()));
        let path = dir.join("config.json");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(&path, r#"{"on_connect": {"player_lights": "12"}}"#).unwrap();
        assert!(Config::load(&path).is_err());
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
