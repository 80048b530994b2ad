//! Configuration loading for droid-mcp
//!
//! Configuration is loaded from the first file found in:
//! 1. The explicit path (`--config` / `DROID_MCP_CONFIG`)
//! 2. `./droid-mcp.toml`
//! 3. `$XDG_CONFIG_HOME/droid-mcp/config.toml`
//!
//! Missing files fall back to defaults. CLI flags are applied on top by the
//! binary.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::registry::BusyPolicy;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub devices: DeviceConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub recognition: RecognitionConfig,
}

/// How the `adb` executable is invoked
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Path to (or name of) the adb executable
    #[serde(default = "default_adb_path")]
    pub adb_path: String,
    /// Deadline for a single adb invocation
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Attempts per call before a transient failure is reported
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Fixed delay between attempts
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device used when a request does not name one
    #[serde(default)]
    pub fixed_device: Option<String>,
    /// What happens when a device is already executing a command
    #[serde(default)]
    pub busy_policy: BusyPolicy,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    /// TCP address to accept MCP clients on; stdio when unset
    #[serde(default)]
    pub listen: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub debug: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecognitionConfig {
    #[serde(default)]
    pub ocr: OcrConfig,
    #[serde(default)]
    pub image_match: ImageMatchConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_tesseract_path")]
    pub tesseract_path: String,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageMatchConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_threshold")]
    pub default_threshold: f32,
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    /// Frames wider than this are downscaled before matching; 0 disables
    #[serde(default = "default_search_width")]
    pub max_search_width: u32,
}

fn default_adb_path() -> String {
    "adb".to_string()
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    500
}

fn default_true() -> bool {
    true
}

fn default_tesseract_path() -> String {
    "tesseract".to_string()
}

fn default_language() -> String {
    "eng".to_string()
}

fn default_threshold() -> f32 {
    0.7
}

fn default_max_results() -> usize {
    10
}

fn default_search_width() -> u32 {
    540
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            adb_path: default_adb_path(),
            timeout_ms: default_timeout_ms(),
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tesseract_path: default_tesseract_path(),
            language: default_language(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl Default for ImageMatchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_threshold: default_threshold(),
            max_results: default_max_results(),
            max_search_width: default_search_width(),
        }
    }
}

impl BridgeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

impl Config {
    /// Load configuration, returning it together with the file it came from
    pub fn load(explicit: Option<&Path>) -> Result<(Self, Option<PathBuf>)> {
        if let Some(path) = explicit {
            let config = Self::from_file(path)?;
            return Ok((config, Some(path.to_path_buf())));
        }

        for path in Self::candidate_paths() {
            if path.is_file() {
                let config = Self::from_file(&path)?;
                return Ok((config, Some(path)));
            }
        }

        Ok((Self::default(), None))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.bridge.max_attempts == 0 {
            anyhow::bail!("bridge.max_attempts must be at least 1");
        }
        if self.bridge.timeout_ms == 0 {
            anyhow::bail!("bridge.timeout_ms must be greater than 0");
        }
        let threshold = self.recognition.image_match.default_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            anyhow::bail!("recognition.image_match.default_threshold must be within 0..1");
        }
        Ok(())
    }

    fn candidate_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from("droid-mcp.toml")];
        if let Some(dir) = dirs::config_dir() {
            paths.push(dir.join("droid-mcp").join("config.toml"));
        }
        paths
    }
}
