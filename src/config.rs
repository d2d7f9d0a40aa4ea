//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `G350_DEVICE`
//! 2. **Config file** — path passed to [`Config::load`], or `g350.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [serial]
//! device = "/dev/ttyUSB0"
//! baud = 115200
//!
//! [pins]
//! dtr = 4
//! rts = 5
//! poweron = 6
//! reset = 7
//!
//! [timeouts]
//! command_ms = 1000      # base unit for per-command deadlines
//! startup_line_ms = 500  # per-line wait during the startup sequence
//! ```

use serde::Deserialize;
use std::path::Path;

use crate::error::Error;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub serial: SerialConfig,
    #[serde(default)]
    pub pins: PinConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

/// Serial port settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SerialConfig {
    /// Serial device path (default `/dev/ttyUSB0`). Override with `G350_DEVICE`.
    #[serde(default = "default_device")]
    pub device: String,
    /// Baud rate (default 115200). Supported: 9600, 19200, 38400, 57600, 115200.
    #[serde(default = "default_baud")]
    pub baud: u32,
}

/// Control-line ids, handed to the [`ControlLines`](crate::ControlLines)
/// implementation during power sequencing. The numbering scheme is whatever
/// the embedder's GPIO layer uses; the driver never interprets these.
#[derive(Debug, Clone, Copy, Deserialize, Default)]
pub struct PinConfig {
    #[serde(default)]
    pub dtr: u16,
    #[serde(default)]
    pub rts: u16,
    #[serde(default)]
    pub poweron: u16,
    #[serde(default)]
    pub reset: u16,
}

/// Deadline settings.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct TimeoutConfig {
    /// Base command deadline in milliseconds (default 1000). Long-running
    /// commands scale this up (connect ×30, attach ×180, …).
    #[serde(default = "default_command_ms")]
    pub command_ms: u64,
    /// Per-line wait during the startup configuration sequence (default 500).
    #[serde(default = "default_startup_line_ms")]
    pub startup_line_ms: u64,
}

fn default_device() -> String {
    "/dev/ttyUSB0".to_string()
}
fn default_baud() -> u32 {
    115200
}
fn default_command_ms() -> u64 {
    1000
}
fn default_startup_line_ms() -> u64 {
    500
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            device: default_device(),
            baud: default_baud(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            command_ms: default_command_ms(),
            startup_line_ms: default_startup_line_ms(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, that file must exist and parse. Otherwise looks for
    /// `g350.toml` in the current directory, falling back to compiled defaults.
    pub fn load(path: Option<&str>) -> Result<Self, Error> {
        let mut config = if let Some(p) = path {
            Self::from_file(p)?
        } else if Path::new("g350.toml").exists() {
            Self::from_file("g350.toml")?
        } else {
            Config::default()
        };

        // Env var overrides
        if let Ok(dev) = std::env::var("G350_DEVICE") {
            config.serial.device = dev;
        }

        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self, Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("read {path}: {e}")))?;
        toml::from_str(&content).map_err(|e| Error::Config(format!("parse {path}: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let c = Config::default();
        assert_eq!(c.serial.device, "/dev/ttyUSB0");
        assert_eq!(c.serial.baud, 115200);
        assert_eq!(c.timeouts.command_ms, 1000);
    }

    #[test]
    fn test_parse_partial_toml() {
        let c: Config = toml::from_str(
            r#"
            [serial]
            device = "/dev/ttyACM1"

            [pins]
            poweron = 12
            "#,
        )
        .unwrap();
        assert_eq!(c.serial.device, "/dev/ttyACM1");
        assert_eq!(c.serial.baud, 115200);
        assert_eq!(c.pins.poweron, 12);
        assert_eq!(c.pins.reset, 0);
    }

    #[test]
    fn test_missing_explicit_file_is_error() {
        assert!(Config::load(Some("/nonexistent/g350.toml")).is_err());
    }
}
