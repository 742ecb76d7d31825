//! Process configuration using Figment
//!
//! Configuration is loaded from:
//! 1. `config/acq_shot.toml` (or an explicit path)
//! 2. Environment variables prefixed with `ACQ_SHOT_`, nested keys split on `__`
//!
//! Durations are human-readable strings (`"500ms"`, `"30s"`).
//!
//! Only the orchestration facade reads this struct. Core components receive the
//! explicit parameter structs built from it ([`LoopSettings`], [`StreamSettings`],
//! [`ChannelTimeouts`], [`Vocabulary`]).
//!
//! # Example
//! ```no_run
//! use acq_shot::config::AppConfig;
//!
//! let config = AppConfig::load()?;
//! println!("units: {}", config.uuts.len());
//! # Ok::<(), figment::Error>(())
//! ```
//!
//! Environment override: `ACQ_SHOT_CAPTURE__SHOT_TIMEOUT=90s`.

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::capture::{LoopCount, LoopSettings};
use crate::protocol::{ChannelTimeouts, Vocabulary};
use crate::stream::{StreamLayout, StreamSettings};
use crate::uut::{Endpoint, UutId, DEFAULT_CONTROL_PORT, DEFAULT_DATA_PORT};

/// Default configuration file
pub const DEFAULT_CONFIG_PATH: &str = "config/acq_shot.toml";

/// Environment variable prefix
pub const ENV_PREFIX: &str = "ACQ_SHOT_";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Command channel settings
    pub network: NetworkConfig,
    /// Capture loop settings
    pub capture: CaptureSection,
    /// Streaming settings
    pub stream: StreamSection,
    /// Firmware vocabulary
    pub firmware: Vocabulary,
    /// Known units
    pub uuts: Vec<UutDefinition>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    pub log_format: String,
    /// Directory for shot ledgers and stream data
    pub output_dir: PathBuf,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "acq-shot".into(),
            log_level: "info".into(),
            log_format: "compact".into(),
            output_dir: PathBuf::from("data"),
        }
    }
}

/// Command channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// TCP connect timeout
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Reply timeout per command
    #[serde(with = "humantime_serde")]
    pub reply_timeout: Duration,
    /// Connection attempts made by the facade before giving up
    pub connect_retries: u32,
    /// Pause between connection attempts
    #[serde(with = "humantime_serde")]
    pub retry_backoff: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            reply_timeout: Duration::from_secs(2),
            connect_retries: 3,
            retry_backoff: Duration::from_secs(1),
        }
    }
}

impl NetworkConfig {
    /// Channel timeouts.
    pub fn channel_timeouts(&self) -> ChannelTimeouts {
        ChannelTimeouts {
            connect: self.connect_timeout,
            reply: self.reply_timeout,
        }
    }
}

/// Capture loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSection {
    /// Status poll interval
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Bound on a single status poll
    #[serde(with = "humantime_serde")]
    pub status_timeout: Duration,
    /// Time allowed for every unit to arm
    #[serde(with = "humantime_serde")]
    pub arm_timeout: Duration,
    /// Time allowed from trigger to completion
    #[serde(with = "humantime_serde")]
    pub shot_timeout: Duration,
    /// Stop the loop at the first non-complete shot
    pub stop_on_error: bool,
    /// Abort units that time out or are cancelled mid-shot
    pub abort_incomplete: bool,
    /// Default pre-trigger samples
    pub pre: u64,
    /// Default post-trigger samples
    pub post: u64,
}

impl Default for CaptureSection {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            status_timeout: Duration::from_secs(2),
            arm_timeout: Duration::from_secs(10),
            shot_timeout: Duration::from_secs(60),
            stop_on_error: false,
            abort_incomplete: true,
            pre: 0,
            post: 100_000,
        }
    }
}

impl CaptureSection {
    /// Loop parameters for `count` shots starting at `first_shot_index`.
    pub fn loop_settings(&self, count: LoopCount, first_shot_index: u64) -> LoopSettings {
        LoopSettings {
            count,
            poll_interval: self.poll_interval,
            status_timeout: self.status_timeout,
            arm_timeout: self.arm_timeout,
            shot_timeout: self.shot_timeout,
            stop_on_error: self.stop_on_error,
            abort_incomplete: self.abort_incomplete,
            first_shot_index,
        }
    }
}

/// Streaming configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamSection {
    /// Bounded queue depth between socket reader and storage writer
    pub queue_depth: usize,
    /// Inactivity window before a stream counts as stalled
    #[serde(with = "humantime_serde")]
    pub stall_timeout: Duration,
    /// Socket read size in bytes
    pub read_chunk: usize,
    /// Frames per stored block
    pub frames_per_block: usize,
    /// Store one file per channel
    pub demux: bool,
    /// End the session after this many bytes
    pub max_bytes: Option<u64>,
    /// End the session after this long
    #[serde(with = "humantime_serde::option")]
    pub runtime: Option<Duration>,
}

impl Default for StreamSection {
    fn default() -> Self {
        Self {
            queue_depth: 64,
            stall_timeout: Duration::from_secs(10),
            read_chunk: 64 * 1024,
            frames_per_block: 4096,
            demux: false,
            max_bytes: None,
            runtime: None,
        }
    }
}

impl StreamSection {
    /// Session parameters for `layout`.
    pub fn settings(&self, layout: StreamLayout, connect_timeout: Duration) -> StreamSettings {
        StreamSettings {
            layout,
            queue_depth: self.queue_depth,
            stall_timeout: self.stall_timeout,
            connect_timeout,
            read_chunk: self.read_chunk,
            max_bytes: self.max_bytes,
            runtime: self.runtime,
        }
    }
}

/// Unit definition in configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UutDefinition {
    /// Unique unit identifier
    pub id: UutId,
    /// Hostname or address; defaults to the id
    #[serde(default)]
    pub host: Option<String>,
    /// Command port
    #[serde(default = "default_control_port")]
    pub control_port: u16,
    /// Streaming port
    #[serde(default = "default_data_port")]
    pub data_port: u16,
}

fn default_control_port() -> u16 {
    DEFAULT_CONTROL_PORT
}

fn default_data_port() -> u16 {
    DEFAULT_DATA_PORT
}

impl UutDefinition {
    /// Network endpoint of this unit.
    pub fn endpoint(&self) -> Endpoint {
        let host = self.host.clone().unwrap_or_else(|| self.id.to_string());
        Endpoint::new(host, self.control_port, self.data_port)
    }
}

impl AppConfig {
    /// Load configuration from the default file and environment variables
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path. A missing file yields defaults.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Self::figment(path.as_ref()).extract()
    }

    fn figment(path: &Path) -> Figment {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return Err(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            ));
        }

        if self.capture.poll_interval.is_zero() {
            return Err("capture.poll_interval must be non-zero".into());
        }
        if self.capture.status_timeout.is_zero() || self.capture.shot_timeout.is_zero() {
            return Err("capture timeouts must be non-zero".into());
        }
        if self.network.connect_retries == 0 {
            return Err("network.connect_retries must be at least 1".into());
        }
        if self.stream.queue_depth == 0 {
            return Err("stream.queue_depth must be non-zero".into());
        }
        if self.stream.frames_per_block == 0 {
            return Err("stream.frames_per_block must be non-zero".into());
        }

        self.firmware.validate()?;

        let mut ids = std::collections::HashSet::new();
        for uut in &self.uuts {
            if !ids.insert(&uut.id) {
                return Err(format!("Duplicate UUT ID: {}", uut.id));
            }
        }

        Ok(())
    }

    /// Definition for `id`, or one on default ports using the id as hostname.
    pub fn uut(&self, id: &UutId) -> UutDefinition {
        self.uuts
            .iter()
            .find(|u| &u.id == id)
            .cloned()
            .unwrap_or_else(|| UutDefinition {
                id: id.clone(),
                host: None,
                control_port: DEFAULT_CONTROL_PORT,
                data_port: DEFAULT_DATA_PORT,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_defaults_validate() {
        assert!(AppConfig::default().validate().is_ok());
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let config = AppConfig::load_from("does/not/exist.toml").unwrap();
        assert_eq!(config.network.connect_retries, 3);
        assert_eq!(config.firmware.arm, "set_arm=1");
    }

    #[test]
    fn test_toml_and_env_layering() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "acq.toml",
                r#"
                [capture]
                poll_interval = "250ms"
                shot_timeout = "30s"

                [stream]
                runtime = "1m"

                [[uuts]]
                id = "acq2106_001"
                host = "10.0.0.5"
                "#,
            )?;
            jail.set_env("ACQ_SHOT_CAPTURE__SHOT_TIMEOUT", "90s");
            let config = AppConfig::load_from("acq.toml")?;
            assert_eq!(config.capture.poll_interval, Duration::from_millis(250));
            assert_eq!(config.capture.shot_timeout, Duration::from_secs(90));
            assert_eq!(config.stream.runtime, Some(Duration::from_secs(60)));
            let ep = config.uut(&UutId::new("acq2106_001")).endpoint();
            assert_eq!(ep.control_addr(), "10.0.0.5:4220");
            Ok(())
        });
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = AppConfig::default();
        config.application.log_level = "loud".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_uut_ids() {
        let mut config = AppConfig::default();
        let def = config.uut(&UutId::new("a"));
        config.uuts = vec![def.clone(), def];
        assert!(config.validate().unwrap_err().contains("Duplicate"));
    }

    #[test]
    fn test_unknown_uut_defaults_to_hostname() {
        let config = AppConfig::default();
        let ep = config.uut(&UutId::new("acq1001_070")).endpoint();
        assert_eq!(ep.data_addr(), "acq1001_070:4210");
    }
}
