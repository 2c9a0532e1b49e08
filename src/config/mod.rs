//! # Configuration Management Module
//!
//! Runtime settings for both ends of the link, loaded from a TOML file.
//!
//! ## Configuration Structure
//!
//! - [`LinkConfig`] - addresses, service port and the read/connect timeouts
//! - [`StorageConfig`] - where the lookup table and the activity record live
//! - [`ReaderConfig`] - the tag reader device and its polling cadence
//! - [`BoardConfig`] - board-only switches (clock setting)
//! - [`LoggingConfig`] - log level and optional log file
//!
//! ## Usage
//!
//! ```rust,no_run
//! use tagtrack::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("tagtrack.toml").await?;
//!     println!("Board address: {}", config.link.board_address);
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration File Format
//!
//! ```toml
//! [link]
//! device_name = "RFIDTIMETRACKER"
//! board_address = "192.168.4.1"
//! listen_address = "0.0.0.0"
//! service_port = 47004
//! read_timeout_ms = 15000
//!
//! [storage]
//! data_dir = "./data"
//! ```

use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub link: LinkConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub reader: ReaderConfig,
    #[serde(default)]
    pub board: BoardConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Name pattern the controller resolves to the board address.
    pub device_name: String,
    /// Address the controller dials once `device_name` is resolved.
    pub board_address: String,
    /// Address the board binds its listener to.
    pub listen_address: String,
    /// Well-known service port shared by both sides.
    pub service_port: u16,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Blocking read timeout, and the no-data watermark for polling reads.
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    /// Timeout for the first prefix read of a non-blocking poll.
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    /// Pause after dialing before reading the board's info frame.
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    /// Pause between failed board handshake attempts.
    #[serde(default = "default_handshake_retry_ms")]
    pub handshake_retry_ms: u64,
}

fn default_connect_timeout_ms() -> u64 {
    15_000
}

fn default_read_timeout_ms() -> u64 {
    15_000
}

fn default_poll_timeout_ms() -> u64 {
    1
}

fn default_settle_delay_ms() -> u64 {
    200
}

fn default_handshake_retry_ms() -> u64 {
    1_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub data_dir: String,
    #[serde(default = "default_lookup_file")]
    pub lookup_file: String,
    #[serde(default = "default_activity_file")]
    pub activity_file: String,
}

fn default_lookup_file() -> String {
    "lookup_table.json".to_string()
}

fn default_activity_file() -> String {
    "activity_table.json".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaderConfig {
    /// Serial device of a UID-printing reader module. Empty means keyboard entry.
    #[serde(default)]
    pub port: String,
    #[serde(default = "default_reader_baud")]
    pub baud_rate: u32,
    /// Upper bound on one hardware wait; also bounds reader stop latency.
    #[serde(default = "default_reader_poll_ms")]
    pub poll_timeout_ms: u64,
    /// Pause between two tag reads.
    #[serde(default = "default_read_interval_ms")]
    pub read_interval_ms: u64,
    /// How long a `write` command waits for a tag to bind.
    #[serde(default = "default_write_timeout_secs")]
    pub write_timeout_secs: u64,
}

fn default_reader_baud() -> u32 {
    9600
}

fn default_reader_poll_ms() -> u64 {
    500
}

fn default_read_interval_ms() -> u64 {
    1_000
}

fn default_write_timeout_secs() -> u64 {
    60
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            port: String::new(),
            baud_rate: default_reader_baud(),
            poll_timeout_ms: default_reader_poll_ms(),
            read_interval_ms: default_read_interval_ms(),
            write_timeout_secs: default_write_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardConfig {
    /// Honour `set_time` commands from the controller.
    #[serde(default)]
    pub allow_set_time: bool,
    /// Program and leading arguments used to set the clock; the timestamp is appended.
    #[serde(default = "default_set_time_command")]
    pub set_time_command: Vec<String>,
}

fn default_set_time_command() -> Vec<String> {
    vec!["sudo".into(), "date".into(), "-s".into()]
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            allow_set_time: false,
            set_time_command: default_set_time_command(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

/// Link timing resolved into durations, as consumed by [`crate::link::Channel`].
#[derive(Debug, Clone)]
pub struct LinkSettings {
    pub device_name: String,
    pub service_port: u16,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub poll_timeout: Duration,
    pub settle_delay: Duration,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Config::default().link.settings()
    }
}

impl LinkConfig {
    pub fn settings(&self) -> LinkSettings {
        LinkSettings {
            device_name: self.device_name.clone(),
            service_port: self.service_port,
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            read_timeout: Duration::from_millis(self.read_timeout_ms),
            poll_timeout: Duration::from_millis(self.poll_timeout_ms),
            settle_delay: Duration::from_millis(self.settle_delay_ms),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;
        config.validate()?;

        Ok(config)
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.link.service_port == 0 {
            return Err(anyhow!("link.service_port must be non-zero"));
        }
        if self.link.poll_timeout_ms == 0 {
            return Err(anyhow!("link.poll_timeout_ms must be at least 1"));
        }
        if self.link.poll_timeout_ms >= self.link.read_timeout_ms {
            return Err(anyhow!(
                "link.poll_timeout_ms ({}) must be shorter than link.read_timeout_ms ({})",
                self.link.poll_timeout_ms,
                self.link.read_timeout_ms
            ));
        }
        if self.reader.poll_timeout_ms == 0 {
            return Err(anyhow!("reader.poll_timeout_ms must be at least 1"));
        }
        if self.board.allow_set_time && self.board.set_time_command.is_empty() {
            return Err(anyhow!("board.set_time_command is empty but allow_set_time is on"));
        }
        if self.storage.lookup_file == self.storage.activity_file {
            return Err(anyhow!("storage.lookup_file and storage.activity_file must differ"));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            link: LinkConfig {
                device_name: "RFIDTIMETRACKER".to_string(),
                board_address: "127.0.0.1".to_string(),
                listen_address: "0.0.0.0".to_string(),
                service_port: 47004,
                connect_timeout_ms: default_connect_timeout_ms(),
                read_timeout_ms: default_read_timeout_ms(),
                poll_timeout_ms: default_poll_timeout_ms(),
                settle_delay_ms: default_settle_delay_ms(),
                handshake_retry_ms: default_handshake_retry_ms(),
            },
            storage: StorageConfig {
                data_dir: "./data".to_string(),
                lookup_file: default_lookup_file(),
                activity_file: default_activity_file(),
            },
            reader: ReaderConfig::default(),
            board: BoardConfig::default(),
            logging: LoggingConfig {
                level: "info".to_string(),
                file: Some("tagtrack.log".to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        config.validate().unwrap();
        let settings = config.link.settings();
        assert_eq!(settings.read_timeout, Duration::from_secs(15));
        assert_eq!(settings.poll_timeout, Duration::from_millis(1));
    }

    #[test]
    fn minimal_toml_fills_in_defaults() {
        let toml = r#"
            [link]
            device_name = "RFIDTIMETRACKER"
            board_address = "10.0.0.2"
            listen_address = "0.0.0.0"
            service_port = 4000

            [storage]
            data_dir = "/var/lib/tagtrack"

            [logging]
            level = "debug"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.link.read_timeout_ms, 15_000);
        assert_eq!(config.storage.lookup_file, "lookup_table.json");
        assert_eq!(config.reader.write_timeout_secs, 60);
        assert!(!config.board.allow_set_time);
        assert_eq!(config.board.set_time_command, vec!["sudo", "date", "-s"]);
    }

    #[test]
    fn poll_timeout_must_undercut_read_timeout() {
        let mut config = Config::default();
        config.link.poll_timeout_ms = config.link.read_timeout_ms;
        assert!(config.validate().is_err());
    }

    #[test]
    fn defaults_survive_a_toml_round_trip() {
        let text = toml::to_string_pretty(&Config::default()).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.link.service_port, 47004);
        assert_eq!(parsed.logging.file.as_deref(), Some("tagtrack.log"));
    }
}
