//! Configuration for the setu-gw daemon
//!
//! Loads configuration from a TOML file. Every timing constant of the
//! collector state machine and the OAD transfer engine is overridable here;
//! the defaults match the values the co-processor firmware was tuned
//! against.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Top-level daemon configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub network: NetworkConfig,
    pub mac: MacConfig,
    pub collector: CollectorConfig,
    pub oad: OadConfig,
    pub logging: LoggingConfig,
}

/// Gateway client socket configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NetworkConfig {
    /// TCP bind address for gateway clients, e.g. "0.0.0.0:5000"
    pub bind_address: String,
    /// Read timeout on client sockets in milliseconds
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
}

/// MAC co-processor link configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MacConfig {
    /// Co-processor serial port, e.g. "/dev/ttyACM0"
    pub port: String,
    /// UART baud rate
    #[serde(default = "default_baud")]
    pub baud_rate: u32,
    /// Frequency hopping mode enabled on the network
    #[serde(default)]
    pub fh_enabled: bool,
    /// MAC beacon order (15 = no beacons)
    #[serde(default = "default_order")]
    pub beacon_order: u8,
    /// MAC superframe order (15 = no superframes)
    #[serde(default = "default_order")]
    pub superframe_order: u8,
    /// Network-level security enabled
    #[serde(default)]
    pub security_enabled: bool,
}

/// Association tracker configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CollectorConfig {
    /// Maximum number of associated devices
    #[serde(default = "default_max_devices")]
    pub max_devices: usize,
    /// Delay before a config request retry, in milliseconds
    #[serde(default = "default_config_delay_ms")]
    pub config_delay_ms: u64,
    /// Delay between tracking rounds when idle, in milliseconds
    #[serde(default = "default_tracking_delay_ms")]
    pub tracking_delay_ms: u64,
    /// Timeout waiting for a tracking response, in milliseconds
    #[serde(default = "default_tracking_timeout_ms")]
    pub tracking_timeout_ms: u64,
    /// Reporting interval pushed to sensors in config requests, ms
    #[serde(default = "default_reporting_interval_ms")]
    pub reporting_interval_ms: u32,
    /// Polling interval pushed to sleepy sensors in config requests, ms
    #[serde(default = "default_polling_interval_ms")]
    pub polling_interval_ms: u32,
    /// Interval between broadcast command messages in FH mode, ms.
    /// Zero disables broadcast generation.
    #[serde(default)]
    pub broadcast_interval_ms: u64,
}

/// OAD transfer configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OadConfig {
    /// Transfer block size in bytes
    #[serde(default = "default_block_size")]
    pub block_size: u32,
    /// File offset of the legacy (Chameleon) image header. Platform
    /// dependent: 0 for flash-resident boot images, 0x04F0 when the
    /// vendor ROM keeps the header inside the boot sector.
    #[serde(default)]
    pub legacy_header_addr: u64,
    /// Target reset handshake: retry period in milliseconds
    #[serde(default = "default_reset_retry_ms")]
    pub reset_retry_ms: u64,
    /// Target reset handshake: maximum retries before aborting
    #[serde(default = "default_reset_max_retries")]
    pub reset_max_retries: u32,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

fn default_read_timeout_ms() -> u64 {
    1000
}
fn default_baud() -> u32 {
    115200
}
fn default_order() -> u8 {
    15
}
fn default_max_devices() -> usize {
    50
}
fn default_config_delay_ms() -> u64 {
    2000
}
fn default_tracking_delay_ms() -> u64 {
    5000
}
fn default_tracking_timeout_ms() -> u64 {
    6000
}
fn default_reporting_interval_ms() -> u32 {
    90000
}
fn default_polling_interval_ms() -> u32 {
    6000
}
fn default_block_size() -> u32 {
    256
}
fn default_reset_retry_ms() -> u64 {
    12000
}
fn default_reset_max_retries() -> u32 {
    3
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Built-in defaults, used by tests and as a starting point for new
    /// deployments.
    pub fn defaults() -> Self {
        Self {
            network: NetworkConfig {
                bind_address: "0.0.0.0:5000".to_string(),
                read_timeout_ms: default_read_timeout_ms(),
            },
            mac: MacConfig {
                port: "/dev/ttyACM0".to_string(),
                baud_rate: default_baud(),
                fh_enabled: false,
                beacon_order: default_order(),
                superframe_order: default_order(),
                security_enabled: false,
            },
            collector: CollectorConfig {
                max_devices: default_max_devices(),
                config_delay_ms: default_config_delay_ms(),
                tracking_delay_ms: default_tracking_delay_ms(),
                tracking_timeout_ms: default_tracking_timeout_ms(),
                reporting_interval_ms: default_reporting_interval_ms(),
                polling_interval_ms: default_polling_interval_ms(),
                broadcast_interval_ms: 0,
            },
            oad: OadConfig {
                block_size: default_block_size(),
                legacy_header_addr: 0,
                reset_retry_ms: default_reset_retry_ms(),
                reset_max_retries: default_reset_max_retries(),
            },
            logging: LoggingConfig {
                level: "info".to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal_config() {
        let toml_str = r#"
            [network]
            bind_address = "127.0.0.1:5000"

            [mac]
            port = "/dev/ttyUSB0"
            fh_enabled = true

            [collector]
            max_devices = 16

            [oad]
            block_size = 128
            legacy_header_addr = 0x04F0

            [logging]
            level = "debug"
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.network.bind_address, "127.0.0.1:5000");
        assert_eq!(config.network.read_timeout_ms, 1000);
        assert!(config.mac.fh_enabled);
        assert_eq!(config.collector.max_devices, 16);
        assert_eq!(config.collector.config_delay_ms, 2000);
        assert_eq!(config.oad.block_size, 128);
        assert_eq!(config.oad.legacy_header_addr, 0x04F0);
        assert_eq!(config.oad.reset_max_retries, 3);
    }

    #[test]
    fn defaults_are_complete() {
        let config = Config::defaults();
        assert_eq!(config.oad.block_size, 256);
        assert_eq!(config.oad.legacy_header_addr, 0);
        assert_eq!(config.mac.beacon_order, 15);
    }
}
