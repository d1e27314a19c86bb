//! Configuration for the Modbus to WebSocket bridge.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use cloudlink_common::{Backoff, BridgeConfig, Error, LoggingConfig, Result};

use crate::bridge::{BridgeTiming, PollSpec};
use crate::channel::ChannelLinkOptions;
use crate::field::FieldLinkOptions;

/// Complete bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModbusBridgeConfig {
    /// Field device settings
    pub modbus: ModbusConfig,

    /// Cloud channel settings
    pub server: ServerConfig,

    /// Orchestrator settings
    #[serde(default)]
    pub supervisor: SupervisorConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Field device configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModbusConfig {
    /// Connection type and address
    pub connection: ConnectionConfig,

    /// Modbus unit/slave ID (1-247)
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,

    /// First holding register to poll
    #[serde(default)]
    pub read_address: u16,

    /// Number of contiguous registers to poll
    pub register_count: u16,

    /// Poll interval in seconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: f64,

    /// Connect attempts per supervisory pass
    #[serde(default = "default_retries")]
    pub retries: u32,

    /// Timeout for connecting and for every register read, in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// First reconnect delay in milliseconds (doubles per attempt)
    #[serde(default = "default_field_backoff_ms")]
    pub backoff_ms: u64,
}

fn default_unit_id() -> u8 {
    1
}

fn default_poll_interval() -> f64 {
    1.0
}

fn default_retries() -> u32 {
    3
}

fn default_timeout_ms() -> u64 {
    2000
}

fn default_field_backoff_ms() -> u64 {
    1000
}

/// Connection configuration (TCP or RTU).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ConnectionConfig {
    /// Modbus TCP connection
    Tcp {
        /// Host address (IP or hostname)
        host: String,
        /// TCP port (default: 502)
        #[serde(default = "default_modbus_port")]
        port: u16,
    },
    /// Modbus RTU (serial) connection
    Rtu {
        /// Serial port path (e.g., "/dev/ttyUSB0" or "COM1")
        port: String,
        /// Baud rate (default: 9600)
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
        /// Data bits (default: 8)
        #[serde(default = "default_data_bits")]
        data_bits: u8,
        /// Parity: "none", "even", or "odd" (default: "none")
        #[serde(default = "default_parity")]
        parity: String,
        /// Stop bits: 1 or 2 (default: 1)
        #[serde(default = "default_stop_bits")]
        stop_bits: u8,
    },
}

fn default_modbus_port() -> u16 {
    502
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_data_bits() -> u8 {
    8
}

fn default_parity() -> String {
    "none".to_string()
}

fn default_stop_bits() -> u8 {
    1
}

impl std::fmt::Display for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionConfig::Tcp { host, port } => write!(f, "tcp://{}:{}", host, port),
            ConnectionConfig::Rtu {
                port, baud_rate, ..
            } => write!(f, "rtu://{}@{}", port, baud_rate),
        }
    }
}

/// Cloud channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// WebSocket URL (ws:// or wss://)
    pub url: String,

    /// Connect attempts per supervisory pass
    #[serde(default = "default_retries")]
    pub retries: u32,

    /// Timeout for each connect attempt in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Timeout for writing one frame in milliseconds
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,

    /// Delay between connect attempts in milliseconds
    #[serde(default = "default_server_backoff_ms")]
    pub backoff_ms: u64,
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_send_timeout_ms() -> u64 {
    10_000
}

fn default_server_backoff_ms() -> u64 {
    2000
}

/// Orchestrator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Seconds between connection checks
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,

    /// Command intake pause when there is nothing to read, in milliseconds
    #[serde(default = "default_idle_interval_ms")]
    pub idle_interval_ms: u64,

    /// Window during which repeated identical faults are logged once
    #[serde(default = "default_throttle_window")]
    pub throttle_window_secs: u64,
}

fn default_check_interval() -> u64 {
    5
}

fn default_idle_interval_ms() -> u64 {
    100
}

fn default_throttle_window() -> u64 {
    60
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval(),
            idle_interval_ms: default_idle_interval_ms(),
            throttle_window_secs: default_throttle_window(),
        }
    }
}

impl ModbusConfig {
    /// Registers to poll and how often.
    pub fn poll_spec(&self) -> PollSpec {
        PollSpec {
            start_address: self.read_address,
            count: self.register_count,
            interval_secs: self.poll_interval_secs,
        }
    }

    /// Reconnect behaviour of the field link.
    pub fn link_options(&self, throttle_window: Duration) -> FieldLinkOptions {
        FieldLinkOptions {
            retries: self.retries,
            backoff: Backoff::exponential(
                Duration::from_millis(self.backoff_ms),
                Duration::from_secs(30),
            ),
            throttle_window,
        }
    }

    /// Per-call timeout of the field transport.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl ServerConfig {
    /// Reconnect behaviour of the channel link.
    pub fn link_options(&self, throttle_window: Duration) -> ChannelLinkOptions {
        ChannelLinkOptions {
            retries: self.retries,
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            send_timeout: Duration::from_millis(self.send_timeout_ms),
            backoff: Backoff::constant(Duration::from_millis(self.backoff_ms)),
            throttle_window,
        }
    }
}

impl SupervisorConfig {
    /// Cadence of the supervisor and command intake duties.
    pub fn timing(&self) -> BridgeTiming {
        BridgeTiming {
            supervise_interval: Duration::from_secs(self.check_interval_secs),
            idle_interval: Duration::from_millis(self.idle_interval_ms),
        }
    }

    /// Throttle window shared by both links.
    pub fn throttle_window(&self) -> Duration {
        Duration::from_secs(self.throttle_window_secs)
    }
}

impl BridgeConfig for ModbusBridgeConfig {
    fn logging(&self) -> &LoggingConfig {
        &self.logging
    }

    fn validate(&self) -> Result<()> {
        let modbus = &self.modbus;

        if modbus.unit_id == 0 || modbus.unit_id > 247 {
            return Err(Error::validation(format!(
                "modbus.unit_id must be 1-247, got {}",
                modbus.unit_id
            )));
        }

        if modbus.register_count == 0 {
            return Err(Error::validation("modbus.register_count must be > 0"));
        }

        if !modbus.poll_interval_secs.is_finite() || modbus.poll_interval_secs <= 0.0 {
            return Err(Error::validation(format!(
                "modbus.poll_interval_secs must be > 0, got {}",
                modbus.poll_interval_secs
            )));
        }

        if let ConnectionConfig::Rtu { parity, .. } = &modbus.connection {
            match parity.to_lowercase().as_str() {
                "none" | "even" | "odd" => {}
                _ => {
                    return Err(Error::validation(format!(
                        "invalid parity '{}' (use none, even, or odd)",
                        parity
                    )));
                }
            }
        }

        if !(self.server.url.starts_with("ws://") || self.server.url.starts_with("wss://")) {
            return Err(Error::validation(format!(
                "server.url must use ws:// or wss://, got '{}'",
                self.server.url
            )));
        }

        if self.supervisor.check_interval_secs == 0 {
            return Err(Error::validation(
                "supervisor.check_interval_secs must be > 0",
            ));
        }

        Ok(())
    }
}
