//! Poller configuration
//!
//! Defaults are layered under environment variables prefixed `BUSPOLLER_`,
//! with `__` separating nested keys:
//!
//! - `BUSPOLLER_SERIAL__PATH=/dev/ttyS1`
//! - `BUSPOLLER_TIMING__IDLE_MS=200`
//! - `BUSPOLLER_LEGACY__ENABLED=true`

use std::net::Ipv4Addr;
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Serialized};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::registry::MAX_DEVICES;
use crate::topology::MAX_ENTRIES;

const ENV_PREFIX: &str = "BUSPOLLER_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub serial: SerialConfig,
    pub network: NetworkConfig,
    pub timing: PollTiming,
    pub legacy: LegacyConfig,
    pub commands: CommandConfig,
    /// Registry capacity
    pub max_devices: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            serial: SerialConfig::default(),
            network: NetworkConfig::default(),
            timing: PollTiming::default(),
            legacy: LegacyConfig::default(),
            commands: CommandConfig::default(),
            max_devices: MAX_DEVICES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Serial device carrying the bus
    pub path: String,
    pub baud: u32,
    /// Transceiver loops our own transmissions back onto the receive line
    pub echo_suppression: bool,
    /// Pause after a failed read before reading again
    pub read_backoff_ms: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            path: "/dev/ttyUSB0".to_string(),
            baud: 115_200,
            echo_suppression: false,
            read_backoff_ms: 1000,
        }
    }
}

impl SerialConfig {
    pub fn read_backoff(&self) -> Duration {
        Duration::from_millis(self.read_backoff_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Source address of our datagrams
    pub host_address: Ipv4Addr,
    pub broadcast_address: Ipv4Addr,
    /// UDP port for topology broadcasts and polls
    pub udp_port: u16,
    /// Port devices use to reach the command broker, advertised in topology
    pub command_port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host_address: Ipv4Addr::new(169, 254, 0, 1),
            broadcast_address: Ipv4Addr::new(169, 254, 255, 255),
            udp_port: 30000,
            command_port: 1883,
        }
    }
}

/// Bus schedule. Every wait is counted in ticks of `tick_ms`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollTiming {
    /// Period between topology broadcasts
    pub topology_period_ms: u64,
    /// Quiet time after a topology broadcast before polling resumes
    pub settle_ms: u64,
    /// How long a polled device has to start replying
    pub idle_ms: u64,
    /// How long a started reply has to finish
    pub max_response_ms: u64,
    pub tick_ms: u64,
}

impl Default for PollTiming {
    fn default() -> Self {
        Self {
            topology_period_ms: 4000,
            settle_ms: 500,
            idle_ms: 150,
            max_response_ms: 600,
            tick_ms: 1,
        }
    }
}

impl PollTiming {
    pub fn topology_period(&self) -> Duration {
        Duration::from_millis(self.topology_period_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn idle_ticks(&self) -> u32 {
        self.ticks(self.idle_ms)
    }

    pub fn max_response_ticks(&self) -> u32 {
        self.ticks(self.max_response_ms)
    }

    fn ticks(&self, ms: u64) -> u32 {
        u32::try_from(ms / self.tick_ms.max(1)).unwrap_or(u32::MAX)
    }
}

/// Slow-speed probe for devices that predate the bus protocol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LegacyConfig {
    pub enabled: bool,
    pub baud: u32,
    /// Line hold after the probe before the bus speed is restored
    pub settle_ms: u64,
}

impl Default for LegacyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            baud: 9600,
            settle_ms: 100,
        }
    }
}

impl LegacyConfig {
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandConfig {
    /// How long telemetry has to confirm a command
    pub convergence_window_secs: u64,
    /// How often pending commands are checked for timeout
    pub sweep_interval_ms: u64,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            convergence_window_secs: 30,
            sweep_interval_ms: 1000,
        }
    }
}

impl CommandConfig {
    pub fn convergence_window(&self) -> Duration {
        Duration::from_secs(self.convergence_window_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

impl BusConfig {
    /// Load defaults overlaid with `BUSPOLLER_*` environment variables
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_figment(Self::figment())
    }

    pub fn figment() -> Figment {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    pub fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let config: Self = figment.extract().map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let nonzero = [
            ("serial.baud", u64::from(self.serial.baud)),
            ("timing.topology_period_ms", self.timing.topology_period_ms),
            ("timing.tick_ms", self.timing.tick_ms),
            ("timing.idle_ms", self.timing.idle_ms),
            ("timing.max_response_ms", self.timing.max_response_ms),
            ("commands.convergence_window_secs", self.commands.convergence_window_secs),
            ("commands.sweep_interval_ms", self.commands.sweep_interval_ms),
            ("max_devices", self.max_devices as u64),
        ];
        if let Some(&(field, _)) = nonzero.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Zero { field });
        }
        if self.max_devices > MAX_ENTRIES {
            return Err(ConfigError::RosterTooLarge {
                max_devices: self.max_devices,
                limit: MAX_ENTRIES,
            });
        }
        if self.legacy.enabled && self.legacy.baud == 0 {
            return Err(ConfigError::Zero { field: "legacy.baud" });
        }
        if self.timing.idle_ms > self.timing.max_response_ms {
            return Err(ConfigError::IdleExceedsMax {
                idle_ms: self.timing.idle_ms,
                max_ms: self.timing.max_response_ms,
            });
        }
        Ok(())
    }
}
