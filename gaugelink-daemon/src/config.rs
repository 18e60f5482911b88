use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use gaugelink_comm_lib::comm::{IDLE_DELAY, SETTLE_DELAY};
use gaugelink_comm_lib::link::SerialSettings;
use gaugelink_comm_lib::ssm::SsmCode;
use gaugelink_comm_lib::{arduino, ssm, RecoveryTiming};
use log::{debug, info, warn, LevelFilter};
use serde::{Deserialize, Serialize};

/// Configurable log level
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
}

impl LogLevel {
    #[must_use]
    pub const fn as_level_filter(self) -> LevelFilter {
        match self {
            Self::Off => LevelFilter::Off,
            Self::Error => LevelFilter::Error,
            Self::Warn => LevelFilter::Warn,
            Self::Info => LevelFilter::Info,
            Self::Debug => LevelFilter::Debug,
        }
    }
}

/// Longest accepted read timeout. Recovery already waits a second per reset.
pub const MAX_READ_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SsmLinkConfig {
    /// Serial device, or `tcp://host:port`
    pub port: String,
    #[serde(default = "default_ssm_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_slow_read_interval")]
    pub slow_read_interval: u32,
    /// Codes read every cycle
    #[serde(default)]
    pub fast_read: Vec<SsmCode>,
    /// Codes read once per slow read interval
    #[serde(default)]
    pub slow_read: Vec<SsmCode>,
}

const fn default_ssm_baud_rate() -> u32 {
    ssm::BAUD_RATE
}

const fn default_read_timeout_ms() -> u64 {
    500
}

const fn default_slow_read_interval() -> u32 {
    gaugelink_comm_lib::comm::DEFAULT_SLOW_READ_INTERVAL
}

impl SsmLinkConfig {
    /// Defaults for everything but the port, with nothing enabled
    pub fn with_port(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            baud_rate: ssm::BAUD_RATE,
            read_timeout_ms: default_read_timeout_ms(),
            slow_read_interval: default_slow_read_interval(),
            fast_read: Vec::new(),
            slow_read: Vec::new(),
        }
    }

    #[must_use]
    pub fn serial_settings(&self) -> SerialSettings {
        SerialSettings::new(
            self.port.clone(),
            self.baud_rate,
            Duration::from_millis(self.read_timeout_ms),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArduinoLinkConfig {
    /// Serial device, or `tcp://host:port`
    pub port: String,
    #[serde(default = "default_arduino_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
}

const fn default_arduino_baud_rate() -> u32 {
    arduino::BAUD_RATE
}

impl ArduinoLinkConfig {
    pub fn with_port(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            baud_rate: arduino::BAUD_RATE,
            read_timeout_ms: default_read_timeout_ms(),
        }
    }

    #[must_use]
    pub fn serial_settings(&self) -> SerialSettings {
        SerialSettings::new(
            self.port.clone(),
            self.baud_rate,
            Duration::from_millis(self.read_timeout_ms),
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecoveryConfig {
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    #[serde(default = "default_idle_delay_ms")]
    pub idle_delay_ms: u64,
}

#[allow(clippy::cast_possible_truncation)]
const fn default_settle_delay_ms() -> u64 {
    SETTLE_DELAY.as_millis() as u64
}

#[allow(clippy::cast_possible_truncation)]
const fn default_idle_delay_ms() -> u64 {
    IDLE_DELAY.as_millis() as u64
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: default_settle_delay_ms(),
            idle_delay_ms: default_idle_delay_ms(),
        }
    }
}

impl RecoveryConfig {
    #[must_use]
    pub const fn timing(&self) -> RecoveryTiming {
        RecoveryTiming {
            settle_delay: Duration::from_millis(self.settle_delay_ms),
            idle_delay: Duration::from_millis(self.idle_delay_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    #[serde(default)]
    pub log_level: LogLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssm: Option<SsmLinkConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arduino: Option<ArduinoLinkConfig>,
    #[serde(default)]
    pub recovery: RecoveryConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: LogLevel::default(),
            ssm: Some(SsmLinkConfig {
                fast_read: vec![
                    SsmCode::ManifoldAbsolutePressure,
                    SsmCode::EngineSpeed,
                    SsmCode::VehicleSpeed,
                ],
                slow_read: vec![SsmCode::CoolantTemperature, SsmCode::BatteryVoltage],
                ..SsmLinkConfig::with_port("/dev/ttyUSB0")
            }),
            arduino: None,
            recovery: RecoveryConfig::default(),
        }
    }
}

fn clamp_read_timeout(link: &str, read_timeout_ms: &mut u64) {
    if *read_timeout_ms == 0 {
        warn!("{link}: read_timeout_ms of 0 would never wait, using {}", default_read_timeout_ms());
        *read_timeout_ms = default_read_timeout_ms();
    } else if *read_timeout_ms > MAX_READ_TIMEOUT_MS {
        warn!("{link}: clamping read_timeout_ms from {read_timeout_ms} to {MAX_READ_TIMEOUT_MS}");
        *read_timeout_ms = MAX_READ_TIMEOUT_MS;
    }
}

fn dedup_codes(list: &mut Vec<SsmCode>, name: &str) {
    let before = list.len();
    let mut seen = Vec::with_capacity(before);
    list.retain(|code| {
        if seen.contains(code) {
            false
        } else {
            seen.push(*code);
            true
        }
    });
    if list.len() != before {
        warn!("ssm: dropped {} duplicate entries from {name}", before - list.len());
    }
}

impl Config {
    /// Repair values the links cannot use
    pub fn validate(&mut self) {
        if let Some(ssm) = &mut self.ssm {
            clamp_read_timeout("ssm", &mut ssm.read_timeout_ms);
            if ssm.slow_read_interval == 0 {
                warn!("ssm: slow_read_interval must be at least 1, using 1");
                ssm.slow_read_interval = 1;
            }
            dedup_codes(&mut ssm.fast_read, "fast_read");
            dedup_codes(&mut ssm.slow_read, "slow_read");
        }
        if let Some(arduino) = &mut self.arduino {
            clamp_read_timeout("arduino", &mut arduino.read_timeout_ms);
        }
    }

    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(mut config) => {
                info!("Loaded config from {}", path.display());
                config.validate();
                config
            }
            Err(e) => {
                warn!("Failed to load config from {}: {e:#}, using defaults", path.display());
                Self::default()
            }
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        debug!("Loading config from {}", path.display());
        let json = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        let config: Self = serde_json::from_slice(&json).context("parsing config")?;
        debug!(
            "Config parsed: ssm={:?}, arduino={:?}, log_level={:?}",
            config.ssm.as_ref().map(|s| &s.port),
            config.arduino.as_ref().map(|a| &a.port),
            config.log_level
        );
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, &json).with_context(|| format!("writing {}", path.display()))?;
        info!("Config saved to {}", path.display());
        Ok(())
    }
}
