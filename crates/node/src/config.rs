//! Station configuration: compiled-in defaults, optionally overridden once at
//! startup by a TOML file and environment variables, then validated.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::blink::BlinkDiscipline;
use crate::network::RestartPolicy;

// ---------------------------------------------------------------------------
// Build-time defaults
// ---------------------------------------------------------------------------

pub const DEFAULT_INFLUX_HOST: &str = "cube.local";
pub const DEFAULT_INFLUX_PORT: u16 = 8086;
pub const DEFAULT_DATABASE: &str = "vindstyrka";
/// Record a sample every five minutes.
pub const DEFAULT_SAMPLE_PERIOD_SEC: u64 = 5 * 60;
pub const DEFAULT_CONFIG_PATH: &str = "station.toml";

/// BCM GPIO pins usable for the status LED.  GPIO 0-1 are reserved for the
/// ID EEPROM; GPIO 28+ are not exposed on the 40-pin header.
const VALID_GPIO_PINS: std::ops::RangeInclusive<u8> = 2..=27;

/// 7-bit I2C address space, excluding the reserved blocks.
const VALID_I2C_ADDRESSES: std::ops::RangeInclusive<u16> = 0x08..=0x77;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub influx: InfluxConfig,
    pub network: NetworkConfig,
    pub sampling: SamplingConfig,
    pub sensor: SensorConfig,
    pub indicator: IndicatorConfig,
    pub ota: OtaConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InfluxConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub timeout_sec: u64,
}

impl Default for InfluxConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_INFLUX_HOST.to_string(),
            port: DEFAULT_INFLUX_PORT,
            database: DEFAULT_DATABASE.to_string(),
            timeout_sec: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NetworkConfig {
    /// Interface whose operstate decides "connected".
    pub interface: String,
    /// Shown on the status page.
    pub hostname: String,
    pub connect_timeout_sec: u64,
    pub restart: RestartPolicy,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            interface: "wlan0".to_string(),
            hostname: "vindstyrka".to_string(),
            connect_timeout_sec: 30,
            restart: RestartPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SamplingConfig {
    pub period_sec: u64,
    pub blink: BlinkDiscipline,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            period_sec: DEFAULT_SAMPLE_PERIOD_SEC,
            blink: BlinkDiscipline::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SensorConfig {
    pub i2c_address: u16,
    /// Only used by the simulator build.
    pub sim_scenario: String,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            i2c_address: crate::sen5x::DEFAULT_ADDRESS,
            sim_scenario: "steady".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IndicatorConfig {
    pub gpio_pin: u8,
    pub active_low: bool,
}

impl Default for IndicatorConfig {
    fn default() -> Self {
        Self {
            gpio_pin: 17,
            active_low: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OtaConfig {
    pub enabled: bool,
    pub port: u16,
    /// The binary an upload replaces.  Defaults to the running executable.
    pub firmware_path: Option<PathBuf>,
    pub max_upload_bytes: usize,
}

impl Default for OtaConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 8080,
            firmware_path: None,
            max_upload_bytes: 32 * 1024 * 1024,
        }
    }
}

impl Config {
    pub fn sample_period(&self) -> Duration {
        Duration::from_secs(self.sampling.period_sec)
    }

    pub fn influx_timeout(&self) -> Duration {
        Duration::from_secs(self.influx.timeout_sec)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.network.connect_timeout_sec)
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all entries. Returns `Ok(())` or an error describing every
    /// violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        // ── Influx ──────────────────────────────────────────────
        if self.influx.host.trim().is_empty() {
            errors.push("influx.host is empty".to_string());
        }
        if self.influx.port == 0 {
            errors.push("influx.port must be non-zero".to_string());
        }
        if self.influx.database.is_empty() {
            errors.push("influx.database is empty".to_string());
        } else if !self
            .influx
            .database
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            errors.push(format!(
                "influx.database '{}' may only contain letters, digits, '_' and '-'",
                self.influx.database
            ));
        }
        if self.influx.timeout_sec == 0 {
            errors.push("influx.timeout_sec must be positive".to_string());
        }

        // ── Network ─────────────────────────────────────────────
        if self.network.interface.trim().is_empty() {
            errors.push("network.interface is empty".to_string());
        } else if self.network.interface.contains('/') {
            errors.push(format!(
                "network.interface '{}' must be a bare interface name",
                self.network.interface
            ));
        }
        if self.network.hostname.trim().is_empty() {
            errors.push("network.hostname is empty".to_string());
        }

        // ── Sampling ────────────────────────────────────────────
        if self.sampling.period_sec == 0 {
            errors.push("sampling.period_sec must be positive".to_string());
        } else if self.influx.timeout_sec.saturating_mul(8) >= self.sampling.period_sec {
            // Eight sequential publishes must fit inside one period.
            errors.push(format!(
                "sampling.period_sec ({}) must exceed 8 × influx.timeout_sec ({})",
                self.sampling.period_sec, self.influx.timeout_sec
            ));
        }

        // ── Hardware ────────────────────────────────────────────
        if !VALID_I2C_ADDRESSES.contains(&self.sensor.i2c_address) {
            errors.push(format!(
                "sensor.i2c_address {:#04x} outside 0x08-0x77",
                self.sensor.i2c_address
            ));
        }
        if !VALID_GPIO_PINS.contains(&self.indicator.gpio_pin) {
            errors.push(format!(
                "indicator.gpio_pin {} is not a valid BCM GPIO pin (allowed: 2-27)",
                self.indicator.gpio_pin
            ));
        }

        // ── OTA ─────────────────────────────────────────────────
        if self.ota.enabled {
            if self.ota.port == 0 {
                errors.push("ota.port must be non-zero".to_string());
            }
            if self.ota.max_upload_bytes == 0 {
                errors.push("ota.max_upload_bytes must be positive".to_string());
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Parse a TOML config file.  A missing file at the default path yields the
/// built-in defaults; any other missing path is an error.
fn read_file(path: &Path, explicit: bool) -> Result<Config> {
    if !explicit && !path.exists() {
        tracing::info!(path = %path.display(), "no config file, using built-in defaults");
        return Ok(Config::default());
    }
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config: {}", path.display()))?;
    toml::from_str(&contents).with_context(|| format!("failed to parse config: {}", path.display()))
}

fn parse_env<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>> {
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| anyhow::anyhow!("invalid {key}: {raw:?}")),
        None => Ok(None),
    }
}

impl Config {
    /// Apply environment overrides.  `lookup` is injectable for tests.
    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = lookup("INFLUX_HOST") {
            self.influx.host = v;
        }
        if let Some(v) = parse_env(&lookup, "INFLUX_PORT")? {
            self.influx.port = v;
        }
        if let Some(v) = lookup("INFLUX_DB") {
            self.influx.database = v;
        }
        if let Some(v) = lookup("WIFI_INTERFACE") {
            self.network.interface = v;
        }
        if let Some(v) = lookup("STATION_HOSTNAME") {
            self.network.hostname = v;
        }
        if let Some(v) = parse_env(&lookup, "SAMPLE_EVERY_S")? {
            self.sampling.period_sec = v;
        }
        if let Some(v) = lookup("SIM_SCENARIO") {
            self.sensor.sim_scenario = v;
        }
        if let Some(v) = parse_env(&lookup, "OTA_PORT")? {
            self.ota.port = v;
        }
        Ok(())
    }
}

/// Load from `CONFIG_PATH` (or the default path), apply environment
/// overrides and validate.
pub fn load() -> Result<Config> {
    let explicit = env::var("CONFIG_PATH").ok();
    let path = PathBuf::from(explicit.as_deref().unwrap_or(DEFAULT_CONFIG_PATH));
    load_with(&path, explicit.is_some(), |k| env::var(k).ok())
}

fn load_with(
    path: &Path,
    explicit: bool,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<Config> {
    let mut config = read_file(path, explicit)?;
    config.apply_env(lookup)?;
    config
        .validate()
        .with_context(|| format!("invalid config: {}", path.display()))?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
