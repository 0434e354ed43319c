//! Sensor-facing types shared by the SEN5x driver, the simulator and the
//! cycle controller.

use std::fmt;

/// Size of the serial-number buffer, including the terminating NUL the
/// sensor sends.  Identities are truncated to `SERIAL_NUMBER_SIZE - 1`.
pub const SERIAL_NUMBER_SIZE: usize = 32;

/// Identity used when the sensor cannot report its serial number.
pub const UNKNOWN_SERIAL: &str = "unknown";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failure of a sensor-driver call.  Every variant maps to a numeric code so
/// log lines stay comparable with the vendor documentation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SensorError {
    #[error("i2c write failed (code {code:#06x}): {detail}", code = Self::WRITE_CODE)]
    Write { detail: String },
    #[error("i2c read failed (code {code:#06x}): {detail}", code = Self::READ_CODE)]
    Read { detail: String },
    #[error("crc mismatch in word {word} (code {code:#06x})", code = Self::CRC_CODE)]
    Crc { word: usize },
    #[error("sensor reported error code {0}")]
    Device(u16),
}

impl SensorError {
    const WRITE_CODE: u16 = 0x0100;
    const READ_CODE: u16 = 0x0200;
    const CRC_CODE: u16 = 0x0206;

    /// Numeric error code; never zero.
    pub fn code(&self) -> u16 {
        match self {
            Self::Write { .. } => Self::WRITE_CODE,
            Self::Read { .. } => Self::READ_CODE,
            Self::Crc { .. } => Self::CRC_CODE,
            Self::Device(code) => (*code).max(1),
        }
    }
}

// ---------------------------------------------------------------------------
// Driver contract
// ---------------------------------------------------------------------------

/// Blocking access to an air-quality sensor on a local bus.
pub trait SensorDriver {
    /// Factory serial number as reported by the device.
    fn serial_number(&mut self) -> Result<String, SensorError>;

    /// Switch the device into continuous measurement mode.
    fn start_measurement(&mut self) -> Result<(), SensorError>;

    /// Read the latest set of measured values.  Channels the device cannot
    /// provide yet are `NaN`.
    fn read_measured_values(&mut self) -> Result<Measurements, SensorError>;
}

/// A driver that may have failed to open.  An unavailable bus is not fatal:
/// every call reports a bus error with its code and the cycle carries on.
#[cfg_attr(not(feature = "sen5x"), allow(dead_code))]
pub enum SensorHandle<S> {
    Open(S),
    Unavailable { reason: String },
}

#[cfg_attr(not(feature = "sen5x"), allow(dead_code))]
impl<S> SensorHandle<S> {
    pub fn from_result(result: anyhow::Result<S>) -> Self {
        match result {
            Ok(sensor) => Self::Open(sensor),
            Err(e) => {
                let reason = format!("{e:#}");
                tracing::error!("sensor unavailable, continuing without it: {reason}");
                Self::Unavailable { reason }
            }
        }
    }
}

impl<S: SensorDriver> SensorDriver for SensorHandle<S> {
    fn serial_number(&mut self) -> Result<String, SensorError> {
        match self {
            Self::Open(s) => s.serial_number(),
            Self::Unavailable { reason } => Err(SensorError::Read {
                detail: reason.clone(),
            }),
        }
    }

    fn start_measurement(&mut self) -> Result<(), SensorError> {
        match self {
            Self::Open(s) => s.start_measurement(),
            Self::Unavailable { reason } => Err(SensorError::Write {
                detail: reason.clone(),
            }),
        }
    }

    fn read_measured_values(&mut self) -> Result<Measurements, SensorError> {
        match self {
            Self::Open(s) => s.read_measured_values(),
            Self::Unavailable { reason } => Err(SensorError::Read {
                detail: reason.clone(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Measurements
// ---------------------------------------------------------------------------

/// One of the eight scalar channels produced per read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Pm1_0,
    Pm2_5,
    Pm4_0,
    Pm10_0,
    Humidity,
    Temperature,
    VocIndex,
    NoxIndex,
}

impl Channel {
    /// Publish order.
    pub const ALL: [Channel; 8] = [
        Channel::Pm1_0,
        Channel::Pm2_5,
        Channel::Pm4_0,
        Channel::Pm10_0,
        Channel::Humidity,
        Channel::Temperature,
        Channel::VocIndex,
        Channel::NoxIndex,
    ];

    /// Measurement name used on the wire.
    pub fn metric_name(self) -> &'static str {
        match self {
            Self::Pm1_0 => "mass_concentration_pm_1_0",
            Self::Pm2_5 => "mass_concentration_pm_2_5",
            Self::Pm4_0 => "mass_concentration_pm_4_0",
            Self::Pm10_0 => "mass_concentration_pm_10_0",
            Self::Humidity => "humidity",
            Self::Temperature => "temperature",
            Self::VocIndex => "voc_index",
            Self::NoxIndex => "nox_index",
        }
    }

    /// Short label for console output.
    pub fn label(self) -> &'static str {
        match self {
            Self::Pm1_0 => "MassConcentrationPm1p0",
            Self::Pm2_5 => "MassConcentrationPm2p5",
            Self::Pm4_0 => "MassConcentrationPm4p0",
            Self::Pm10_0 => "MassConcentrationPm10p0",
            Self::Humidity => "AmbientHumidity",
            Self::Temperature => "AmbientTemperature",
            Self::VocIndex => "VocIndex",
            Self::NoxIndex => "NoxIndex",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.metric_name())
    }
}

/// One atomic read of all eight channels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurements {
    /// Mass concentration PM1.0 [µg/m³]
    pub pm1_0: f32,
    /// Mass concentration PM2.5 [µg/m³]
    pub pm2_5: f32,
    /// Mass concentration PM4.0 [µg/m³]
    pub pm4_0: f32,
    /// Mass concentration PM10 [µg/m³]
    pub pm10_0: f32,
    /// Compensated ambient humidity [%RH]
    pub humidity: f32,
    /// Compensated ambient temperature [°C]
    pub temperature: f32,
    pub voc_index: f32,
    pub nox_index: f32,
}

impl Measurements {
    /// A set where every channel is unavailable.
    pub const UNAVAILABLE: Measurements = Measurements {
        pm1_0: f32::NAN,
        pm2_5: f32::NAN,
        pm4_0: f32::NAN,
        pm10_0: f32::NAN,
        humidity: f32::NAN,
        temperature: f32::NAN,
        voc_index: f32::NAN,
        nox_index: f32::NAN,
    };

    pub fn get(&self, channel: Channel) -> f32 {
        match channel {
            Channel::Pm1_0 => self.pm1_0,
            Channel::Pm2_5 => self.pm2_5,
            Channel::Pm4_0 => self.pm4_0,
            Channel::Pm10_0 => self.pm10_0,
            Channel::Humidity => self.humidity,
            Channel::Temperature => self.temperature,
            Channel::VocIndex => self.voc_index,
            Channel::NoxIndex => self.nox_index,
        }
    }

    /// Channels paired with their value, in publish order.
    pub fn iter(&self) -> impl Iterator<Item = (Channel, f32)> + '_ {
        Channel::ALL.into_iter().map(|ch| (ch, self.get(ch)))
    }
}

// ---------------------------------------------------------------------------
// Device identity
// ---------------------------------------------------------------------------

/// The sensor's serial number, resolved once at startup and attached to
/// every published point.  Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity(String);

impl DeviceIdentity {
    /// Ask the driver for its serial number, falling back to
    /// [`UNKNOWN_SERIAL`] on error or an empty answer.
    pub fn resolve<S: SensorDriver>(sensor: &mut S) -> Self {
        match sensor.serial_number() {
            Ok(serial) => {
                let identity = Self::from_raw(&serial);
                tracing::info!(serial_number = %identity, "sensor identified");
                identity
            }
            Err(e) => {
                tracing::error!(code = e.code(), "failed to read serial number: {e}");
                Self::unknown()
            }
        }
    }

    /// Normalise a raw serial: stop at the first NUL, trim, truncate to the
    /// buffer size.  Empty input yields the placeholder.
    pub fn from_raw(raw: &str) -> Self {
        let serial: String = raw
            .split('\0')
            .next()
            .unwrap_or_default()
            .trim()
            .chars()
            .take(SERIAL_NUMBER_SIZE - 1)
            .collect();

        if serial.is_empty() {
            tracing::warn!("sensor returned an empty serial number");
            Self::unknown()
        } else {
            Self(serial)
        }
    }

    pub fn unknown() -> Self {
        Self(UNKNOWN_SERIAL.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
