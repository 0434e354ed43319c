//! Stateful SEN5x simulator for local development.
//!
//! Models enough of the real sensor to exercise the cycle controller:
//! - Temporal coherence via random walk with mean reversion
//! - Per-reading electronic noise
//! - Warm-up period where humidity/temperature/VOC/NOx are not yet available
//! - Occasional bus errors (flaky scenario)

#![cfg_attr(feature = "sen5x", allow(dead_code))]

use std::fmt;

use crate::sensor::{Measurements, SensorDriver, SensorError};

// ---------------------------------------------------------------------------
// Gaussian approximation (no extra dependency)
// ---------------------------------------------------------------------------

/// Approximate a sample from N(0,1) using the Irwin-Hall method:
/// sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal() -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += fastrand::f64();
    }
    sum - 6.0
}

/// Sample from N(mean, sigma).
fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Pre-configured simulation profiles selectable via `SIM_SCENARIO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Every channel valid from the first read.  Indoor air, light noise.
    Steady,
    /// Humidity, temperature, VOC and NOx stay unavailable for the first
    /// reads, like a freshly powered sensor.
    Warmup,
    /// ~10% of reads fail with a device error code; noisier values.
    Flaky,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "warmup" => Self::Warmup,
            "flaky" => Self::Flaky,
            _ => Self::Steady, // default
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Steady => write!(f, "steady"),
            Self::Warmup => write!(f, "warmup"),
            Self::Flaky => write!(f, "flaky"),
        }
    }
}

/// Reads during which the gas/climate channels report NaN in warm-up.
const WARMUP_READS: u32 = 3;

/// Error code reported by simulated bus failures.
pub const SIM_ERROR_CODE: u16 = 0x0205;

// ---------------------------------------------------------------------------
// Per-channel state
// ---------------------------------------------------------------------------

/// A random walk pulled back toward `center`.
struct Walk {
    value: f64,
    center: f64,
    sigma: f64,
    min: f64,
    max: f64,
}

impl Walk {
    fn new(center: f64, sigma: f64, min: f64, max: f64) -> Self {
        Self {
            value: center,
            center,
            sigma,
            min,
            max,
        }
    }

    fn step(&mut self, mean_reversion: f64, noise: f64) -> f32 {
        let pull = mean_reversion * (self.center - self.value);
        self.value = (self.value + pull + gaussian(0.0, self.sigma)).clamp(self.min, self.max);
        (self.value + gaussian(0.0, self.sigma * noise)).clamp(self.min, self.max) as f32
    }
}

// ---------------------------------------------------------------------------
// Simulator
// ---------------------------------------------------------------------------

/// Simulated SEN5x producing plausible indoor readings.
pub struct Sen5xSim {
    scenario: Scenario,
    serial: String,
    measuring: bool,
    reads: u32,
    pm: Walk,
    humidity: Walk,
    temperature: Walk,
    voc: Walk,
    nox: Walk,
    error_prob: f32,
    noise: f64,
}

impl Sen5xSim {
    pub fn new(scenario: Scenario) -> Self {
        let (error_prob, noise) = match scenario {
            Scenario::Steady | Scenario::Warmup => (0.0, 0.3),
            Scenario::Flaky => (0.10_f32, 1.0),
        };

        Self {
            scenario,
            serial: format!("SIM-{:08X}", fastrand::u32(..)),
            measuring: false,
            reads: 0,
            pm: Walk::new(8.0, 1.5, 0.0, 1000.0),
            humidity: Walk::new(45.0, 0.8, 0.0, 100.0),
            temperature: Walk::new(21.5, 0.2, -10.0, 50.0),
            voc: Walk::new(100.0, 5.0, 1.0, 500.0),
            nox: Walk::new(1.0, 0.2, 1.0, 500.0),
            error_prob,
            noise,
        }
    }

    pub fn scenario(&self) -> Scenario {
        self.scenario
    }

    fn warming_up(&self) -> bool {
        self.scenario == Scenario::Warmup && self.reads <= WARMUP_READS
    }
}

impl SensorDriver for Sen5xSim {
    fn serial_number(&mut self) -> Result<String, SensorError> {
        Ok(self.serial.clone())
    }

    fn start_measurement(&mut self) -> Result<(), SensorError> {
        self.measuring = true;
        tracing::info!(scenario = %self.scenario, "simulated sen5x measuring");
        Ok(())
    }

    fn read_measured_values(&mut self) -> Result<Measurements, SensorError> {
        if !self.measuring {
            return Ok(Measurements::UNAVAILABLE);
        }
        if fastrand::f32() < self.error_prob {
            return Err(SensorError::Device(SIM_ERROR_CODE));
        }

        self.reads += 1;

        // PM size bins are cumulative: PM1.0 <= PM2.5 <= PM4.0 <= PM10.
        let pm1_0 = self.pm.step(0.1, self.noise);
        let pm2_5 = pm1_0 * 1.15;
        let pm4_0 = pm2_5 * 1.05;
        let pm10_0 = pm4_0 * 1.03;

        let (humidity, temperature, voc_index, nox_index) = if self.warming_up() {
            (f32::NAN, f32::NAN, f32::NAN, f32::NAN)
        } else {
            (
                self.humidity.step(0.05, self.noise),
                self.temperature.step(0.05, self.noise),
                self.voc.step(0.2, self.noise).round(),
                self.nox.step(0.2, self.noise).round(),
            )
        };

        Ok(Measurements {
            pm1_0,
            pm2_5,
            pm4_0,
            pm10_0,
            humidity,
            temperature,
            voc_index,
            nox_index,
        })
    }
}

// ===========================================================================
// Tests
// ===========================================================================
