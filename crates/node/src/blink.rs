//! Liveness LED.  The `gpio` feature gates the real rppal pin; without it, a
//! mock pin records its level and logs transitions at trace level.

use std::thread;
use std::time::Duration;

use anyhow::Result;
use serde::Deserialize;
use tokio::time::Instant;

#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, OutputPin};

/// Time spent in each half of a pulse.
const PULSE_HALF: Duration = Duration::from_millis(100);

/// Heartbeat cadence for [`Blinker::update`].
pub const BLINK_INTERVAL: Duration = Duration::from_millis(1000);

/// How the controller drives the indicator.  One discipline per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BlinkDiscipline {
    /// One pulse at startup and one on entry to every sampling pass.
    #[default]
    PerCycle,
    /// A pulse every [`BLINK_INTERVAL`], polled from the main loop.
    Heartbeat,
}

/// A binary output.
pub trait IndicatorPin {
    fn set_low(&mut self);
    fn set_high(&mut self);
}

// ---------------------------------------------------------------------------
// Real GPIO pin (rppal, Raspberry Pi only)
// ---------------------------------------------------------------------------
#[cfg(feature = "gpio")]
pub struct LedPin {
    pin: OutputPin,
    active_low: bool, // LED wired between pin and 3V3
}

#[cfg(feature = "gpio")]
impl LedPin {
    pub fn new(pin_num: u8, active_low: bool) -> Result<Self> {
        let mut pin = Gpio::new()?.get(pin_num)?.into_output();
        // Start dark.
        if active_low {
            pin.set_high();
        } else {
            pin.set_low();
        }
        tracing::info!(gpio = pin_num, active_low, "status led initialised");
        Ok(Self { pin, active_low })
    }
}

#[cfg(feature = "gpio")]
impl IndicatorPin for LedPin {
    fn set_low(&mut self) {
        // Logical low = lit.
        if self.active_low {
            self.pin.set_low()
        } else {
            self.pin.set_high()
        }
    }

    fn set_high(&mut self) {
        if self.active_low {
            self.pin.set_high()
        } else {
            self.pin.set_low()
        }
    }
}

// ---------------------------------------------------------------------------
// Mock pin (no hardware)
// ---------------------------------------------------------------------------
#[cfg(not(feature = "gpio"))]
pub struct LedPin {
    pub(crate) high: bool,
}

#[cfg(not(feature = "gpio"))]
impl LedPin {
    pub fn new(pin_num: u8, _active_low: bool) -> Result<Self> {
        tracing::info!(gpio = pin_num, "[mock-gpio] status led (no hardware)");
        Ok(Self { high: true })
    }
}

#[cfg(not(feature = "gpio"))]
impl IndicatorPin for LedPin {
    fn set_low(&mut self) {
        self.high = false;
        tracing::trace!("[mock-gpio] led low");
    }

    fn set_high(&mut self) {
        self.high = true;
        tracing::trace!("[mock-gpio] led high");
    }
}

// ---------------------------------------------------------------------------
// Blinker
// ---------------------------------------------------------------------------

pub struct Blinker<P> {
    pin: P,
    last_pulse: Option<Instant>,
    pulse_half: Duration,
}

impl<P: IndicatorPin> Blinker<P> {
    pub fn new(pin: P) -> Self {
        Self {
            pin,
            last_pulse: None,
            pulse_half: PULSE_HALF,
        }
    }

    /// Blocking visual pulse: low, hold, high, hold.
    pub fn blink(&mut self) {
        self.pin.set_low();
        thread::sleep(self.pulse_half);
        self.pin.set_high();
        thread::sleep(self.pulse_half);
    }

    /// Pulse once if [`BLINK_INTERVAL`] has passed since the last pulse.
    /// Returns whether a pulse was emitted.
    pub fn update(&mut self, now: Instant) -> bool {
        let due = self
            .last_pulse
            .map_or(true, |last| now.saturating_duration_since(last) >= BLINK_INTERVAL);
        if due {
            self.blink();
            self.last_pulse = Some(now);
        }
        due
    }

    #[cfg(test)]
    pub(crate) fn pin(&self) -> &P {
        &self.pin
    }
}

// ===========================================================================
// Tests
// ===========================================================================
