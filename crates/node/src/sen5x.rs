//! Sensirion SEN5x environmental sensor over I2C.
//!
//! Commands are 16-bit big-endian words; every 16-bit word the sensor
//! returns is followed by a CRC-8 byte.  Only the three commands the node
//! needs are implemented: serial number, start measurement and read
//! measured values.

#![cfg_attr(not(feature = "sen5x"), allow(dead_code))]

#[cfg(feature = "sen5x")]
use rppal::i2c::I2c;
#[cfg(feature = "sen5x")]
use std::thread;
use std::time::Duration;

use crc::{Crc, CRC_8_NRSC_5};

use crate::sensor::{Measurements, SensorError};
#[cfg(feature = "sen5x")]
use crate::sensor::SensorDriver;

// ── Commands ────────────────────────────────────────────────────────────────

/// Default I2C address of all SEN5x variants.
pub const DEFAULT_ADDRESS: u16 = 0x69;

const CMD_START_MEASUREMENT: u16 = 0x0021;
const CMD_READ_MEASURED_VALUES: u16 = 0x03C4;
const CMD_SERIAL_NUMBER: u16 = 0xD033;

/// Execution times from the datasheet.
const START_MEASUREMENT_WAIT: Duration = Duration::from_millis(50);
const READ_WAIT: Duration = Duration::from_millis(20);

/// 8 words × (2 data bytes + 1 CRC).
const MEASURED_VALUES_LEN: usize = 24;
/// 16 words × (2 data bytes + 1 CRC) = 32 ASCII characters.
const SERIAL_NUMBER_LEN: usize = 48;

// ── CRC ─────────────────────────────────────────────────────────────────────

/// Sensirion CRC-8: polynomial 0x31, init 0xFF, no reflection, no final XOR.
const CRC8: Crc<u8> = Crc::<u8>::new(&CRC_8_NRSC_5);

fn crc8(data: &[u8]) -> u8 {
    CRC8.checksum(data)
}

/// Split a response into 16-bit words, verifying each word's CRC.
fn decode_words(buf: &[u8]) -> Result<Vec<u16>, SensorError> {
    buf.chunks_exact(3)
        .enumerate()
        .map(|(word, chunk)| {
            if crc8(&chunk[..2]) != chunk[2] {
                return Err(SensorError::Crc { word });
            }
            Ok(u16::from_be_bytes([chunk[0], chunk[1]]))
        })
        .collect()
}

// ── Scaling ─────────────────────────────────────────────────────────────────

/// Unsigned channel; `0xFFFF` means "not available".
fn scale_unsigned(raw: u16, factor: f32) -> f32 {
    if raw == u16::MAX {
        f32::NAN
    } else {
        f32::from(raw) / factor
    }
}

/// Signed channel; `0x7FFF` means "not available".
fn scale_signed(raw: u16, factor: f32) -> f32 {
    let v = raw as i16;
    if v == i16::MAX {
        f32::NAN
    } else {
        f32::from(v) / factor
    }
}

/// Convert the eight words of a "read measured values" response.
fn measurements_from_words(words: &[u16]) -> Result<Measurements, SensorError> {
    let [pm1, pm25, pm4, pm10, rh, t, voc, nox] = words else {
        return Err(SensorError::Read {
            detail: format!("expected 8 words, got {}", words.len()),
        });
    };

    Ok(Measurements {
        pm1_0: scale_unsigned(*pm1, 10.0),
        pm2_5: scale_unsigned(*pm25, 10.0),
        pm4_0: scale_unsigned(*pm4, 10.0),
        pm10_0: scale_unsigned(*pm10, 10.0),
        humidity: scale_signed(*rh, 100.0),
        temperature: scale_signed(*t, 200.0),
        voc_index: scale_signed(*voc, 10.0),
        nox_index: scale_signed(*nox, 10.0),
    })
}

/// ASCII serial number packed two characters per word, NUL-terminated.
fn serial_from_words(words: &[u16]) -> String {
    words
        .iter()
        .flat_map(|w| w.to_be_bytes())
        .take_while(|&b| b != 0)
        .map(char::from)
        .collect()
}

// ── Driver ──────────────────────────────────────────────────────────────────

/// SEN5x driver backed by `rppal::i2c`.
#[cfg(feature = "sen5x")]
pub struct Sen5x {
    i2c: I2c,
}

#[cfg(feature = "sen5x")]
impl Sen5x {
    /// Open I2C bus 1 and address the sensor at `addr`.
    pub fn new(addr: u16) -> anyhow::Result<Self> {
        let mut i2c = I2c::new()?;
        i2c.set_slave_address(addr)?;

        tracing::info!(addr = format_args!("0x{addr:02x}"), "sen5x initialised");

        Ok(Self { i2c })
    }

    fn send(&mut self, cmd: u16) -> Result<(), SensorError> {
        self.i2c
            .write(&cmd.to_be_bytes())
            .map(|_| ())
            .map_err(|e| SensorError::Write {
                detail: e.to_string(),
            })
    }

    fn read_words<const N: usize>(&mut self, cmd: u16) -> Result<Vec<u16>, SensorError> {
        self.send(cmd)?;
        thread::sleep(READ_WAIT);

        let mut buf = [0u8; N];
        self.i2c.read(&mut buf).map_err(|e| SensorError::Read {
            detail: e.to_string(),
        })?;
        decode_words(&buf)
    }
}

#[cfg(feature = "sen5x")]
impl SensorDriver for Sen5x {
    fn serial_number(&mut self) -> Result<String, SensorError> {
        let words = self.read_words::<SERIAL_NUMBER_LEN>(CMD_SERIAL_NUMBER)?;
        Ok(serial_from_words(&words))
    }

    fn start_measurement(&mut self) -> Result<(), SensorError> {
        self.send(CMD_START_MEASUREMENT)?;
        thread::sleep(START_MEASUREMENT_WAIT);
        Ok(())
    }

    fn read_measured_values(&mut self) -> Result<Measurements, SensorError> {
        let words = self.read_words::<MEASURED_VALUES_LEN>(CMD_READ_MEASURED_VALUES)?;
        measurements_from_words(&words)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    /// Encode words the way the sensor sends them.
    fn encode(words: &[u16]) -> Vec<u8> {
        words
            .iter()
            .flat_map(|w| {
                let [hi, lo] = w.to_be_bytes();
                [hi, lo, crc8(&[hi, lo])]
            })
            .collect()
    }

    // -- CRC ------------------------------------------------------------------

    #[test]
    fn crc8_datasheet_vector() {
        assert_eq!(crc8(&[0xBE, 0xEF]), 0x92);
    }

    #[test]
    fn crc8_matches_sensirion_zero_word() {
        // Datasheet table: 0x0000 -> 0x81.
        assert_eq!(crc8(&[0x00, 0x00]), 0x81);
    }

    #[test]
    fn decode_words_rejects_bad_crc() {
        let mut buf = encode(&[0x0102, 0x0304]);
        buf[5] ^= 0xFF;
        assert_eq!(decode_words(&buf), Err(SensorError::Crc { word: 1 }));
    }

    #[test]
    fn decode_words_accepts_valid_frame() {
        let buf = encode(&[0x0102, 0xFFFF]);
        assert_eq!(decode_words(&buf).unwrap(), vec![0x0102, 0xFFFF]);
    }

    // -- Scaling --------------------------------------------------------------

    #[test]
    fn measurements_are_scaled() {
        let words = [123, 250, 300, 400, 4550, 4300, 1000, 10];
        let m = measurements_from_words(&words).unwrap();
        assert!((m.pm1_0 - 12.3).abs() < 1e-4);
        assert!((m.pm2_5 - 25.0).abs() < 1e-4);
        assert!((m.humidity - 45.5).abs() < 1e-4);
        assert!((m.temperature - 21.5).abs() < 1e-4);
        assert!((m.voc_index - 100.0).abs() < 1e-4);
        assert!((m.nox_index - 1.0).abs() < 1e-4);
    }

    #[test]
    fn negative_temperature() {
        let words = [0, 0, 0, 0, 0, (-1000i16) as u16, 0, 0];
        let m = measurements_from_words(&words).unwrap();
        assert!((m.temperature + 5.0).abs() < 1e-4);
    }

    #[test]
    fn unavailable_markers_become_nan() {
        let words = [0xFFFF, 10, 10, 10, 0x7FFF, 0x7FFF, 0x7FFF, 0x7FFF];
        let m = measurements_from_words(&words).unwrap();
        assert!(m.pm1_0.is_nan());
        assert!(!m.pm2_5.is_nan());
        assert!(m.humidity.is_nan());
        assert!(m.temperature.is_nan());
        assert!(m.voc_index.is_nan());
        assert!(m.nox_index.is_nan());
    }

    #[test]
    fn short_response_is_read_error() {
        let err = measurements_from_words(&[1, 2, 3]).unwrap_err();
        assert_eq!(err.code(), 0x0200);
    }

    // -- Serial number --------------------------------------------------------

    #[test]
    fn serial_stops_at_nul() {
        let words = [
            u16::from_be_bytes(*b"A1"),
            u16::from_be_bytes(*b"B2"),
            u16::from_be_bytes([b'C', 0]),
            u16::from_be_bytes(*b"ZZ"),
        ];
        assert_eq!(serial_from_words(&words), "A1B2C");
    }

    #[test]
    fn serial_frame_round_trips_through_crc() {
        let mut words = vec![u16::from_be_bytes(*b"F0"), u16::from_be_bytes(*b"0D")];
        words.resize(16, 0);
        let buf = encode(&words);
        assert_eq!(buf.len(), SERIAL_NUMBER_LEN);
        assert_eq!(serial_from_words(&decode_words(&buf).unwrap()), "F00D");
    }
}
