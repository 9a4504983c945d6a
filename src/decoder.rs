//! Advertisement payload decoder.
//!
//! The beacon broadcasts its measurements in the manufacturer-specific data of
//! a BLE advertisement. The payload is a run of little-endian unsigned 16-bit
//! integers at fixed offsets:
//!
//! | offset | field | transform |
//! |--------|-------|-----------|
//! | 0 | company identifier | ignored |
//! | 2 | battery voltage (mV) | raw |
//! | 4 | temperature (°C) | raw / 100 |
//! | 6 | relative humidity (%) | raw / 100 |
//! | 8 | pressure (hPa) | (raw + 101325) / 100 |
//!
//! There is no checksum; the payload is trusted as received.

use crate::reading::{Millis, Reading};
use thiserror::Error;

/// Minimum manufacturer data length carrying every field.
pub const MIN_PAYLOAD_LEN: usize = 10;

const BATTERY_OFFSET: usize = 2;
const TEMPERATURE_OFFSET: usize = 4;
const HUMIDITY_OFFSET: usize = 6;
const PRESSURE_OFFSET: usize = 8;

/// Pressure is transmitted relative to this value, in Pascals.
const PRESSURE_BASE_PASCALS: f64 = 101_325.0;

/// Error types for decoding advertisement data.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Payload too short to hold every field
    #[error("Malformed payload: expected at least {MIN_PAYLOAD_LEN} bytes, got {len}")]
    MalformedPayload { len: usize },
}

/// Decode manufacturer data from the beacon into a [`Reading`].
///
/// # Arguments
/// * `data` - The manufacturer-specific data bytes, including the company ID prefix
/// * `observed_at_millis` - When the advertisement was received
///
/// # Errors
/// Returns [`DecodeError::MalformedPayload`] if `data` is shorter than
/// [`MIN_PAYLOAD_LEN`]. Trailing bytes are ignored.
pub fn decode(data: &[u8], observed_at_millis: Millis) -> Result<Reading, DecodeError> {
    if data.len() < MIN_PAYLOAD_LEN {
        return Err(DecodeError::MalformedPayload { len: data.len() });
    }

    Ok(Reading {
        battery_voltage_millivolts: read_u16_le(data, BATTERY_OFFSET),
        temperature_celsius: f64::from(read_u16_le(data, TEMPERATURE_OFFSET)) / 100.0,
        relative_humidity_percent: f64::from(read_u16_le(data, HUMIDITY_OFFSET)) / 100.0,
        pressure_hectopascals: (f64::from(read_u16_le(data, PRESSURE_OFFSET))
            + PRESSURE_BASE_PASCALS)
            / 100.0,
        observed_at_millis,
    })
}

#[inline]
fn read_u16_le(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}
