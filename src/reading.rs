//! Decoded beacon reading.

/// Milliseconds since the Unix epoch.
pub type Millis = i64;

/// A single decoded advertisement from the environmental beacon.
///
/// Values are kept in the units the beacon reports them in:
/// - Battery voltage in millivolts
/// - Temperature in Celsius
/// - Relative humidity in percent (0-100)
/// - Pressure in hectopascals
///
/// A new reading always replaces the previous one as a whole.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    /// Battery voltage in millivolts
    pub battery_voltage_millivolts: u16,
    /// Temperature in Celsius
    pub temperature_celsius: f64,
    /// Relative humidity in percent
    pub relative_humidity_percent: f64,
    /// Atmospheric pressure in hectopascals
    pub pressure_hectopascals: f64,
    /// When the advertisement was received
    pub observed_at_millis: Millis,
}

impl Reading {
    /// Age of this reading at `now_millis`. Never negative.
    pub fn age_millis(&self, now_millis: Millis) -> Millis {
        now_millis.saturating_sub(self.observed_at_millis).max(0)
    }
}
