//! Battery level model.
//!
//! The beacon reports its raw battery voltage. Level and low-battery state are
//! derived from the calibration bounds in [`Calibration`](crate::config::Calibration).

use crate::config::Calibration;

/// Linear battery level in percent, clamped to `[0, 100]`.
///
/// `min` must be strictly less than `max`; [`Calibration::new`] enforces this
/// before a [`BatteryModel`] can be built.
pub fn percent(voltage: u16, min: u16, max: u16) -> f64 {
    let span = f64::from(max) - f64::from(min);
    let level = (f64::from(voltage) - f64::from(min)) / span * 100.0;
    level.clamp(0.0, 100.0)
}

/// Whether `voltage` is strictly below the low-battery threshold.
pub fn is_low(voltage: u16, low_threshold: u16) -> bool {
    voltage < low_threshold
}

/// Battery level and low flag derived from one voltage sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatteryStatus {
    pub level_percent: f64,
    pub low: bool,
}

/// Battery model bound to validated calibration bounds.
#[derive(Debug, Clone, Copy)]
pub struct BatteryModel {
    min: u16,
    max: u16,
    low: u16,
}

impl BatteryModel {
    pub fn new(calibration: &Calibration) -> Self {
        Self {
            min: calibration.battery_voltage_min(),
            max: calibration.battery_voltage_max(),
            low: calibration.battery_voltage_low(),
        }
    }

    pub fn status(&self, voltage: u16) -> BatteryStatus {
        BatteryStatus {
            level_percent: percent(voltage, self.min, self.max),
            low: is_low(voltage, self.low),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::assert_close;

    const MIN: u16 = 1800;
    const MAX: u16 = 3200;

    #[test]
    fn test_percent_linear() {
        assert_close(percent(MIN, MIN, MAX), 0.0);
        assert_close(percent(MAX, MIN, MAX), 100.0);
        assert_close(percent(2500, MIN, MAX), 50.0);
    }

    #[test]
    fn test_percent_clamped() {
        assert_close(percent(MIN - 100, MIN, MAX), 0.0);
        assert_close(percent(MAX + 100, MIN, MAX), 100.0);
        assert_close(percent(0, MIN, MAX), 0.0);
        assert_close(percent(u16::MAX, MIN, MAX), 100.0);
    }

    #[test]
    fn test_percent_monotonic() {
        let mut previous = percent(0, MIN, MAX);
        for voltage in (0..=4000).step_by(7) {
            let current = percent(voltage, MIN, MAX);
            assert!(
                current >= previous,
                "percent({voltage}) = {current} dropped below {previous}"
            );
            previous = current;
        }
    }

    #[test]
    fn test_is_low_boundary() {
        assert!(!is_low(2000, 2000));
        assert!(is_low(1999, 2000));
        assert!(!is_low(2001, 2000));
    }

    #[test]
    fn test_model_status() {
        let calibration = Calibration::default();
        let model = BatteryModel::new(&calibration);

        let status = model.status(2964);
        assert_close(status.level_percent, (2964.0 - 1800.0) / 1400.0 * 100.0);
        assert!(!status.low);

        let status = model.status(1900);
        assert!(status.low);
    }
}
