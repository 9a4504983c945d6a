use crate::accessory::Clock;
use crate::reading::{Millis, Reading};
use crate::scanner::{Central, ScanError, ScanFilter};
use std::cell::Cell;
use std::rc::Rc;

/// Example advertisement: 2964 mV, 23.20 °C, 22.80 %, 1076.89 hPa.
pub const EXAMPLE_PAYLOAD: [u8; 10] = [
    0x00, 0x00, // Company ID (ignored)
    0x94, 0x0B, // Battery: 2964 mV
    0x10, 0x09, // Temperature: 2320 -> 23.20 °C
    0xE8, 0x08, // Humidity: 2280 -> 22.80 %
    0xDC, 0x18, // Pressure: (6364 + 101325) / 100 -> 1076.89 hPa
];

/// Device name used by tests.
pub const TEST_DEVICE_NAME: &str = "environmental";

/// Build a `Reading` from arbitrary values.
///
/// Tests can override just the fields they care about.
pub fn reading_at(observed_at_millis: Millis) -> Reading {
    Reading {
        battery_voltage_millivolts: 2964,
        temperature_celsius: 23.2,
        relative_humidity_percent: 22.8,
        pressure_hectopascals: 1076.89,
        observed_at_millis,
    }
}

/// Assert two floats are equal within display precision.
pub fn assert_close(actual: f64, expected: f64) {
    assert!(
        (actual - expected).abs() < 1e-9,
        "expected {expected}, got {actual}"
    );
}

/// Central that records scan commands instead of touching a radio.
#[derive(Debug, Default)]
pub struct FakeCentral {
    pub starts: Vec<ScanFilter>,
    pub stops: usize,
    fail: bool,
}

impl FakeCentral {
    /// A central whose every command fails.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }
}

impl Central for FakeCentral {
    fn start_scanning(&mut self, filter: &ScanFilter) -> Result<(), ScanError> {
        if self.fail {
            return Err(ScanError::Bluetooth("adapter unavailable".to_string()));
        }
        self.starts.push(filter.clone());
        Ok(())
    }

    fn stop_scanning(&mut self) -> Result<(), ScanError> {
        if self.fail {
            return Err(ScanError::Bluetooth("adapter unavailable".to_string()));
        }
        self.stops += 1;
        Ok(())
    }
}

/// Clock the test advances by hand.
#[derive(Debug, Default, Clone)]
pub struct ManualClock(Rc<Cell<Millis>>);

impl ManualClock {
    pub fn set(&self, now_millis: Millis) {
        self.0.set(now_millis);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> Millis {
        self.0.get()
    }
}
