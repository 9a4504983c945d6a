//! `ble-environmental-sensor` library.
//!
//! The binary (`src/main.rs`) is responsible for CLI parsing, logging setup and
//! process exit codes. The decode-and-freshness pipeline lives in
//! [`crate::decoder`], [`crate::freshness`] and [`crate::battery`]; the scan
//! lifecycle in [`crate::scanner`]; the services exposed to the bridge in
//! [`crate::facade`]. [`crate::app`] wires them into one event loop that can be
//! tested with an injected central and clock.

pub mod accessory;
pub mod app;
pub mod battery;
pub mod config;
pub mod decoder;
pub mod facade;
pub mod freshness;
pub mod reading;
pub mod scanner;

#[cfg(test)]
pub(crate) mod test_utils;

// Re-export commonly used types at the crate root
pub use accessory::{Accessory, Clock, SystemClock};
pub use config::{Calibration, Config, ConfigError, SensorSettings};
pub use decoder::{DecodeError, decode};
pub use facade::{
    CharacteristicKind, CharacteristicUpdate, CharacteristicValue, GetError, SensorFacade,
    ServiceKind,
};
pub use freshness::{FreshnessCache, StaleValue};
pub use reading::{Millis, Reading};
pub use scanner::{
    AdapterState, Backend, Central, CentralEvent, DiscoveredPeripheral, ScanController, ScanError,
    ScanFilter,
};
