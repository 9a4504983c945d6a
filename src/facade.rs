//! Services exposed to the home-automation bridge.
//!
//! The accessory publishes four services: accessory information, a
//! temperature sensor, a humidity sensor and a battery service. Every value
//! characteristic is backed by the [`FreshnessCache`]: a get request either
//! returns the derived value of a fresh reading or fails with [`StaleValue`].
//! Status characteristics mirror the same freshness predicate and never fail.
//!
//! New readings are also pushed into the services' cached characteristic
//! values, so the bridge stays in sync without waiting for a get request.

use crate::battery::BatteryModel;
use crate::config::SensorSettings;
use crate::freshness::{FreshnessCache, StaleValue};
use crate::reading::{Millis, Reading};
use log::{debug, info};
use std::fmt;
use thiserror::Error;

pub const INFORMATION_NAME: &str = "environmental";
pub const INFORMATION_MANUFACTURER: &str = "ble-environmental-sensor";
pub const INFORMATION_MODEL: &str = concat!("v", env!("CARGO_PKG_VERSION"));
pub const INFORMATION_SERIAL_NUMBER: &str = "0000000001";

/// Services exposed by the accessory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceKind {
    AccessoryInformation,
    TemperatureSensor,
    HumiditySensor,
    Battery,
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceKind::AccessoryInformation => write!(f, "accessory_information"),
            ServiceKind::TemperatureSensor => write!(f, "temperature_sensor"),
            ServiceKind::HumiditySensor => write!(f, "humidity_sensor"),
            ServiceKind::Battery => write!(f, "battery"),
        }
    }
}

/// Characteristics exposed by the services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CharacteristicKind {
    Name,
    Manufacturer,
    Model,
    SerialNumber,
    CurrentTemperature,
    CurrentRelativeHumidity,
    StatusActive,
    StatusFault,
    BatteryLevel,
    StatusLowBattery,
}

impl fmt::Display for CharacteristicKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CharacteristicKind::Name => "name",
            CharacteristicKind::Manufacturer => "manufacturer",
            CharacteristicKind::Model => "model",
            CharacteristicKind::SerialNumber => "serial_number",
            CharacteristicKind::CurrentTemperature => "current_temperature",
            CharacteristicKind::CurrentRelativeHumidity => "current_relative_humidity",
            CharacteristicKind::StatusActive => "status_active",
            CharacteristicKind::StatusFault => "status_fault",
            CharacteristicKind::BatteryLevel => "battery_level",
            CharacteristicKind::StatusLowBattery => "status_low_battery",
        };
        f.write_str(name)
    }
}

/// Typed characteristic value.
#[derive(Debug, Clone, PartialEq)]
pub enum CharacteristicValue {
    Float(f64),
    Bool(bool),
    String(String),
}

impl fmt::Display for CharacteristicValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CharacteristicValue::Float(num) => write!(f, "{num}"),
            CharacteristicValue::Bool(b) => write!(f, "{b}"),
            CharacteristicValue::String(s) => write!(f, "\"{s}\""),
        }
    }
}

/// Errors returned by get requests.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GetError {
    #[error(transparent)]
    Stale(#[from] StaleValue),
    #[error("Service {service} has no characteristic {characteristic}")]
    UnknownCharacteristic {
        service: ServiceKind,
        characteristic: CharacteristicKind,
    },
    /// The accessory task is no longer running
    #[error("Accessory is not running")]
    Closed,
}

/// A characteristic and the last value pushed to it.
#[derive(Debug, Clone, PartialEq)]
pub struct Characteristic {
    pub kind: CharacteristicKind,
    pub value: Option<CharacteristicValue>,
}

/// A named bundle of characteristics, as registered with the bridge.
#[derive(Debug, Clone, PartialEq)]
pub struct Service {
    pub kind: ServiceKind,
    pub name: String,
    pub characteristics: Vec<Characteristic>,
}

impl Service {
    fn new(kind: ServiceKind, name: &str, characteristics: &[CharacteristicKind]) -> Self {
        Service {
            kind,
            name: name.to_string(),
            characteristics: characteristics
                .iter()
                .map(|&kind| Characteristic { kind, value: None })
                .collect(),
        }
    }

    fn with_value(mut self, kind: CharacteristicKind, value: &str) -> Self {
        self.set(kind, CharacteristicValue::String(value.to_string()));
        self
    }

    /// Last value pushed to `kind`, if the service has it.
    pub fn value(&self, kind: CharacteristicKind) -> Option<&CharacteristicValue> {
        self.characteristics
            .iter()
            .find(|c| c.kind == kind)
            .and_then(|c| c.value.as_ref())
    }

    fn set(&mut self, kind: CharacteristicKind, value: CharacteristicValue) -> bool {
        match self.characteristics.iter_mut().find(|c| c.kind == kind) {
            Some(characteristic) => {
                characteristic.value = Some(value);
                true
            }
            None => false,
        }
    }
}

/// A value pushed to the bridge after a new reading.
#[derive(Debug, Clone, PartialEq)]
pub struct CharacteristicUpdate {
    pub service: ServiceKind,
    pub characteristic: CharacteristicKind,
    pub value: CharacteristicValue,
}

impl fmt::Display for CharacteristicUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}={}", self.service, self.characteristic, self.value)
    }
}

/// Publishing layer between the cached reading and the bridge.
#[derive(Debug)]
pub struct SensorFacade {
    services: Vec<Service>,
    cache: FreshnessCache,
    battery: BatteryModel,
}

impl SensorFacade {
    pub fn new(settings: &SensorSettings) -> Self {
        use CharacteristicKind::*;

        let information = Service::new(
            ServiceKind::AccessoryInformation,
            &settings.name,
            &[Name, Manufacturer, Model, SerialNumber],
        )
        .with_value(Name, INFORMATION_NAME)
        .with_value(Manufacturer, INFORMATION_MANUFACTURER)
        .with_value(Model, INFORMATION_MODEL)
        .with_value(SerialNumber, INFORMATION_SERIAL_NUMBER);

        let services = vec![
            information,
            Service::new(
                ServiceKind::TemperatureSensor,
                &settings.name,
                &[CurrentTemperature, StatusActive, StatusFault],
            ),
            Service::new(
                ServiceKind::HumiditySensor,
                &settings.name,
                &[CurrentRelativeHumidity, StatusActive, StatusFault],
            ),
            Service::new(
                ServiceKind::Battery,
                &settings.name,
                &[BatteryLevel, StatusLowBattery],
            ),
        ];

        SensorFacade {
            services,
            cache: FreshnessCache::new(settings.calibration.max_update_interval_millis()),
            battery: BatteryModel::new(&settings.calibration),
        }
    }

    /// Services to register with the bridge.
    pub fn services(&self) -> &[Service] {
        &self.services
    }

    pub fn service(&self, kind: ServiceKind) -> Option<&Service> {
        self.services.iter().find(|s| s.kind == kind)
    }

    pub fn cache(&self) -> &FreshnessCache {
        &self.cache
    }

    /// Store a new reading and push its values to the services.
    pub fn record(&mut self, reading: Reading) -> Vec<CharacteristicUpdate> {
        self.cache.record(reading);
        self.publish(&reading)
    }

    /// Push the values derived from `reading` into the cached characteristics.
    fn publish(&mut self, reading: &Reading) -> Vec<CharacteristicUpdate> {
        use CharacteristicKind::*;
        use CharacteristicValue::{Bool, Float};
        use ServiceKind::*;

        let battery = self.battery.status(reading.battery_voltage_millivolts);
        info!(
            "received: {}mV ({:.2}%, low:{}) {}°C {}% {}hPa",
            reading.battery_voltage_millivolts,
            battery.level_percent,
            battery.low,
            reading.temperature_celsius,
            reading.relative_humidity_percent,
            reading.pressure_hectopascals
        );

        let updates = [
            (TemperatureSensor, CurrentTemperature, Float(reading.temperature_celsius)),
            (TemperatureSensor, StatusActive, Bool(true)),
            (TemperatureSensor, StatusFault, Bool(false)),
            (HumiditySensor, CurrentRelativeHumidity, Float(reading.relative_humidity_percent)),
            (HumiditySensor, StatusActive, Bool(true)),
            (HumiditySensor, StatusFault, Bool(false)),
            (Battery, BatteryLevel, Float(battery.level_percent)),
            (Battery, StatusLowBattery, Bool(battery.low)),
        ];

        updates
            .into_iter()
            .filter_map(|(service, characteristic, value)| {
                let pushed = self
                    .services
                    .iter_mut()
                    .find(|s| s.kind == service)
                    .is_some_and(|s| s.set(characteristic, value.clone()));
                pushed.then_some(CharacteristicUpdate {
                    service,
                    characteristic,
                    value,
                })
            })
            .collect()
    }

    /// Handle a get request from the bridge.
    ///
    /// # Errors
    /// [`GetError::Stale`] when a value characteristic is requested while the
    /// reading is missing or stale; [`GetError::UnknownCharacteristic`] when
    /// the service does not expose `characteristic`.
    pub fn get(
        &self,
        service: ServiceKind,
        characteristic: CharacteristicKind,
        now_millis: Millis,
    ) -> Result<CharacteristicValue, GetError> {
        use CharacteristicKind::*;
        use CharacteristicValue::{Bool, Float};
        use ServiceKind::*;

        let value = match (service, characteristic) {
            (AccessoryInformation, Name | Manufacturer | Model | SerialNumber) => self
                .service(AccessoryInformation)
                .and_then(|s| s.value(characteristic))
                .cloned()
                .ok_or(GetError::UnknownCharacteristic {
                    service,
                    characteristic,
                })?,
            (TemperatureSensor, CurrentTemperature) => {
                Float(self.fresh(now_millis)?.temperature_celsius)
            }
            (HumiditySensor, CurrentRelativeHumidity) => {
                Float(self.fresh(now_millis)?.relative_humidity_percent)
            }
            (TemperatureSensor | HumiditySensor, StatusActive) => {
                Bool(self.cache.is_active(now_millis))
            }
            (TemperatureSensor | HumiditySensor, StatusFault) => {
                Bool(!self.cache.is_active(now_millis))
            }
            (Battery, BatteryLevel) => {
                let voltage = self.fresh(now_millis)?.battery_voltage_millivolts;
                Float(self.battery.status(voltage).level_percent)
            }
            (Battery, StatusLowBattery) => {
                let voltage = self.fresh(now_millis)?.battery_voltage_millivolts;
                Bool(self.battery.status(voltage).low)
            }
            _ => {
                return Err(GetError::UnknownCharacteristic {
                    service,
                    characteristic,
                });
            }
        };

        Ok(value)
    }

    fn fresh(&self, now_millis: Millis) -> Result<&Reading, StaleValue> {
        self.cache.get(now_millis).inspect_err(|e| debug!("{e}"))
    }
}
