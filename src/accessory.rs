//! The accessory: scan controller and sensor facade wired to one clock.

use crate::config::{Config, ConfigError, SensorSettings};
use crate::facade::{
    CharacteristicKind, CharacteristicUpdate, CharacteristicValue, GetError, SensorFacade,
    Service, ServiceKind,
};
use crate::reading::Millis;
use crate::scanner::{Central, CentralEvent, ScanController, ScanState};
use log::error;
use std::time::{SystemTime, UNIX_EPOCH};

/// Source of the current time.
pub trait Clock {
    fn now_millis(&self) -> Millis;
}

/// Wall-clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> Millis {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| Millis::try_from(d.as_millis()).unwrap_or(Millis::MAX))
            .unwrap_or(0)
    }
}

/// One environmental beacon exposed as bridge services.
///
/// All events and get requests go through `&mut self` / `&self` on a single
/// owner; see [`crate::app::run_with_io`] for the event loop.
#[derive(Debug)]
pub struct Accessory<C, K = SystemClock> {
    controller: ScanController<C>,
    facade: SensorFacade,
    clock: K,
}

impl<C: Central, K: Clock> Accessory<C, K> {
    /// Validate `config` and build the accessory.
    ///
    /// # Errors
    /// Configuration errors are logged and returned; the accessory does not start.
    pub fn new(config: &Config, central: C, clock: K) -> Result<Self, ConfigError> {
        let settings = config.validate().inspect_err(|e| error!("{e}"))?;
        Ok(Self::from_settings(&settings, central, clock))
    }

    pub fn from_settings(settings: &SensorSettings, central: C, clock: K) -> Self {
        Accessory {
            controller: ScanController::new(central, settings.device_name.clone()),
            facade: SensorFacade::new(settings),
            clock,
        }
    }

    /// Handle one event from the BLE backend.
    pub fn handle_event(&mut self, event: CentralEvent) -> Vec<CharacteristicUpdate> {
        let now_millis = self.clock.now_millis();
        self.controller
            .handle_event(event, now_millis, &mut self.facade)
    }

    /// Handle a get request from the bridge.
    pub fn get(
        &self,
        service: ServiceKind,
        characteristic: CharacteristicKind,
    ) -> Result<CharacteristicValue, GetError> {
        self.facade
            .get(service, characteristic, self.clock.now_millis())
    }

    pub fn services(&self) -> &[Service] {
        self.facade.services()
    }

    pub fn scan_state(&self) -> ScanState {
        self.controller.state()
    }

    pub fn facade(&self) -> &SensorFacade {
        &self.facade
    }

    pub fn controller(&self) -> &ScanController<C> {
        &self.controller
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facade::CharacteristicKind::*;
    use crate::facade::CharacteristicValue::{Bool, Float};
    use crate::facade::ServiceKind::*;
    use crate::freshness::StaleValue;
    use crate::scanner::{AdapterState, DiscoveredPeripheral};
    use crate::test_utils::{EXAMPLE_PAYLOAD, FakeCentral, ManualClock, TEST_DEVICE_NAME};
    use tokio_test::{assert_err, assert_ok};

    const WINDOW: Millis = 30 * 60 * 1000;

    fn accessory(clock: &ManualClock) -> Accessory<FakeCentral, ManualClock> {
        let config = Config::new("Living Room", TEST_DEVICE_NAME);
        Accessory::new(&config, FakeCentral::default(), clock.clone()).unwrap()
    }

    fn advertisement(name: &str) -> CentralEvent {
        CentralEvent::Discovered(DiscoveredPeripheral {
            local_name: Some(name.to_string()),
            manufacturer_data: Some(EXAMPLE_PAYLOAD.to_vec()),
        })
    }

    #[test]
    fn test_new_rejects_missing_fields() {
        let clock = ManualClock::default();
        let config = Config {
            device_name: Some(TEST_DEVICE_NAME.to_string()),
            ..Config::default()
        };
        let result = Accessory::new(&config, FakeCentral::default(), clock);
        assert_eq!(result.err(), Some(ConfigError::MissingName));
    }

    #[test]
    fn test_end_to_end_freshness() {
        let clock = ManualClock::default();
        let mut accessory = accessory(&clock);

        accessory.handle_event(CentralEvent::StateChanged(AdapterState::PoweredOn));
        assert_eq!(accessory.scan_state(), ScanState::Scanning);

        clock.set(0);
        let updates = accessory.handle_event(advertisement(TEST_DEVICE_NAME));
        assert_eq!(updates.len(), 8);

        clock.set(100);
        assert_eq!(accessory.get(TemperatureSensor, CurrentTemperature), Ok(Float(23.2)));
        assert_eq!(
            accessory.get(HumiditySensor, CurrentRelativeHumidity),
            Ok(Float(22.8))
        );
        let level = assert_ok!(accessory.get(Battery, BatteryLevel));
        assert_eq!(level, Float((2964.0 - 1800.0) / 1400.0 * 100.0));
        assert_eq!(accessory.get(Battery, StatusLowBattery), Ok(Bool(false)));
        for service in [TemperatureSensor, HumiditySensor] {
            assert_eq!(accessory.get(service, StatusActive), Ok(Bool(true)));
            assert_eq!(accessory.get(service, StatusFault), Ok(Bool(false)));
        }

        clock.set(WINDOW + 1);
        assert_eq!(
            accessory.get(TemperatureSensor, CurrentTemperature),
            Err(GetError::Stale(StaleValue::Expired {
                age_millis: WINDOW + 1
            }))
        );
        assert_err!(accessory.get(HumiditySensor, CurrentRelativeHumidity));
        assert_err!(accessory.get(Battery, BatteryLevel));
        for service in [TemperatureSensor, HumiditySensor] {
            assert_eq!(accessory.get(service, StatusActive), Ok(Bool(false)));
            assert_eq!(accessory.get(service, StatusFault), Ok(Bool(true)));
        }
    }

    #[test]
    fn test_new_advertisement_refreshes() {
        let clock = ManualClock::default();
        let mut accessory = accessory(&clock);

        accessory.handle_event(advertisement(TEST_DEVICE_NAME));
        clock.set(WINDOW);
        assert_err!(accessory.get(TemperatureSensor, CurrentTemperature));

        accessory.handle_event(advertisement(TEST_DEVICE_NAME));
        assert_ok!(accessory.get(TemperatureSensor, CurrentTemperature));
    }

    #[test]
    fn test_other_devices_never_recorded() {
        let clock = ManualClock::default();
        let mut accessory = accessory(&clock);

        let updates = accessory.handle_event(advertisement("someone-else"));
        assert!(updates.is_empty());
        assert!(accessory.facade().cache().latest().is_none());
        assert_eq!(
            accessory.get(TemperatureSensor, CurrentTemperature),
            Err(GetError::Stale(StaleValue::NoReading))
        );
    }

    #[test]
    fn test_power_cycle() {
        let clock = ManualClock::default();
        let mut accessory = accessory(&clock);

        for state in [
            AdapterState::PoweredOn,
            AdapterState::PoweredOn,
            AdapterState::PoweredOff,
            AdapterState::PoweredOff,
            AdapterState::PoweredOn,
        ] {
            accessory.handle_event(CentralEvent::StateChanged(state));
        }

        let central = accessory.controller().central();
        assert_eq!(central.starts.len(), 2);
        assert_eq!(central.stops, 1);
        assert_eq!(accessory.scan_state(), ScanState::Scanning);
    }

    #[test]
    fn test_system_clock_is_after_epoch() {
        assert!(SystemClock.now_millis() > 0);
    }
}
