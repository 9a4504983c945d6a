//! Core application runner for `ble-environmental-sensor`.
//!
//! This module is intentionally decoupled from CLI parsing and process exit codes
//! so it can be tested deterministically. One task owns the [`Accessory`] and
//! handles backend events and bridge get requests strictly one at a time.

use crate::accessory::{Accessory, Clock};
use crate::config::{Config, ConfigError};
use crate::facade::{CharacteristicKind, CharacteristicValue, GetError, ServiceKind};
use crate::scanner::{Backend, Central, CentralEvent, ScanError};
use clap::Parser;
use std::io;
use std::io::Write;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Channel buffer size for bridge get requests.
pub const REQUEST_CHANNEL_BUFFER_SIZE: usize = 16;

/// Backend events handled in a row before a waiting get request is answered.
pub const EVENT_BURST_LIMIT: usize = 32;

/// Command-line options.
#[derive(Parser, Debug, Clone)]
#[command(author, about, version)]
pub struct Options {
    #[command(flatten)]
    pub sensor: Config,

    /// Verbose output, log dropped advertisements and stale reads
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,

    /// Bluetooth scanner backend to use
    #[arg(long, default_value_t, value_enum)]
    pub backend: Backend,
}

/// Errors returned by the core run loop.
#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Scan(#[from] ScanError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A get request from the bridge, answered on `reply`.
#[derive(Debug)]
pub struct GetRequest {
    pub service: ServiceKind,
    pub characteristic: CharacteristicKind,
    pub reply: oneshot::Sender<Result<CharacteristicValue, GetError>>,
}

/// Cloneable handle the bridge uses to query a running accessory.
#[derive(Debug, Clone)]
pub struct AccessoryHandle {
    requests: mpsc::Sender<GetRequest>,
}

impl AccessoryHandle {
    /// Create a handle and the receiving end to pass to [`run_with_io`].
    pub fn channel() -> (Self, mpsc::Receiver<GetRequest>) {
        let (requests, rx) = mpsc::channel(REQUEST_CHANNEL_BUFFER_SIZE);
        (AccessoryHandle { requests }, rx)
    }

    /// Read a characteristic. Never waits for a new advertisement.
    pub async fn get(
        &self,
        service: ServiceKind,
        characteristic: CharacteristicKind,
    ) -> Result<CharacteristicValue, GetError> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(GetRequest {
                service,
                characteristic,
                reply,
            })
            .await
            .map_err(|_| GetError::Closed)?;
        response.await.map_err(|_| GetError::Closed)?
    }
}

/// Run the accessory until the backend's event channel closes.
///
/// - Backend events take priority over get requests, so a get never sees a
///   state older than an event that was already queued. Every characteristic
///   update an event pushes is written as one line to `out`.
/// - A waiting get request is answered after at most [`EVENT_BURST_LIMIT`]
///   events in a row, so a flood of advertisements cannot starve the bridge.
/// - Get requests are answered from the current cache without waiting.
pub async fn run_with_io<C: Central, K: Clock>(
    mut accessory: Accessory<C, K>,
    mut events: mpsc::Receiver<CentralEvent>,
    mut requests: mpsc::Receiver<GetRequest>,
    out: &mut dyn Write,
) -> Result<(), RunError> {
    let mut burst = 0;

    loop {
        if burst >= EVENT_BURST_LIMIT {
            burst = 0;
            if let Ok(request) = requests.try_recv() {
                answer(&accessory, request);
                continue;
            }
        }

        tokio::select! {
            biased;

            event = events.recv() => {
                let Some(event) = event else { break };
                burst += 1;
                for update in accessory.handle_event(event) {
                    writeln!(out, "{update}")?;
                }
            }
            Some(request) = requests.recv() => {
                burst = 0;
                answer(&accessory, request);
            }
        }
    }

    Ok(())
}

fn answer<C: Central, K: Clock>(accessory: &Accessory<C, K>, request: GetRequest) {
    let response = accessory.get(request.service, request.characteristic);
    // The requester may have given up; nothing to do then.
    let _ = request.reply.send(response);
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

    fn accessory(clock: &ManualClock) -> Accessory<FakeCentral, ManualClock> {
        let config = Config::new("Living Room", TEST_DEVICE_NAME);
        Accessory::new(&config, FakeCentral::default(), clock.clone()).unwrap()
    }

    fn advertisement(name: &str, data: &[u8]) -> CentralEvent {
        CentralEvent::Discovered(DiscoveredPeripheral {
            local_name: Some(name.to_string()),
            manufacturer_data: Some(data.to_vec()),
        })
    }

    #[tokio::test]
    async fn run_writes_updates_to_out() {
        let clock = ManualClock::default();
        let (tx, events) = mpsc::channel(8);
        let (_handle, requests) = AccessoryHandle::channel();

        tx.send(CentralEvent::StateChanged(AdapterState::PoweredOn))
            .await
            .unwrap();
        tx.send(advertisement(TEST_DEVICE_NAME, &EXAMPLE_PAYLOAD))
            .await
            .unwrap();
        tx.send(advertisement("other", &EXAMPLE_PAYLOAD)).await.unwrap();
        tx.send(advertisement(TEST_DEVICE_NAME, &[0x01])).await.unwrap();
        drop(tx);

        let mut out = Vec::<u8>::new();
        run_with_io(accessory(&clock), events, requests, &mut out)
            .await
            .unwrap();

        let out = String::from_utf8(out).unwrap();
        assert_eq!(out.lines().count(), 8);
        assert!(out.contains("temperature_sensor.current_temperature=23.2\n"));
        assert!(out.contains("humidity_sensor.current_relative_humidity=22.8\n"));
        assert!(out.contains("battery.status_low_battery=false\n"));
        assert!(out.ends_with('\n'));
    }

    #[tokio::test]
    async fn run_answers_get_requests() {
        let clock = ManualClock::default();
        let (tx, events) = mpsc::channel(8);
        let (handle, requests) = AccessoryHandle::channel();
        let mut out = Vec::<u8>::new();

        let client = async {
            assert_eq!(
                handle.get(TemperatureSensor, CurrentTemperature).await,
                Err(GetError::Stale(StaleValue::NoReading))
            );

            tx.send(advertisement(TEST_DEVICE_NAME, &EXAMPLE_PAYLOAD))
                .await
                .unwrap();
            // Handled before this request, at t=0.
            assert_eq!(handle.get(TemperatureSensor, StatusActive).await, Ok(Bool(true)));

            clock.set(100);
            assert_eq!(
                handle.get(TemperatureSensor, CurrentTemperature).await,
                Ok(Float(23.2))
            );
            assert_eq!(handle.get(HumiditySensor, StatusFault).await, Ok(Bool(false)));

            clock.set(30 * 60 * 1000 + 1);
            assert!(handle.get(HumiditySensor, CurrentRelativeHumidity).await.is_err());
            assert_eq!(handle.get(HumiditySensor, StatusFault).await, Ok(Bool(true)));

            drop(tx);
        };

        let (result, ()) = tokio::join!(
            run_with_io(accessory(&clock), events, requests, &mut out),
            client
        );
        result.unwrap();
    }

    /// Queue a get request directly, without waiting for its answer.
    fn queue_get(
        handle: &AccessoryHandle,
        service: ServiceKind,
        characteristic: CharacteristicKind,
    ) -> oneshot::Receiver<Result<CharacteristicValue, GetError>> {
        let (reply, response) = oneshot::channel();
        handle
            .requests
            .try_send(GetRequest {
                service,
                characteristic,
                reply,
            })
            .unwrap();
        response
    }

    #[tokio::test]
    async fn run_handles_queued_events_before_requests() {
        let clock = ManualClock::default();
        let (tx, events) = mpsc::channel(8);
        let (handle, requests) = AccessoryHandle::channel();
        let mut out = Vec::<u8>::new();

        let response = queue_get(&handle, TemperatureSensor, StatusActive);
        tx.send(advertisement(TEST_DEVICE_NAME, &EXAMPLE_PAYLOAD))
            .await
            .unwrap();

        let client = async {
            let value = response.await.unwrap();
            drop(tx);
            value
        };

        let (result, value) = tokio::join!(
            run_with_io(accessory(&clock), events, requests, &mut out),
            client
        );
        result.unwrap();
        assert_eq!(value, Ok(Bool(true)));
    }

    #[tokio::test]
    async fn run_answers_requests_during_event_flood() {
        let clock = ManualClock::default();
        let (tx, events) = mpsc::channel(EVENT_BURST_LIMIT + 1);
        let (handle, requests) = AccessoryHandle::channel();
        let mut out = Vec::<u8>::new();

        for i in 0..EVENT_BURST_LIMIT {
            tx.send(advertisement(&format!("neighbour-{i}"), &EXAMPLE_PAYLOAD))
                .await
                .unwrap();
        }
        tx.send(advertisement(TEST_DEVICE_NAME, &EXAMPLE_PAYLOAD))
            .await
            .unwrap();
        let response = queue_get(&handle, TemperatureSensor, StatusActive);

        let client = async {
            let value = response.await.unwrap();
            drop(tx);
            value
        };

        let (result, value) = tokio::join!(
            run_with_io(accessory(&clock), events, requests, &mut out),
            client
        );
        result.unwrap();
        // Answered after the burst, before the matching advertisement
        assert_eq!(value, Ok(Bool(false)));
    }

    #[tokio::test]
    async fn handle_reports_closed_accessory() {
        let (handle, requests) = AccessoryHandle::channel();
        drop(requests);

        assert_eq!(
            handle.get(TemperatureSensor, CurrentTemperature).await,
            Err(GetError::Closed)
        );
    }

    #[test]
    fn options_parse_defaults() {
        let options = Options::try_parse_from([
            "ble-environmental-sensor",
            "--name",
            "Living Room",
            "--device-name",
            "env",
        ])
        .unwrap();
        assert_eq!(options.sensor, Config::new("Living Room", "env"));
        assert!(!options.verbose);
        assert_eq!(options.backend, Backend::default());
    }

    #[test]
    fn options_parse_calibration() {
        let options = Options::try_parse_from([
            "ble-environmental-sensor",
            "--name",
            "Attic",
            "--device-name",
            "attic-beacon",
            "--battery-voltage-min",
            "2000",
            "--battery-voltage-max",
            "3000",
            "--battery-voltage-low",
            "2100",
            "--max-update-interval",
            "10m",
            "--backend",
            "hci",
        ])
        .unwrap();

        let calibration = options.sensor.validate().unwrap().calibration;
        assert_eq!(calibration.battery_voltage_min(), 2000);
        assert_eq!(calibration.battery_voltage_max(), 3000);
        assert_eq!(calibration.battery_voltage_low(), 2100);
        assert_eq!(calibration.max_update_interval_millis(), 600_000);
        assert_eq!(options.backend, Backend::Hci);
    }

    #[test]
    fn options_missing_name_fails_validation() {
        let options =
            Options::try_parse_from(["ble-environmental-sensor", "--device-name", "env"]).unwrap();
        assert_eq!(options.sensor.validate(), Err(ConfigError::MissingName));
    }
}
