//! BLE scan lifecycle for the environmental beacon.
//!
//! This module provides a trait-based abstraction over different Bluetooth
//! backends ([`Central`]) and the [`ScanController`] state machine that starts
//! and stops passive discovery as the adapter is powered on and off, and
//! hands matching advertisements to the decoder.

#[cfg(feature = "bluer")]
pub mod bluer;

#[cfg(feature = "hci")]
pub mod hci;

use crate::decoder;
use crate::facade::{CharacteristicUpdate, SensorFacade};
use crate::reading::Millis;
use log::{debug, error, info, warn};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// Channel buffer size for central events.
pub const EVENT_CHANNEL_BUFFER_SIZE: usize = 100;

/// How long a backend waits before re-announcing the adapter state after a
/// scan failed.
pub const SCAN_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Error type for scanner operations.
#[derive(Error, Debug)]
pub enum ScanError {
    /// Bluetooth/adapter related error
    #[error("Bluetooth error: {0}")]
    Bluetooth(String),
}

/// Power state reported by the Bluetooth adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterState {
    PoweredOn,
    PoweredOff,
    /// Any other state (resetting, unauthorized, unsupported, ...)
    Other(String),
}

impl From<&str> for AdapterState {
    fn from(state: &str) -> Self {
        match state {
            "poweredOn" => AdapterState::PoweredOn,
            "poweredOff" => AdapterState::PoweredOff,
            other => AdapterState::Other(other.to_string()),
        }
    }
}

impl fmt::Display for AdapterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdapterState::PoweredOn => write!(f, "poweredOn"),
            AdapterState::PoweredOff => write!(f, "poweredOff"),
            AdapterState::Other(state) => write!(f, "{state}"),
        }
    }
}

/// Advertisement data of a discovered peripheral.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveredPeripheral {
    pub local_name: Option<String>,
    /// Manufacturer data, starting with the little-endian company identifier
    pub manufacturer_data: Option<Vec<u8>>,
}

/// Events delivered by a BLE backend, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CentralEvent {
    StateChanged(AdapterState),
    Discovered(DiscoveredPeripheral),
    /// A running scan ended on its own; the reason is for logging only
    ScanFailed(String),
}

/// Report a scan that died after `start_scanning` returned, then announce the
/// adapter state again after `delay` so the controller restarts discovery.
///
/// `current_state` is awaited after the delay; `None` skips the announcement.
#[cfg(any(feature = "bluer", feature = "hci"))]
pub(crate) async fn report_scan_failure<F>(
    events: &mpsc::Sender<CentralEvent>,
    reason: String,
    delay: Duration,
    current_state: F,
) where
    F: Future<Output = Option<AdapterState>>,
{
    if events.send(CentralEvent::ScanFailed(reason)).await.is_err() {
        return;
    }

    tokio::time::sleep(delay).await;

    if let Some(state) = current_state.await {
        let _ = events.send(CentralEvent::StateChanged(state)).await;
    }
}

/// Discovery parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanFilter {
    /// Only report peripherals advertising one of these services; empty for all
    pub service_uuids: Vec<String>,
    /// Report every advertisement, not just the first one per peripheral
    pub allow_duplicates: bool,
}

/// Narrow capability over the BLE stack's scanning session.
///
/// Backends deliver [`CentralEvent`]s on the channel they were opened with.
pub trait Central {
    fn start_scanning(&mut self, filter: &ScanFilter) -> Result<(), ScanError>;
    fn stop_scanning(&mut self) -> Result<(), ScanError>;
}

impl<C: Central + ?Sized> Central for Box<C> {
    fn start_scanning(&mut self, filter: &ScanFilter) -> Result<(), ScanError> {
        (**self).start_scanning(filter)
    }

    fn stop_scanning(&mut self) -> Result<(), ScanError> {
        (**self).stop_scanning()
    }
}

/// Scan lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanState {
    #[default]
    Idle,
    Scanning,
}

/// Drives discovery from adapter power state and filters advertisements by
/// the configured device name.
#[derive(Debug)]
pub struct ScanController<C> {
    central: C,
    device_name: String,
    state: ScanState,
    // Set once stop was accepted, cleared by the next start
    stopped: bool,
}

impl<C: Central> ScanController<C> {
    pub fn new(central: C, device_name: impl Into<String>) -> Self {
        ScanController {
            central,
            device_name: device_name.into(),
            state: ScanState::Idle,
            stopped: false,
        }
    }

    pub fn state(&self) -> ScanState {
        self.state
    }

    pub fn central(&self) -> &C {
        &self.central
    }

    /// Handle one central event.
    ///
    /// Returns the characteristic updates pushed to `facade`, if any.
    pub fn handle_event(
        &mut self,
        event: CentralEvent,
        now_millis: Millis,
        facade: &mut SensorFacade,
    ) -> Vec<CharacteristicUpdate> {
        match event {
            CentralEvent::StateChanged(state) => {
                if let Err(e) = self.on_state_change(&state) {
                    error!("{e}");
                }
                Vec::new()
            }
            CentralEvent::Discovered(peripheral) => {
                self.on_discover(&peripheral, now_millis, facade)
            }
            CentralEvent::ScanFailed(reason) => {
                self.on_scan_failed(&reason);
                Vec::new()
            }
        }
    }

    /// Start scanning when the adapter powers on, stop on anything else.
    ///
    /// The state only changes once the central accepted the command, so a
    /// failed transition is retried on the next adapter event. Stop is issued
    /// once per power-off streak, including from the initial state.
    pub fn on_state_change(&mut self, adapter_state: &AdapterState) -> Result<(), ScanError> {
        info!("Bluetooth state changed to: {adapter_state}");

        match (adapter_state, self.state) {
            (AdapterState::PoweredOn, ScanState::Idle) => {
                let filter = ScanFilter {
                    service_uuids: Vec::new(),
                    allow_duplicates: true,
                };
                self.central.start_scanning(&filter)?;
                self.state = ScanState::Scanning;
                self.stopped = false;
                info!("Scanning for {}", self.device_name);
            }
            (AdapterState::PoweredOn, ScanState::Scanning) => {}
            (_, _) if !self.stopped => {
                self.central.stop_scanning()?;
                self.state = ScanState::Idle;
                self.stopped = true;
                info!("Scanning stopped");
            }
            (_, _) => {}
        }

        Ok(())
    }

    /// The backend lost a running scan. Go back to `Idle` so the next
    /// `PoweredOn` starts discovery again.
    pub fn on_scan_failed(&mut self, reason: &str) {
        warn!("Scanning failed: {reason}");
        self.state = ScanState::Idle;
    }

    /// Decode and record the advertisement of the configured device.
    ///
    /// Other peripherals, advertisements without manufacturer data and
    /// malformed payloads are dropped.
    pub fn on_discover(
        &self,
        peripheral: &DiscoveredPeripheral,
        now_millis: Millis,
        facade: &mut SensorFacade,
    ) -> Vec<CharacteristicUpdate> {
        if peripheral.local_name.as_deref() != Some(self.device_name.as_str()) {
            return Vec::new();
        }

        let Some(data) = peripheral.manufacturer_data.as_deref() else {
            debug!("{}: no manufacturer data", self.device_name);
            return Vec::new();
        };

        match decoder::decode(data, now_millis) {
            Ok(reading) => facade.record(reading),
            Err(e) => {
                debug!("{}: {e}", self.device_name);
                Vec::new()
            }
        }
    }
}

/// Available scanner backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Backend {
    /// BlueZ D-Bus backend (requires bluetoothd daemon)
    #[cfg(feature = "bluer")]
    Bluer,
    /// Raw HCI socket backend (direct kernel access, no daemon required)
    #[cfg(feature = "hci")]
    Hci,
}

impl Default for Backend {
    fn default() -> Self {
        #[cfg(feature = "bluer")]
        return Backend::Bluer;
        #[cfg(all(feature = "hci", not(feature = "bluer")))]
        return Backend::Hci;
        #[cfg(not(any(feature = "bluer", feature = "hci")))]
        compile_error!("At least one backend feature must be enabled");
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            #[cfg(feature = "bluer")]
            Backend::Bluer => write!(f, "bluer"),
            #[cfg(feature = "hci")]
            Backend::Hci => write!(f, "hci"),
            #[cfg(not(any(feature = "bluer", feature = "hci")))]
            _ => unreachable!("Backend enum has no variants when no backend features are enabled"),
        }
    }
}

impl std::str::FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            #[cfg(feature = "bluer")]
            "bluer" | "bluez" => Ok(Backend::Bluer),
            #[cfg(feature = "hci")]
            "hci" | "raw" => Ok(Backend::Hci),
            _ => Err(format!("Unknown backend: {}", s)),
        }
    }
}

/// Open the specified backend.
///
/// Adapter state changes and discovered peripherals are sent on `events`.
/// The backend reports the adapter's current state right after opening.
pub async fn open(
    backend: Backend,
    events: mpsc::Sender<CentralEvent>,
) -> Result<Box<dyn Central + Send>, ScanError> {
    match backend {
        #[cfg(feature = "bluer")]
        Backend::Bluer => Ok(Box::new(bluer::BluerCentral::open(events).await?)),
        #[cfg(feature = "hci")]
        Backend::Hci => Ok(Box::new(hci::HciCentral::open(events).await?)),
    }
}
