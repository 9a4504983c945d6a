//! BlueZ D-Bus backend.
//!
//! This backend uses the `bluer` crate to communicate with the BlueZ daemon
//! via D-Bus. It requires the `bluetoothd` daemon to be running.

use super::{
    AdapterState, Central, CentralEvent, DiscoveredPeripheral, SCAN_RETRY_DELAY, ScanError,
    ScanFilter, report_scan_failure,
};
use bluer::{
    Adapter, AdapterEvent, AdapterProperty, Address, DiscoveryFilter, DiscoveryTransport, Session,
    Uuid,
};
use futures::StreamExt;
use log::{debug, error, warn};
use std::collections::{HashMap, HashSet};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

impl From<bluer::Error> for ScanError {
    fn from(err: bluer::Error) -> Self {
        ScanError::Bluetooth(err.to_string())
    }
}

fn adapter_state(powered: bool) -> AdapterState {
    if powered {
        AdapterState::PoweredOn
    } else {
        AdapterState::PoweredOff
    }
}

/// Central backed by the default BlueZ adapter.
pub struct BluerCentral {
    // Keeps the D-Bus connection alive
    _session: Session,
    adapter: Adapter,
    events: mpsc::Sender<CentralEvent>,
    power_watch: JoinHandle<()>,
    discovery: Option<JoinHandle<()>>,
}

impl BluerCentral {
    /// Connect to BlueZ and start reporting the default adapter's power state.
    ///
    /// The current state is sent on `events` before this returns.
    pub async fn open(events: mpsc::Sender<CentralEvent>) -> Result<Self, ScanError> {
        let session = Session::new().await?;
        let adapter = session.default_adapter().await?;
        let adapter_events = adapter.events().await?;

        let powered = adapter.is_powered().await?;
        let _ = events
            .send(CentralEvent::StateChanged(adapter_state(powered)))
            .await;

        let tx = events.clone();
        let power_watch = tokio::spawn(async move {
            let mut adapter_events = Box::pin(adapter_events);
            while let Some(event) = adapter_events.next().await {
                if let AdapterEvent::PropertyChanged(AdapterProperty::Powered(powered)) = event
                    && tx
                        .send(CentralEvent::StateChanged(adapter_state(powered)))
                        .await
                        .is_err()
                {
                    break;
                }
            }
        });

        Ok(BluerCentral {
            _session: session,
            adapter,
            events,
            power_watch,
            discovery: None,
        })
    }
}

impl Central for BluerCentral {
    fn start_scanning(&mut self, filter: &ScanFilter) -> Result<(), ScanError> {
        let uuids = filter
            .service_uuids
            .iter()
            .map(|uuid| uuid.parse::<Uuid>())
            .collect::<Result<HashSet<_>, _>>()
            .map_err(|e| ScanError::Bluetooth(format!("Invalid service UUID: {e}")))?;

        let discovery_filter = DiscoveryFilter {
            uuids,
            transport: DiscoveryTransport::Le,
            duplicate_data: filter.allow_duplicates,
            ..Default::default()
        };

        let adapter = self.adapter.clone();
        let tx = self.events.clone();
        if let Some(previous) = self.discovery.replace(tokio::spawn(async move {
            if let Err(e) = discover(adapter.clone(), discovery_filter, tx.clone()).await {
                error!("Discovery failed: {e}");
                report_scan_failure(&tx, e.to_string(), SCAN_RETRY_DELAY, async {
                    adapter
                        .is_powered()
                        .await
                        .inspect_err(|e| warn!("Cannot read adapter power state: {e}"))
                        .ok()
                        .map(adapter_state)
                })
                .await;
            }
        })) {
            previous.abort();
        }

        Ok(())
    }

    fn stop_scanning(&mut self) -> Result<(), ScanError> {
        // Dropping the discovery stream ends the BlueZ discovery session. A
        // pending retry after a failed discovery is dropped with it.
        if let Some(discovery) = self.discovery.take() {
            discovery.abort();
        }
        Ok(())
    }
}

impl Drop for BluerCentral {
    fn drop(&mut self) {
        self.power_watch.abort();
        if let Some(discovery) = self.discovery.take() {
            discovery.abort();
        }
    }
}

/// Report every advertisement seen while discovery runs.
async fn discover(
    adapter: Adapter,
    filter: DiscoveryFilter,
    tx: mpsc::Sender<CentralEvent>,
) -> Result<(), ScanError> {
    adapter.set_discovery_filter(filter).await?;
    let mut discovery = Box::pin(adapter.discover_devices_with_changes().await?);

    while let Some(event) = discovery.next().await {
        let AdapterEvent::DeviceAdded(address) = event else {
            continue;
        };

        match peripheral(&adapter, address).await {
            Ok(peripheral) => {
                if tx.send(CentralEvent::Discovered(peripheral)).await.is_err() {
                    break;
                }
            }
            Err(e) => debug!("{address}: {e}"),
        }
    }

    Ok(())
}

async fn peripheral(
    adapter: &Adapter,
    address: Address,
) -> Result<DiscoveredPeripheral, ScanError> {
    let device = adapter.device(address)?;
    let local_name = device.name().await?;
    let manufacturer_data = device
        .manufacturer_data()
        .await?
        .and_then(with_company_id);

    Ok(DiscoveredPeripheral {
        local_name,
        manufacturer_data,
    })
}

/// Flatten BlueZ's per-company map into one buffer prefixed by the
/// little-endian company identifier, as it appears on air.
///
/// BlueZ keys manufacturer data by company; the lowest identifier wins when a
/// device advertises more than one.
fn with_company_id(manufacturer_data: HashMap<u16, Vec<u8>>) -> Option<Vec<u8>> {
    manufacturer_data
        .into_iter()
        .min_by_key(|(company_id, _)| *company_id)
        .map(|(company_id, data)| {
            let mut buffer = Vec::with_capacity(2 + data.len());
            buffer.extend_from_slice(&company_id.to_le_bytes());
            buffer.extend_from_slice(&data);
            buffer
        })
}
