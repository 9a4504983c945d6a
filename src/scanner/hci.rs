//! Raw HCI socket backend.
//!
//! This backend uses raw Linux HCI sockets to scan for BLE advertisements
//! without requiring the BlueZ daemon. It requires CAP_NET_RAW and
//! CAP_NET_ADMIN capabilities or root privileges.

use super::{
    AdapterState, Central, CentralEvent, DiscoveredPeripheral, SCAN_RETRY_DELAY, ScanError,
    ScanFilter, report_scan_failure,
};
use libc::{
    AF_BLUETOOTH, SOCK_CLOEXEC, SOCK_NONBLOCK, SOCK_RAW, c_int, c_void, sockaddr, socklen_t,
};
use log::{debug, warn};
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

// HCI protocol constants
const BTPROTO_HCI: c_int = 1;
const SOL_HCI: c_int = 0;
const HCI_FILTER: c_int = 2;
const HCI_CHANNEL_RAW: u16 = 0;
const HCI_DEV: u16 = 0;

// HCI packet types
const HCI_COMMAND_PKT: u8 = 0x01;
const HCI_EVENT_PKT: u8 = 0x04;

// HCI events
const EVT_LE_META_EVENT: u8 = 0x3E;
const EVT_LE_ADVERTISING_REPORT: u8 = 0x02;

// LE controller commands
const OGF_LE_CTL: u16 = 0x08;
const OCF_LE_SET_SCAN_PARAMETERS: u16 = 0x000B;
const OCF_LE_SET_SCAN_ENABLE: u16 = 0x000C;

const LE_SCAN_PASSIVE: u8 = 0x00;
const LE_PUBLIC_ADDRESS: u8 = 0x00;
const FILTER_POLICY_ACCEPT_ALL: u8 = 0x00;
// 10ms in 0.625ms units
const SCAN_INTERVAL: u16 = 0x0010;
const SCAN_WINDOW: u16 = 0x0010;

// AD types
const AD_TYPE_SHORT_LOCAL_NAME: u8 = 0x08;
const AD_TYPE_COMPLETE_LOCAL_NAME: u8 = 0x09;
const AD_TYPE_MANUFACTURER_DATA: u8 = 0xFF;

// Max HCI event size
const EVENT_BUFFER_SIZE: usize = 258;

#[repr(C)]
struct SockaddrHci {
    hci_family: u16,
    hci_dev: u16,
    hci_channel: u16,
}

/// Socket filter selecting which packets the kernel delivers.
#[repr(C)]
#[derive(Debug, Default)]
struct HciFilter {
    type_mask: u32,
    event_mask: [u32; 2],
    opcode: u16,
}

impl HciFilter {
    fn le_meta_events() -> Self {
        let mut filter = HciFilter::default();
        filter.type_mask |= 1 << HCI_EVENT_PKT;
        let bit = EVT_LE_META_EVENT as usize;
        filter.event_mask[bit / 32] |= 1 << (bit % 32);
        filter
    }
}

fn last_error(context: &str) -> ScanError {
    ScanError::Bluetooth(format!("{context}: {}", io::Error::last_os_error()))
}

/// Open a non-blocking raw HCI socket bound to `dev_id`.
fn open_socket(dev_id: u16) -> Result<OwnedFd, ScanError> {
    // SAFETY: plain socket(2) call; the result is checked before use.
    let fd = unsafe {
        libc::socket(
            AF_BLUETOOTH,
            SOCK_RAW | SOCK_CLOEXEC | SOCK_NONBLOCK,
            BTPROTO_HCI,
        )
    };
    if fd < 0 {
        return Err(last_error("Failed to create HCI socket"));
    }
    // SAFETY: fd is a freshly created descriptor owned by nobody else.
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };

    let addr = SockaddrHci {
        hci_family: AF_BLUETOOTH as u16,
        hci_dev: dev_id,
        hci_channel: HCI_CHANNEL_RAW,
    };
    // SAFETY: addr outlives the call and the length matches its layout.
    let ret = unsafe {
        libc::bind(
            fd.as_raw_fd(),
            &addr as *const SockaddrHci as *const sockaddr,
            mem::size_of::<SockaddrHci>() as socklen_t,
        )
    };
    if ret < 0 {
        return Err(last_error("Failed to bind HCI socket"));
    }

    Ok(fd)
}

fn set_filter(fd: &OwnedFd, filter: &HciFilter) -> Result<(), ScanError> {
    // SAFETY: filter outlives the call and the length matches its layout.
    let ret = unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            SOL_HCI,
            HCI_FILTER,
            filter as *const HciFilter as *const c_void,
            mem::size_of::<HciFilter>() as socklen_t,
        )
    };
    if ret < 0 {
        return Err(last_error("Failed to set HCI filter"));
    }
    Ok(())
}

/// Build an HCI command packet.
fn command_packet(ogf: u16, ocf: u16, params: &[u8]) -> Vec<u8> {
    let opcode = (ogf << 10) | ocf;
    let mut packet = Vec::with_capacity(4 + params.len());
    packet.push(HCI_COMMAND_PKT);
    packet.extend_from_slice(&opcode.to_le_bytes());
    packet.push(params.len() as u8);
    packet.extend_from_slice(params);
    packet
}

fn scan_parameters_packet() -> Vec<u8> {
    let mut params = Vec::with_capacity(7);
    params.push(LE_SCAN_PASSIVE);
    params.extend_from_slice(&SCAN_INTERVAL.to_le_bytes());
    params.extend_from_slice(&SCAN_WINDOW.to_le_bytes());
    params.push(LE_PUBLIC_ADDRESS);
    params.push(FILTER_POLICY_ACCEPT_ALL);
    command_packet(OGF_LE_CTL, OCF_LE_SET_SCAN_PARAMETERS, &params)
}

fn scan_enable_packet(enable: bool, filter_duplicates: bool) -> Vec<u8> {
    command_packet(
        OGF_LE_CTL,
        OCF_LE_SET_SCAN_ENABLE,
        &[u8::from(enable), u8::from(filter_duplicates)],
    )
}

fn send_command(fd: &OwnedFd, packet: &[u8]) -> Result<(), ScanError> {
    // SAFETY: packet is a valid buffer of packet.len() bytes.
    let ret = unsafe {
        libc::write(
            fd.as_raw_fd(),
            packet.as_ptr() as *const c_void,
            packet.len(),
        )
    };
    if ret < 0 {
        return Err(last_error("Failed to send HCI command"));
    }
    Ok(())
}

/// Extract the local name and manufacturer data from an HCI LE advertising
/// report event.
///
/// Only the first report in the event is read. Manufacturer data keeps its
/// leading company identifier.
fn parse_advertising_report(packet: &[u8]) -> Option<DiscoveredPeripheral> {
    // packet type, event code, parameter length, subevent
    let (header, report) = packet.split_at_checked(4)?;
    if header[0] != HCI_EVENT_PKT
        || header[1] != EVT_LE_META_EVENT
        || header[3] != EVT_LE_ADVERTISING_REPORT
    {
        return None;
    }

    // num_reports(1) event_type(1) addr_type(1) addr(6) data_len(1)
    if *report.first()? == 0 {
        return None;
    }
    let data_len = *report.get(9)? as usize;
    let ad_data = report.get(10..10 + data_len)?;

    let mut peripheral = DiscoveredPeripheral::default();
    let mut offset = 0;
    while offset + 2 <= ad_data.len() {
        let len = ad_data[offset] as usize;
        if len == 0 || offset + 1 + len > ad_data.len() {
            break;
        }

        let value = &ad_data[offset + 2..offset + 1 + len];
        match ad_data[offset + 1] {
            AD_TYPE_COMPLETE_LOCAL_NAME => {
                peripheral.local_name = Some(String::from_utf8_lossy(value).into_owned());
            }
            AD_TYPE_SHORT_LOCAL_NAME if peripheral.local_name.is_none() => {
                peripheral.local_name = Some(String::from_utf8_lossy(value).into_owned());
            }
            AD_TYPE_MANUFACTURER_DATA if peripheral.manufacturer_data.is_none() => {
                peripheral.manufacturer_data = Some(value.to_vec());
            }
            _ => {}
        }

        offset += 1 + len;
    }

    if peripheral.local_name.is_none() && peripheral.manufacturer_data.is_none() {
        return None;
    }
    Some(peripheral)
}

/// Central backed by the first HCI device (hci0).
pub struct HciCentral {
    cmd_fd: OwnedFd,
    events: mpsc::Sender<CentralEvent>,
    reader: JoinHandle<()>,
    retry: Option<JoinHandle<()>>,
}

impl HciCentral {
    /// Open hci0 and start forwarding advertising reports.
    ///
    /// A raw socket has no power notifications: the adapter counts as powered
    /// on once the sockets are bound, and as powered off when reading fails.
    pub async fn open(events: mpsc::Sender<CentralEvent>) -> Result<Self, ScanError> {
        let event_fd = open_socket(HCI_DEV)?;
        set_filter(&event_fd, &HciFilter::le_meta_events())?;
        let cmd_fd = open_socket(HCI_DEV)?;

        let async_fd = AsyncFd::new(event_fd)
            .map_err(|e| ScanError::Bluetooth(format!("Failed to create async fd: {e}")))?;

        let _ = events
            .send(CentralEvent::StateChanged(AdapterState::PoweredOn))
            .await;

        let tx = events.clone();
        let reader = tokio::spawn(async move {
            if let Err(e) = read_reports(&async_fd, &tx).await {
                warn!("HCI read failed: {e}");
                let _ = tx
                    .send(CentralEvent::StateChanged(AdapterState::PoweredOff))
                    .await;
            }
        });

        Ok(HciCentral {
            cmd_fd,
            events,
            reader,
            retry: None,
        })
    }

    fn enable_scan(&self, filter_duplicates: bool) -> Result<(), ScanError> {
        send_command(&self.cmd_fd, &scan_parameters_packet())?;
        send_command(&self.cmd_fd, &scan_enable_packet(true, filter_duplicates))
    }

    /// The controller stays idle after a rejected command; announce the
    /// adapter again later so it retries.
    fn schedule_retry(&mut self, reason: String) {
        let tx = self.events.clone();
        let retry = tokio::spawn(async move {
            report_scan_failure(&tx, reason, SCAN_RETRY_DELAY, async {
                Some(AdapterState::PoweredOn)
            })
            .await;
        });
        if let Some(previous) = self.retry.replace(retry) {
            previous.abort();
        }
    }
}

/// Forward advertising reports until the receiver goes away or a read fails.
async fn read_reports(
    async_fd: &AsyncFd<OwnedFd>,
    events: &mpsc::Sender<CentralEvent>,
) -> io::Result<()> {
    let mut buf = [0u8; EVENT_BUFFER_SIZE];

    loop {
        let mut guard = async_fd.readable().await?;

        // Drain all available packets before waiting again
        loop {
            let n = match guard.try_io(|inner| {
                // SAFETY: buf is a valid writable buffer of buf.len() bytes.
                let ret = unsafe {
                    libc::read(inner.as_raw_fd(), buf.as_mut_ptr() as *mut c_void, buf.len())
                };
                if ret < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(ret as usize)
                }
            }) {
                Ok(Ok(0)) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "HCI socket closed",
                    ));
                }
                Ok(Ok(n)) => n,
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => break,
            };

            let Some(peripheral) = parse_advertising_report(&buf[..n]) else {
                continue;
            };
            if events.send(CentralEvent::Discovered(peripheral)).await.is_err() {
                debug!("Event receiver closed, stopping HCI reader");
                return Ok(());
            }
        }
    }
}

impl Central for HciCentral {
    fn start_scanning(&mut self, filter: &ScanFilter) -> Result<(), ScanError> {
        if !filter.service_uuids.is_empty() {
            return Err(ScanError::Bluetooth(
                "Service UUID filters are not supported by the hci backend".to_string(),
            ));
        }

        let result = self.enable_scan(!filter.allow_duplicates);
        if let Err(e) = &result {
            self.schedule_retry(e.to_string());
        }
        result
    }

    fn stop_scanning(&mut self) -> Result<(), ScanError> {
        if let Some(retry) = self.retry.take() {
            retry.abort();
        }
        send_command(&self.cmd_fd, &scan_enable_packet(false, false))
    }
}

impl Drop for HciCentral {
    fn drop(&mut self) {
        self.reader.abort();
        if let Some(retry) = self.retry.take() {
            retry.abort();
        }
    }
}
