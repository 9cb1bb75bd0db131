//! USB serial port scanner
//!
//! Polls the system port list, classifies ports by USB vendor/product id,
//! and reports attach/detach transitions with an already-open serial
//! stream. Port enumeration is blocking, so it runs on the blocking pool.

use std::collections::HashMap;

use serialport::{SerialPortInfo, SerialPortType};
use tokio::sync::mpsc;
use tokio::time::Duration;
use tokio_serial::SerialPortBuilderExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::Channel;
use crate::protocol::{BAUD_RATE, POLL_INTERVAL_MS};
use crate::session::DeviceProfile;

/// What a recognized USB id maps to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbRole {
    /// A directly attached experiment device
    Device(DeviceProfile),
    /// The radio dongle
    Dongle,
}

/// Known (role, vid, pid) triples. The dongle is an FTDI FT231X
/// (vendor 0x0403); the sDRT enumerates under the Adafruit vendor id.
const KNOWN_IDS: &[(UsbRole, u16, u16)] = &[
    (UsbRole::Device(DeviceProfile::SftDrt), 0x9800, 0xF055),
    (UsbRole::Device(DeviceProfile::Drt), 0x239A, 0x801F),
    (UsbRole::Device(DeviceProfile::Wdrt), 0xF056, 0x1111),
    (UsbRole::Device(DeviceProfile::Vog), 0x0483, 0x16C0),
    (UsbRole::Device(DeviceProfile::Wvog), 0xF057, 0x08AE),
    (UsbRole::Dongle, 0x0403, 0x6015),
];

/// Attach/detach transitions reported by the scanner
pub enum ScannerEvent {
    /// A known device appeared and its port opened
    DeviceAttached {
        /// Device type on the port
        profile: DeviceProfile,
        /// System port name
        port: String,
        /// Open serial stream
        channel: Box<dyn Channel>,
    },
    /// A known device's port disappeared
    DeviceDetached {
        /// Device type that was on the port
        profile: DeviceProfile,
        /// System port name
        port: String,
    },
    /// The radio dongle appeared and its port opened
    DongleAttached {
        /// System port name
        port: String,
        /// Open serial stream
        channel: Box<dyn Channel>,
    },
    /// The radio dongle's port disappeared
    DongleDetached {
        /// System port name
        port: String,
    },
}

/// Classify a USB vid/pid pair against the known-device table
pub fn classify_ids(vid: u16, pid: u16) -> Option<UsbRole> {
    KNOWN_IDS
        .iter()
        .find(|(_, known_vid, known_pid)| vid == *known_vid && pid == *known_pid)
        .map(|(role, _, _)| *role)
}

/// Classify one enumerated port
pub fn classify_port(info: &SerialPortInfo) -> Option<UsbRole> {
    match &info.port_type {
        SerialPortType::UsbPort(usb) => classify_ids(usb.vid, usb.pid),
        _ => None,
    }
}

/// Start the background scan loop. Cancelling the returned token stops it.
pub fn spawn(events: mpsc::Sender<ScannerEvent>) -> CancellationToken {
    let token = CancellationToken::new();
    tokio::spawn(scan_loop(events, token.clone()));
    token
}

async fn scan_loop(events: mpsc::Sender<ScannerEvent>, token: CancellationToken) {
    let mut open: HashMap<String, UsbRole> = HashMap::new();
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(Duration::from_millis(POLL_INTERVAL_MS)) => {}
        }

        let ports = match tokio::task::spawn_blocking(serialport::available_ports).await {
            Ok(Ok(ports)) => ports,
            Ok(Err(e)) => {
                warn!(error = %e, "port enumeration failed");
                continue;
            }
            Err(e) => {
                warn!(error = %e, "port enumeration task failed");
                continue;
            }
        };

        let present: HashMap<String, UsbRole> = ports
            .iter()
            .filter_map(|info| classify_port(info).map(|role| (info.port_name.clone(), role)))
            .collect();

        let gone: Vec<(String, UsbRole)> = open
            .iter()
            .filter(|(name, _)| !present.contains_key(*name))
            .map(|(name, role)| (name.clone(), *role))
            .collect();
        for (port, role) in gone {
            open.remove(&port);
            info!(%port, "device detached");
            let event = match role {
                UsbRole::Device(profile) => ScannerEvent::DeviceDetached { profile, port },
                UsbRole::Dongle => ScannerEvent::DongleDetached { port },
            };
            if events.send(event).await.is_err() {
                return;
            }
        }

        for (port, role) in &present {
            if open.contains_key(port) {
                continue;
            }
            let stream = match tokio_serial::new(port, BAUD_RATE).open_native_async() {
                Ok(stream) => stream,
                Err(e) => {
                    // Enumerated but not openable yet; retried next poll.
                    debug!(%port, error = %e, "port open failed");
                    continue;
                }
            };
            open.insert(port.clone(), *role);
            info!(%port, "device attached");
            let channel: Box<dyn Channel> = Box::new(stream);
            let event = match role {
                UsbRole::Device(profile) => ScannerEvent::DeviceAttached {
                    profile: *profile,
                    port: port.clone(),
                    channel,
                },
                UsbRole::Dongle => ScannerEvent::DongleAttached {
                    port: port.clone(),
                    channel,
                },
            };
            if events.send(event).await.is_err() {
                return;
            }
        }
    }
}
