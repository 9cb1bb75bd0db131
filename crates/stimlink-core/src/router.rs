//! Connection router
//!
//! Single event loop multiplexing every device connection: scanner
//! attach/detach transitions, lines from wired serial readers, payloads
//! from the radio link, UI commands, and roster changes all funnel into
//! one queue. Sessions run as tasks; the router owns their handles and the
//! wired/wireless rosters, and fans UI commands out with `all` wildcards.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::channel::Channel;
use crate::events::{DevicesChanged, UiMessage};
use crate::radio::{InboundMessage, NetworkDirectory, RadioLink};
use crate::results::ResultsSink;
use crate::scanner::ScannerEvent;
use crate::session::{utc_clock_string, DeviceProfile, DeviceSession, Outbound, SessionHandle};

/// Capacity of the router's unified event queue
const EVENT_QUEUE_DEPTH: usize = 256;

/// Capacity of the UI broadcast ring; lagging consumers lose the oldest
/// events rather than stalling device traffic
const UI_QUEUE_DEPTH: usize = 1024;

/// Everything the router reacts to
pub enum RouterEvent {
    /// Command from the UI boundary
    Command(UiMessage),
    /// Port attach/detach transition
    Scanner(ScannerEvent),
    /// One line read from a wired device
    SerialLine {
        /// Device type on the port
        profile: DeviceProfile,
        /// Port name
        port: String,
        /// Raw line without the terminator
        line: String,
    },
    /// A wired reader hit end-of-stream before the scanner noticed
    SerialGone {
        /// Device type on the port
        profile: DeviceProfile,
        /// Port name
        port: String,
    },
    /// Application payload from a remote radio node
    RadioInbound(InboundMessage),
    /// Asynchronous radio delivery failure
    RadioError(crate::protocol::ProtocolError),
    /// Wireless roster change from the network directory
    Devices(DevicesChanged),
}

struct RadioState {
    link: Arc<RadioLink>,
    directory: Arc<NetworkDirectory>,
    dongle_port: String,
}

/// The connection hub. Construct, subscribe the UI, then `run`.
pub struct Router {
    events_tx: mpsc::Sender<RouterEvent>,
    events_rx: mpsc::Receiver<RouterEvent>,
    ui: broadcast::Sender<UiMessage>,
    sink: Arc<dyn ResultsSink>,
    sessions: HashMap<(DeviceProfile, String), SessionHandle>,
    serial_ports: HashMap<String, DeviceProfile>,
    radio: Option<RadioState>,
}

impl Router {
    /// New router writing trial results to `sink`
    pub fn new(sink: Arc<dyn ResultsSink>) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let (ui, _) = broadcast::channel(UI_QUEUE_DEPTH);
        Self {
            events_tx,
            events_rx,
            ui,
            sink,
            sessions: HashMap::new(),
            serial_ports: HashMap::new(),
            radio: None,
        }
    }

    /// Sender feeding the router's event queue; clone one per producer
    /// (scanner pump, UI boundary, tests)
    pub fn event_sender(&self) -> mpsc::Sender<RouterEvent> {
        self.events_tx.clone()
    }

    /// Subscribe a UI consumer to the outbound event stream
    pub fn ui_subscribe(&self) -> broadcast::Receiver<UiMessage> {
        self.ui.subscribe()
    }

    /// Drive the event loop until every event sender is dropped
    pub async fn run(mut self) {
        while let Some(event) = self.events_rx.recv().await {
            match event {
                RouterEvent::Command(message) => self.handle_command(message).await,
                RouterEvent::Scanner(event) => self.handle_scanner(event).await,
                RouterEvent::SerialLine {
                    profile,
                    port,
                    line,
                } => self.forward_line(profile, &port, &line).await,
                RouterEvent::SerialGone { profile, port } => {
                    self.detach_serial(profile, &port);
                }
                RouterEvent::RadioInbound(message) => self.handle_radio_inbound(message).await,
                RouterEvent::RadioError(e) => warn!(error = %e, "radio delivery error"),
                RouterEvent::Devices(roster) => self.handle_devices_changed(roster).await,
            }
        }
        info!("router event queue closed, shutting down");
    }

    // ---- UI commands ----------------------------------------------------

    async fn handle_command(&mut self, message: UiMessage) {
        if message.key == "net_scn" {
            self.rescan_network().await;
            return;
        }
        self.distribute(&message.device, &message.port, &message.key, &message.value)
            .await;
    }

    /// Fan a command out to every session matching the address; `all`
    /// wildcards either component.
    async fn distribute(&self, device: &str, port: &str, key: &str, value: &str) {
        let targets: Vec<SessionHandle> = self
            .sessions
            .iter()
            .filter(|((profile, session_port), _)| {
                (device == "all" || profile.label() == device)
                    && (port == "all" || session_port == port)
            })
            .map(|(_, handle)| handle.clone())
            .collect();
        if targets.is_empty() {
            debug!(device, port, key, "command matched no sessions");
        }
        for handle in targets {
            handle.host(key, value).await;
        }
    }

    // ---- Scanner transitions --------------------------------------------

    async fn handle_scanner(&mut self, event: ScannerEvent) {
        match event {
            ScannerEvent::DeviceAttached {
                profile,
                port,
                channel,
            } => self.attach_serial(profile, port, channel).await,
            ScannerEvent::DeviceDetached { profile, port } => {
                self.detach_serial(profile, &port);
            }
            ScannerEvent::DongleAttached { port, channel } => {
                self.attach_dongle(port, channel);
            }
            ScannerEvent::DongleDetached { port } => self.detach_dongle(&port),
        }
    }

    async fn attach_serial(
        &mut self,
        profile: DeviceProfile,
        port: String,
        channel: Box<dyn Channel>,
    ) {
        // With a dongle present, wireless units are reached over the radio;
        // their USB ports are firmware/charging connections.
        if profile.is_wireless() && self.radio.is_some() {
            debug!(%port, device = profile.label(), "ignoring wired port of radio-served device");
            return;
        }
        let (read_half, write_half) = tokio::io::split(channel);
        let writer = spawn_serial_writer(write_half);
        spawn_serial_reader(profile, port.clone(), read_half, self.events_tx.clone());

        // Always a fresh session; reconnects never inherit state.
        let handle = DeviceSession::spawn(
            profile,
            port.clone(),
            Outbound::Serial(writer),
            self.ui.clone(),
            Arc::clone(&self.sink),
        );
        handle.host("set_rtc", &utc_clock_string()).await;
        self.sessions.insert((profile, port.clone()), handle);
        self.serial_ports.insert(port, profile);
        self.emit_serial_roster(profile);
    }

    fn detach_serial(&mut self, profile: DeviceProfile, port: &str) {
        if self.serial_ports.remove(port).is_none() {
            return;
        }
        // Dropping the handle closes the session's inbox; the task ends
        // any in-flight trial on its way out.
        self.sessions.remove(&(profile, port.to_string()));
        info!(%port, device = profile.label(), "session closed");
        self.emit_serial_roster(profile);
    }

    fn attach_dongle(&mut self, port: String, channel: Box<dyn Channel>) {
        let handles = RadioLink::open(channel);
        let (roster_tx, mut roster_rx) = mpsc::channel(16);
        let directory = NetworkDirectory::new(Arc::clone(&handles.link), roster_tx);
        directory.start_discovery();

        let events = self.events_tx.clone();
        let mut inbound = handles.inbound;
        tokio::spawn(async move {
            while let Some(message) = inbound.recv().await {
                if events.send(RouterEvent::RadioInbound(message)).await.is_err() {
                    break;
                }
            }
        });
        let events = self.events_tx.clone();
        let mut errors = handles.errors;
        tokio::spawn(async move {
            while let Some(error) = errors.recv().await {
                if events.send(RouterEvent::RadioError(error)).await.is_err() {
                    break;
                }
            }
        });
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            while let Some(roster) = roster_rx.recv().await {
                if events.send(RouterEvent::Devices(roster)).await.is_err() {
                    break;
                }
            }
        });

        // Radio now serves the wireless types; drop any wired-backed
        // wireless sessions.
        self.drop_wireless_sessions();
        info!(%port, "radio dongle attached, discovery started");
        self.radio = Some(RadioState {
            link: handles.link,
            directory,
            dongle_port: port,
        });
    }

    fn detach_dongle(&mut self, port: &str) {
        let Some(radio) = &self.radio else { return };
        if radio.dongle_port != port {
            return;
        }
        radio.directory.stop_scan();
        radio.link.close();
        self.radio = None;
        self.drop_wireless_sessions();
        info!(%port, "radio dongle detached");
    }

    fn drop_wireless_sessions(&mut self) {
        let before = self.sessions.len();
        self.sessions.retain(|(profile, _), _| !profile.is_wireless());
        if self.sessions.len() != before {
            for profile in [DeviceProfile::Wdrt, DeviceProfile::Wvog] {
                self.route_to_ui(UiMessage::new(profile.label(), "ui", "devices", ""));
            }
        }
        self.serial_ports
            .retain(|_, profile| !profile.is_wireless());
    }

    // ---- Wired traffic --------------------------------------------------

    async fn forward_line(&self, profile: DeviceProfile, port: &str, line: &str) {
        match self.sessions.get(&(profile, port.to_string())) {
            Some(handle) => handle.device_line(line).await,
            None => debug!(%port, line, "line from port with no session"),
        }
    }

    // ---- Radio traffic --------------------------------------------------

    async fn handle_radio_inbound(&mut self, message: InboundMessage) {
        let Some(radio) = &self.radio else {
            return;
        };
        let Some(node) = radio.directory.lookup_by_addr64(message.source.addr64) else {
            debug!(
                addr64 = format_args!("{:016X}", message.source.addr64),
                "payload from undiscovered node"
            );
            return;
        };
        let Some(handle) = self.ensure_radio_session(&node.device_type, &node.instance_id) else {
            return;
        };
        let text = String::from_utf8_lossy(&message.payload);
        for line in text.lines() {
            handle.device_line(line).await;
        }
    }

    async fn handle_devices_changed(&mut self, roster: DevicesChanged) {
        for instance_id in &roster.ids {
            if let Some(handle) = self.ensure_radio_session(&roster.device_type, instance_id) {
                // Freshly discovered nodes get the host clock.
                handle.host("set_rtc", &utc_clock_string()).await;
            }
        }
        self.route_to_ui(UiMessage::new(
            &roster.device_type,
            "ui",
            "devices",
            roster.ids.join(","),
        ));
    }

    fn ensure_radio_session(
        &mut self,
        device_type: &str,
        instance_id: &str,
    ) -> Option<SessionHandle> {
        let radio = self.radio.as_ref()?;
        let Some(profile) = DeviceProfile::from_label(device_type) else {
            debug!(device_type, "node of unknown device type");
            return None;
        };
        let key = (profile, instance_id.to_string());
        if let Some(handle) = self.sessions.get(&key) {
            return Some(handle.clone());
        }
        let node = radio.directory.lookup(device_type, instance_id)?;
        let handle = DeviceSession::spawn(
            profile,
            instance_id.to_string(),
            Outbound::Radio {
                link: Arc::clone(&radio.link),
                address: node.address,
            },
            self.ui.clone(),
            Arc::clone(&self.sink),
        );
        self.sessions.insert(key, handle.clone());
        Some(handle)
    }

    /// Wipe the wireless roster and rediscover from scratch
    async fn rescan_network(&mut self) {
        let Some(radio) = &self.radio else {
            debug!("network rescan requested with no dongle");
            return;
        };
        self.sessions.retain(|(profile, _), _| !profile.is_wireless());
        radio.directory.clear().await;
    }

    // ---- Rosters --------------------------------------------------------

    fn emit_serial_roster(&self, profile: DeviceProfile) {
        let mut ports: Vec<&str> = self
            .serial_ports
            .iter()
            .filter(|(_, p)| **p == profile)
            .map(|(port, _)| port.as_str())
            .collect();
        ports.sort_unstable();
        self.route_to_ui(UiMessage::new(
            profile.label(),
            "ui",
            "devices",
            ports.join(","),
        ));
    }

    fn route_to_ui(&self, message: UiMessage) {
        // Never blocks; a lagging UI loses oldest events.
        let _ = self.ui.send(message);
    }
}

/// Writer task for one wired port. A failed write drops that message;
/// the scanner notices dead ports on its next poll.
fn spawn_serial_writer(
    mut write_half: WriteHalf<Box<dyn Channel>>,
) -> mpsc::UnboundedSender<Vec<u8>> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    tokio::spawn(async move {
        while let Some(bytes) = rx.recv().await {
            if let Err(e) = write_half.write_all(&bytes).await {
                warn!(error = %e, "serial write failed, dropping message");
            }
        }
    });
    tx
}

/// Reader task for one wired port, forwarding lines into the router queue
fn spawn_serial_reader(
    profile: DeviceProfile,
    port: String,
    read_half: ReadHalf<Box<dyn Channel>>,
    events: mpsc::Sender<RouterEvent>,
) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(read_half).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let event = RouterEvent::SerialLine {
                        profile,
                        port: port.clone(),
                        line,
                    };
                    if events.send(event).await.is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(%port, error = %e, "serial read failed");
                    break;
                }
            }
        }
        let _ = events.send(RouterEvent::SerialGone { profile, port }).await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::results::MemorySink;

    #[tokio::test]
    async fn test_distribute_wildcards() {
        let sink = Arc::new(MemorySink::new());
        let mut router = Router::new(sink.clone() as Arc<dyn ResultsSink>);
        let (host_a, _dev_a) = tokio::io::duplex(256);
        let (host_b, _dev_b) = tokio::io::duplex(256);
        router
            .attach_serial(DeviceProfile::Drt, "COM3".into(), Box::new(host_a))
            .await;
        router
            .attach_serial(DeviceProfile::Vog, "COM4".into(), Box::new(host_b))
            .await;

        // Address one device, then everything; neither should panic or
        // stall, and a trial on the addressed device produces one record.
        router.distribute("sDRT", "COM3", "trl", "1").await;
        router.distribute("all", "all", "exp", "0").await;
        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
        assert_eq!(sink.records().len(), 1);
        assert!(sink.records()[0].device_id.starts_with("sDRT"));
    }

    #[tokio::test]
    async fn test_detach_unknown_port_is_harmless() {
        let sink = Arc::new(MemorySink::new());
        let mut router = Router::new(sink as Arc<dyn ResultsSink>);
        router.detach_serial(DeviceProfile::Drt, "COM9");
        assert!(router.sessions.is_empty());
    }

    #[tokio::test]
    async fn test_wired_wireless_port_ignored_while_dongle_present() {
        let sink = Arc::new(MemorySink::new());
        let mut router = Router::new(sink as Arc<dyn ResultsSink>);
        let (dongle_host, _dongle_dev) = tokio::io::duplex(256);
        router.attach_dongle("COM7".into(), Box::new(dongle_host));

        let (host, _dev) = tokio::io::duplex(256);
        router
            .attach_serial(DeviceProfile::Wdrt, "COM8".into(), Box::new(host))
            .await;
        assert!(router.sessions.is_empty());
    }
}
