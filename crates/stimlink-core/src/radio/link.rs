//! Radio link driver
//!
//! Owns one dongle's serial stream and speaks the XBee API protocol over
//! it: a reader task deframes and dispatches inbound frames, AT commands
//! run one at a time under a lock with order-based response matching, and
//! an init task walks the link from `Opening` to `Ready` (self-identify,
//! poll association, resolve the coordinator address).

use std::sync::{Arc, Mutex as StdMutex};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::Channel;
use crate::protocol::frame::{
    self, parse_at_response, parse_receive_packet, parse_transmit_status, AtResponse, Deframer,
    FrameKind, NodeAddress,
};
use crate::protocol::{ProtocolError, AT_TIMEOUT_MS, DISCOVERY_RECORD_TIMEOUT_MS, POLL_INTERVAL_MS};

/// Lifecycle of a radio link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Port open, identity and association not yet established
    Opening,
    /// Identified and usable for AT traffic and transmits
    Ready,
    /// Torn down; every pending and future operation fails fast
    Closed,
}

/// Where a transmit request is addressed
#[derive(Debug, Clone, Copy)]
pub enum Destination {
    /// The coordinator resolved from the DH/DL registers
    Coordinator,
    /// An explicit remote node
    Node(NodeAddress),
}

/// Application payload received from a remote node
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Transmitting node's address
    pub source: NodeAddress,
    /// Raw application bytes, typically `key>value` lines
    pub payload: Vec<u8>,
}

/// One raw node-discovery record: address plus the node identifier string
#[derive(Debug, Clone)]
pub struct NdRecord {
    /// Discovered node's address
    pub address: NodeAddress,
    /// Node identifier string as configured on the remote radio
    pub node_id: String,
}

impl NdRecord {
    /// Parse an ND response value: MY(2) SH(4) SL(4) RSSI(1) NI(NUL-terminated)
    pub fn parse(value: &[u8]) -> Result<NdRecord, ProtocolError> {
        if value.len() < 11 {
            return Err(ProtocolError::Malformed("discovery record too short"));
        }
        let addr16 = u16::from(value[0]) << 8 | u16::from(value[1]);
        let addr64 = value[2..10]
            .iter()
            .fold(0u64, |acc, b| (acc << 8) | u64::from(*b));
        let ni_bytes = &value[11..];
        let ni_end = ni_bytes
            .iter()
            .position(|b| *b == 0x00)
            .unwrap_or(ni_bytes.len());
        let node_id = String::from_utf8_lossy(&ni_bytes[..ni_end])
            .trim()
            .to_string();
        Ok(NdRecord {
            address: NodeAddress { addr64, addr16 },
            node_id,
        })
    }
}

/// Everything `open` hands back: the shared link plus the inbound data and
/// delivery-error streams.
pub struct RadioHandles {
    /// Shared link driver
    pub link: Arc<RadioLink>,
    /// Application payloads from remote nodes
    pub inbound: mpsc::Receiver<InboundMessage>,
    /// Asynchronous delivery failures (transmit status != 0)
    pub errors: mpsc::Receiver<ProtocolError>,
}

/// Driver for one radio dongle
pub struct RadioLink {
    writer: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    // Serializes AT traffic: at most one command in flight.
    at_slot: Mutex<()>,
    pending: StdMutex<Option<mpsc::UnboundedSender<AtResponse>>>,
    state: StdMutex<LinkState>,
    coordinator: StdMutex<Option<NodeAddress>>,
    local_node_id: StdMutex<Option<String>>,
    closed: CancellationToken,
}

impl RadioLink {
    /// Open a link over an already-open transport. Spawns the reader and
    /// init tasks.
    pub fn open<C: Channel + 'static>(io: C) -> RadioHandles {
        let (read_half, write_half) = tokio::io::split(io);
        let (inbound_tx, inbound_rx) = mpsc::channel(256);
        let (error_tx, error_rx) = mpsc::channel(32);

        let link = Arc::new(RadioLink {
            writer: Mutex::new(Box::new(write_half)),
            at_slot: Mutex::new(()),
            pending: StdMutex::new(None),
            state: StdMutex::new(LinkState::Opening),
            coordinator: StdMutex::new(None),
            local_node_id: StdMutex::new(None),
            closed: CancellationToken::new(),
        });

        tokio::spawn(Arc::clone(&link).read_loop(read_half, inbound_tx, error_tx));
        tokio::spawn(Arc::clone(&link).init_task());

        RadioHandles {
            link,
            inbound: inbound_rx,
            errors: error_rx,
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> LinkState {
        *self.state.lock().expect("link state poisoned")
    }

    /// Node identifier of the local dongle, once identified
    pub fn local_node_id(&self) -> Option<String> {
        self.local_node_id
            .lock()
            .expect("link state poisoned")
            .clone()
    }

    /// Coordinator address, once resolved from DH/DL
    pub fn coordinator(&self) -> Option<NodeAddress> {
        *self.coordinator.lock().expect("link state poisoned")
    }

    /// Tear the link down. Pending AT waiters resolve with
    /// [`ProtocolError::LinkClosed`].
    pub fn close(&self) {
        *self.state.lock().expect("link state poisoned") = LinkState::Closed;
        self.closed.cancel();
    }

    /// Send one AT command and wait for its response value.
    ///
    /// Commands are strictly serialized; the next command's bytes are not
    /// written until this one resolves, times out, or the link closes.
    pub async fn send_at_command(&self, mnemonic: [u8; 2]) -> Result<Vec<u8>, ProtocolError> {
        let _slot = self.at_slot.lock().await;
        if self.closed.is_cancelled() {
            return Err(ProtocolError::LinkClosed);
        }
        let mut rx = self.arm_pending();
        self.write_frame(&frame::at_command_frame(mnemonic)).await?;

        let result = tokio::select! {
            _ = self.closed.cancelled() => Err(ProtocolError::LinkClosed),
            received = tokio::time::timeout(
                Duration::from_millis(AT_TIMEOUT_MS),
                rx.recv(),
            ) => match received {
                Ok(Some(response)) => Ok(response.value),
                Ok(None) => Err(ProtocolError::LinkClosed),
                Err(_) => Err(ProtocolError::Timeout),
            },
        };
        self.clear_pending();
        result
    }

    /// Run one network-discovery pass. Collects ND records until the
    /// module's empty terminator record or the inter-record timeout.
    /// Structurally bad records are skipped; interpreting node ids is the
    /// caller's concern.
    pub async fn discover(&self) -> Result<Vec<NdRecord>, ProtocolError> {
        let _slot = self.at_slot.lock().await;
        if self.closed.is_cancelled() {
            return Err(ProtocolError::LinkClosed);
        }
        let mut rx = self.arm_pending();
        self.write_frame(&frame::at_command_frame(*b"ND")).await?;

        let mut records = Vec::new();
        let outcome = loop {
            let next = tokio::select! {
                _ = self.closed.cancelled() => break Err(ProtocolError::LinkClosed),
                received = tokio::time::timeout(
                    Duration::from_millis(DISCOVERY_RECORD_TIMEOUT_MS),
                    rx.recv(),
                ) => received,
            };
            match next {
                // Empty value is the scan-complete terminator.
                Ok(Some(response)) if response.value.is_empty() => break Ok(()),
                Ok(Some(response)) => match NdRecord::parse(&response.value) {
                    Ok(record) => records.push(record),
                    Err(e) => warn!(error = %e, "skipping malformed discovery record"),
                },
                Ok(None) => break Err(ProtocolError::LinkClosed),
                // No terminator from older firmware; silence ends the scan.
                Err(_) => break Ok(()),
            }
        };
        self.clear_pending();
        outcome.map(|()| records)
    }

    /// Transmit application bytes to a remote node.
    ///
    /// [`Destination::Coordinator`] fails with [`ProtocolError::NotReady`]
    /// until the init task has resolved DH/DL.
    pub async fn transmit(&self, dest: Destination, payload: &[u8]) -> Result<(), ProtocolError> {
        if self.closed.is_cancelled() {
            return Err(ProtocolError::LinkClosed);
        }
        let address = match dest {
            Destination::Node(address) => address,
            Destination::Coordinator => self.coordinator().ok_or(ProtocolError::NotReady)?,
        };
        self.write_frame(&frame::transmit_request_frame(address, payload))
            .await
    }

    fn arm_pending(&self) -> mpsc::UnboundedReceiver<AtResponse> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.pending.lock().expect("link state poisoned") = Some(tx);
        rx
    }

    fn clear_pending(&self) {
        *self.pending.lock().expect("link state poisoned") = None;
    }

    async fn write_frame(&self, bytes: &[u8]) -> Result<(), ProtocolError> {
        let mut writer = self.writer.lock().await;
        writer.write_all(bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn read_loop<R>(
        self: Arc<Self>,
        mut reader: R,
        inbound: mpsc::Sender<InboundMessage>,
        errors: mpsc::Sender<ProtocolError>,
    ) where
        R: AsyncRead + Send + Unpin,
    {
        let mut deframer = Deframer::new();
        let mut buf = [0u8; 1024];
        loop {
            let read = tokio::select! {
                _ = self.closed.cancelled() => break,
                read = reader.read(&mut buf) => read,
            };
            let n = match read {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    warn!(error = %e, "radio read failed");
                    break;
                }
            };
            deframer.extend(&buf[..n]);
            while let Some(result) = deframer.next_frame() {
                match result {
                    Ok(frame) => self.dispatch(frame, &inbound, &errors).await,
                    Err(e) => warn!(error = %e, "discarding malformed radio frame"),
                }
            }
        }
        self.close();
    }

    async fn dispatch(
        &self,
        frame: frame::Frame,
        inbound: &mpsc::Sender<InboundMessage>,
        errors: &mpsc::Sender<ProtocolError>,
    ) {
        match frame.kind {
            FrameKind::AtResponse => match parse_at_response(&frame.payload) {
                Ok(response) => {
                    if response.status != 0x00 {
                        warn!(
                            command = %String::from_utf8_lossy(&response.command),
                            status = response.status,
                            "AT command rejected by radio"
                        );
                    }
                    let waiter = self
                        .pending
                        .lock()
                        .expect("link state poisoned")
                        .clone();
                    match waiter {
                        Some(tx) => {
                            let _ = tx.send(response);
                        }
                        None => debug!("AT response with no waiter, dropping"),
                    }
                }
                Err(e) => warn!(error = %e, "bad AT response payload"),
            },
            FrameKind::ReceivePacket => {
                match parse_receive_packet(frame.frame_type, &frame.payload) {
                    Ok(received) => {
                        let message = InboundMessage {
                            source: received.source,
                            payload: received.data,
                        };
                        if inbound.send(message).await.is_err() {
                            debug!("inbound consumer gone, dropping payload");
                        }
                    }
                    Err(e) => warn!(error = %e, "bad receive packet"),
                }
            }
            FrameKind::TransmitStatus => match parse_transmit_status(&frame.payload) {
                Ok(0x00) => {}
                Ok(status) => {
                    warn!(status, "radio delivery failed");
                    let _ = errors.try_send(ProtocolError::DeliveryFailed(status));
                }
                Err(e) => warn!(error = %e, "bad transmit status payload"),
            },
            FrameKind::ModemStatus => {
                debug!(status = frame.payload.first().copied(), "modem status");
            }
            other => debug!(kind = ?other, "unhandled radio frame"),
        }
    }

    /// Walks Opening -> Ready: identify the dongle, wait for association,
    /// then resolve the coordinator address for default-destination sends.
    async fn init_task(self: Arc<Self>) {
        loop {
            if self.closed.is_cancelled() {
                return;
            }
            match self.send_at_command(*b"NI").await {
                Ok(value) => {
                    let name = String::from_utf8_lossy(&value).trim().to_string();
                    info!(node_id = %name, "radio dongle identified");
                    *self.local_node_id.lock().expect("link state poisoned") = Some(name);
                    *self.state.lock().expect("link state poisoned") = LinkState::Ready;
                    break;
                }
                Err(ProtocolError::LinkClosed) => return,
                Err(e) => warn!(error = %e, "dongle identification failed, retrying"),
            }
            tokio::time::sleep(Duration::from_millis(POLL_INTERVAL_MS)).await;
        }

        loop {
            if self.closed.is_cancelled() {
                return;
            }
            match self.send_at_command(*b"AI").await {
                Ok(value) if value == [0x00] => break,
                Ok(_) => {}
                Err(ProtocolError::LinkClosed) => return,
                Err(e) => warn!(error = %e, "association poll failed"),
            }
            tokio::time::sleep(Duration::from_millis(POLL_INTERVAL_MS)).await;
        }

        let high = match self.read_register(*b"DH").await {
            Some(value) => value,
            None => return,
        };
        let low = match self.read_register(*b"DL").await {
            Some(value) => value,
            None => return,
        };
        let addr64 = u64::from(high) << 32 | u64::from(low);
        *self.coordinator.lock().expect("link state poisoned") =
            Some(NodeAddress::from_addr64(addr64));
        info!(addr64 = format_args!("{addr64:016X}"), "coordinator resolved");
    }

    /// Read a register as a big-endian u32, retrying until the link closes
    async fn read_register(&self, mnemonic: [u8; 2]) -> Option<u32> {
        loop {
            match self.send_at_command(mnemonic).await {
                Ok(value) => {
                    return Some(
                        value
                            .iter()
                            .fold(0u32, |acc, b| (acc << 8) | u32::from(*b)),
                    );
                }
                Err(ProtocolError::LinkClosed) => return None,
                Err(e) => warn!(error = %e, "register read failed, retrying"),
            }
            tokio::time::sleep(Duration::from_millis(POLL_INTERVAL_MS)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::DuplexStream;

    const TYPE_AT_RESPONSE: u8 = 0x88;
    const TYPE_TRANSMIT_STATUS: u8 = 0x8B;
    const TYPE_RECEIVE_16: u8 = 0x90;

    /// Scripted stand-in for the dongle on the far end of a duplex pipe
    struct FakeDongle {
        io: DuplexStream,
        deframer: Deframer,
    }

    impl FakeDongle {
        fn new(io: DuplexStream) -> Self {
            Self {
                io,
                deframer: Deframer::new(),
            }
        }

        async fn next_frame(&mut self) -> frame::Frame {
            let mut buf = [0u8; 512];
            loop {
                if let Some(result) = self.deframer.next_frame() {
                    return result.expect("host sent malformed frame");
                }
                let n = self.io.read(&mut buf).await.expect("host side closed");
                assert!(n > 0, "host side closed");
                self.deframer.extend(&buf[..n]);
            }
        }

        /// Next frame, asserting it is an AT command; returns its mnemonic
        async fn next_at(&mut self) -> [u8; 2] {
            let f = self.next_frame().await;
            assert_eq!(f.kind, FrameKind::AtCommand);
            [f.payload[1], f.payload[2]]
        }

        async fn respond_at(&mut self, mnemonic: [u8; 2], status: u8, value: &[u8]) {
            let mut body = vec![0x01, mnemonic[0], mnemonic[1], status];
            body.extend_from_slice(value);
            self.send_api(TYPE_AT_RESPONSE, &body).await;
        }

        async fn send_api(&mut self, frame_type: u8, body: &[u8]) {
            self.io
                .write_all(&frame::encode(frame_type, body))
                .await
                .unwrap();
        }

        /// Service the NI/AI/DH/DL init sequence
        async fn handshake(&mut self) {
            assert_eq!(self.next_at().await, *b"NI");
            self.respond_at(*b"NI", 0x00, b"dongle_1").await;
            assert_eq!(self.next_at().await, *b"AI");
            self.respond_at(*b"AI", 0x00, &[0x00]).await;
            assert_eq!(self.next_at().await, *b"DH");
            self.respond_at(*b"DH", 0x00, &[0x00, 0x13, 0xA2, 0x00]).await;
            assert_eq!(self.next_at().await, *b"DL");
            self.respond_at(*b"DL", 0x00, &[0x12, 0x34, 0x56, 0x78]).await;
        }
    }

    async fn ready_link() -> (RadioHandles, FakeDongle) {
        let (host, device) = tokio::io::duplex(4096);
        let handles = RadioLink::open(host);
        let mut dongle = FakeDongle::new(device);
        dongle.handshake().await;
        while handles.link.coordinator().is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        (handles, dongle)
    }

    #[tokio::test]
    async fn test_init_walks_to_ready_and_resolves_coordinator() {
        let (handles, _dongle) = ready_link().await;
        assert_eq!(handles.link.state(), LinkState::Ready);
        assert_eq!(handles.link.local_node_id().as_deref(), Some("dongle_1"));
        assert_eq!(
            handles.link.coordinator().unwrap().addr64,
            0x0013A20012345678
        );
    }

    #[tokio::test]
    async fn test_at_commands_are_serialized() {
        let (handles, mut dongle) = ready_link().await;
        let link = Arc::clone(&handles.link);
        let link2 = Arc::clone(&handles.link);

        let first = tokio::spawn(async move { link.send_at_command(*b"P0").await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = tokio::spawn(async move { link2.send_at_command(*b"P1").await });

        assert_eq!(dongle.next_at().await, *b"P0");
        // The second command's bytes must not hit the wire until the first
        // has a response.
        let premature =
            tokio::time::timeout(Duration::from_millis(100), dongle.next_frame()).await;
        assert!(premature.is_err(), "second AT command sent early");

        dongle.respond_at(*b"P0", 0x00, &[0xAA]).await;
        assert_eq!(dongle.next_at().await, *b"P1");
        dongle.respond_at(*b"P1", 0x00, &[0xBB]).await;

        assert_eq!(first.await.unwrap().unwrap(), vec![0xAA]);
        assert_eq!(second.await.unwrap().unwrap(), vec![0xBB]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_at_timeout_frees_the_slot() {
        let (handles, mut dongle) = ready_link().await;

        // Dongle reads the command but never answers.
        let pending = tokio::spawn({
            let link = Arc::clone(&handles.link);
            async move { link.send_at_command(*b"XX").await }
        });
        assert_eq!(dongle.next_at().await, *b"XX");
        assert!(matches!(
            pending.await.unwrap(),
            Err(ProtocolError::Timeout)
        ));

        // The slot is free again for the next command.
        let next = tokio::spawn({
            let link = Arc::clone(&handles.link);
            async move { link.send_at_command(*b"AI").await }
        });
        assert_eq!(dongle.next_at().await, *b"AI");
        dongle.respond_at(*b"AI", 0x00, &[0x00]).await;
        assert_eq!(next.await.unwrap().unwrap(), vec![0x00]);
    }

    #[tokio::test]
    async fn test_close_releases_waiters() {
        let (handles, mut dongle) = ready_link().await;
        let pending = tokio::spawn({
            let link = Arc::clone(&handles.link);
            async move { link.send_at_command(*b"VR").await }
        });
        assert_eq!(dongle.next_at().await, *b"VR");
        handles.link.close();
        assert!(matches!(
            pending.await.unwrap(),
            Err(ProtocolError::LinkClosed)
        ));
        assert_eq!(handles.link.state(), LinkState::Closed);
    }

    #[tokio::test]
    async fn test_inbound_payloads_reach_the_stream() {
        let (mut handles, mut dongle) = ready_link().await;

        let mut body = vec![0u8; 10];
        body[0..8].copy_from_slice(&0x0013A200AABBCCDDu64.to_be_bytes());
        body[8..10].copy_from_slice(&0xFFFEu16.to_be_bytes());
        body.push(0x00);
        body.extend_from_slice(b"clk>2\n");
        dongle.send_api(TYPE_RECEIVE_16, &body).await;

        let message = handles.inbound.recv().await.unwrap();
        assert_eq!(message.source.addr64, 0x0013A200AABBCCDD);
        assert_eq!(message.payload, b"clk>2\n");
    }

    #[tokio::test]
    async fn test_delivery_failure_surfaces_on_error_stream() {
        let (mut handles, mut dongle) = ready_link().await;
        // frame id, addr16, retries, delivery status, discovery status
        dongle
            .send_api(TYPE_TRANSMIT_STATUS, &[0x01, 0xFF, 0xFE, 0x02, 0x25, 0x00])
            .await;
        assert!(matches!(
            handles.errors.recv().await,
            Some(ProtocolError::DeliveryFailed(0x25))
        ));
    }

    #[tokio::test]
    async fn test_transmit_to_unresolved_coordinator_is_not_ready() {
        let (host, _device) = tokio::io::duplex(4096);
        let handles = RadioLink::open(host);
        assert!(matches!(
            handles.link.transmit(Destination::Coordinator, b"x").await,
            Err(ProtocolError::NotReady)
        ));
    }

    #[tokio::test]
    async fn test_discovery_collects_until_terminator() {
        let (handles, mut dongle) = ready_link().await;
        let scan = tokio::spawn({
            let link = Arc::clone(&handles.link);
            async move { link.discover().await }
        });
        assert_eq!(dongle.next_at().await, *b"ND");

        let mut record = vec![0xFF, 0xFE];
        record.extend_from_slice(&0x0013A20011111111u64.to_be_bytes());
        record.push(0x30); // RSSI
        record.extend_from_slice(b"wDRT_1\x00");
        dongle.respond_at(*b"ND", 0x00, &record).await;
        dongle.respond_at(*b"ND", 0x00, &[]).await;

        let records = scan.await.unwrap().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].node_id, "wDRT_1");
        assert_eq!(records[0].address.addr64, 0x0013A20011111111);
    }

    #[test]
    fn test_nd_record_parse_rejects_short_payload() {
        assert!(NdRecord::parse(&[0x00; 5]).is_err());
    }
}
