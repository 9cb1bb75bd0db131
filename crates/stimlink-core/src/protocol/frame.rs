//! XBee API frame encoding/decoding
//!
//! Frame format:
//! - 1 byte: start delimiter (0x7E)
//! - 2 bytes: API payload length (big-endian)
//! - N bytes: API payload (frame-type byte + body)
//! - 1 byte: checksum, `0xFF - (sum(payload) & 0xFF)`

use byteorder::{BigEndian, ByteOrder};

use super::ProtocolError;

/// Start-of-frame delimiter
pub const FRAME_DELIMITER: u8 = 0x7E;

/// Frame id used for all outbound frames. Responses carry no correlation id
/// the link relies on; matching is strictly by arrival order.
pub const OUTBOUND_FRAME_ID: u8 = 0x01;

/// API frame-type identifiers
const TYPE_AT_COMMAND: u8 = 0x08;
const TYPE_TRANSMIT_REQUEST: u8 = 0x10;
const TYPE_AT_RESPONSE: u8 = 0x88;
const TYPE_MODEM_STATUS: u8 = 0x8A;
const TYPE_TRANSMIT_STATUS: u8 = 0x8B;
const TYPE_RECEIVE_16: u8 = 0x90;
const TYPE_RECEIVE_EXPLICIT: u8 = 0x91;

/// Kind of a decoded API frame, from the frame-type byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// 0x08 — AT command request (outbound)
    AtCommand,
    /// 0x88 — AT command response
    AtResponse,
    /// 0x10 — transmit request (outbound)
    TransmitRequest,
    /// 0x90 / 0x91 — inbound application data
    ReceivePacket,
    /// 0x8B — delivery status for a transmit request
    TransmitStatus,
    /// 0x8A — modem status update
    ModemStatus,
    /// Anything else; surfaced but not interpreted
    Unknown(u8),
}

impl FrameKind {
    /// Classify an API frame-type byte
    pub fn from_type_byte(byte: u8) -> Self {
        match byte {
            TYPE_AT_COMMAND => FrameKind::AtCommand,
            TYPE_AT_RESPONSE => FrameKind::AtResponse,
            TYPE_TRANSMIT_REQUEST => FrameKind::TransmitRequest,
            TYPE_RECEIVE_16 | TYPE_RECEIVE_EXPLICIT => FrameKind::ReceivePacket,
            TYPE_TRANSMIT_STATUS => FrameKind::TransmitStatus,
            TYPE_MODEM_STATUS => FrameKind::ModemStatus,
            other => FrameKind::Unknown(other),
        }
    }
}

/// A decoded API frame. Constructed only by [`decode`]; a `Frame` value
/// exists only if its checksum verified.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Classified frame kind
    pub kind: FrameKind,
    /// Raw frame-type byte (distinguishes the 0x90/0x91 receive variants)
    pub frame_type: u8,
    /// API payload after the frame-type byte
    pub payload: Vec<u8>,
}

/// Transport-level address of a remote radio: 64-bit serial plus the
/// 16-bit network address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeAddress {
    /// 64-bit address (SH:SL)
    pub addr64: u64,
    /// 16-bit network address, `0xFFFE` when unknown
    pub addr16: u16,
}

impl NodeAddress {
    /// Address pair with an unknown 16-bit component
    pub fn from_addr64(addr64: u64) -> Self {
        Self {
            addr64,
            addr16: 0xFFFE,
        }
    }
}

fn checksum(api_payload: &[u8]) -> u8 {
    let sum: u32 = api_payload.iter().map(|b| *b as u32).sum();
    0xFF - (sum & 0xFF) as u8
}

/// Encode an API frame from its type byte and body.
///
/// Always succeeds; bodies here never approach the u16 length limit.
pub fn encode(frame_type: u8, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 5);
    out.push(FRAME_DELIMITER);
    let mut len = [0u8; 2];
    BigEndian::write_u16(&mut len, (body.len() + 1) as u16);
    out.extend_from_slice(&len);
    out.push(frame_type);
    out.extend_from_slice(body);
    out.push(checksum(&out[3..]));
    out
}

/// Decode one complete frame from `buf`.
///
/// `buf` must hold exactly one frame (delimiter through checksum). Returns
/// [`ProtocolError::Malformed`] on a bad delimiter, a length that does not
/// match the consumed bytes, or a checksum failure — never panics.
pub fn decode(buf: &[u8]) -> Result<Frame, ProtocolError> {
    if buf.len() < 5 {
        return Err(ProtocolError::Malformed("frame too short"));
    }
    if buf[0] != FRAME_DELIMITER {
        return Err(ProtocolError::Malformed("missing start delimiter"));
    }
    let declared = BigEndian::read_u16(&buf[1..3]) as usize;
    if declared == 0 || buf.len() != declared + 4 {
        return Err(ProtocolError::Malformed("length mismatch"));
    }
    let api = &buf[3..3 + declared];
    if checksum(api) != buf[3 + declared] {
        return Err(ProtocolError::Malformed("checksum failure"));
    }
    Ok(Frame {
        kind: FrameKind::from_type_byte(api[0]),
        frame_type: api[0],
        payload: api[1..].to_vec(),
    })
}

/// Largest plausible API payload on this link. ND discovery records top
/// out well under this; anything bigger is a corrupt length field.
const MAX_API_PAYLOAD: usize = 256;

/// Incremental frame extractor for a raw serial byte stream.
///
/// Accumulates bytes, skips noise before the next delimiter, and yields one
/// decode attempt per complete frame. A malformed frame is reported once and
/// the stream resynchronizes on the following delimiter. Length fields are
/// bounded so a stray delimiter followed by garbage cannot stall the stream
/// waiting for kilobytes that will never arrive.
#[derive(Debug, Default)]
pub struct Deframer {
    buf: Vec<u8>,
}

impl Deframer {
    /// New empty deframer
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes read from the transport
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pull the next complete frame, if one is buffered
    pub fn next_frame(&mut self) -> Option<Result<Frame, ProtocolError>> {
        // Drop leading noise up to the next delimiter.
        if let Some(start) = self.buf.iter().position(|b| *b == FRAME_DELIMITER) {
            if start > 0 {
                self.buf.drain(..start);
            }
        } else {
            self.buf.clear();
            return None;
        }

        if self.buf.len() < 3 {
            return None;
        }
        let declared = BigEndian::read_u16(&self.buf[1..3]) as usize;
        if declared == 0 || declared > MAX_API_PAYLOAD {
            // Corrupt length after a stray delimiter; drop the delimiter
            // and resync on the next one instead of waiting it out.
            self.buf.drain(..1);
            return Some(Err(ProtocolError::Malformed("implausible frame length")));
        }
        let total = declared + 4;
        if self.buf.len() < total {
            return None;
        }

        let frame: Vec<u8> = self.buf.drain(..total).collect();
        match decode(&frame) {
            Ok(f) => Some(Ok(f)),
            Err(e) => {
                // Push everything after the bad delimiter back so the next
                // call resynchronizes inside it.
                let mut rest: Vec<u8> = frame[1..].to_vec();
                rest.extend_from_slice(&self.buf);
                self.buf = rest;
                Some(Err(e))
            }
        }
    }
}

/// Parsed 0x88 AT command response
#[derive(Debug, Clone)]
pub struct AtResponse {
    /// Echoed frame id
    pub frame_id: u8,
    /// Two-byte AT mnemonic
    pub command: [u8; 2],
    /// Command status, 0x00 = OK
    pub status: u8,
    /// Register value / response payload
    pub value: Vec<u8>,
}

/// Parse the payload of an [`FrameKind::AtResponse`] frame
pub fn parse_at_response(payload: &[u8]) -> Result<AtResponse, ProtocolError> {
    if payload.len() < 4 {
        return Err(ProtocolError::Malformed("AT response too short"));
    }
    Ok(AtResponse {
        frame_id: payload[0],
        command: [payload[1], payload[2]],
        status: payload[3],
        value: payload[4..].to_vec(),
    })
}

/// Inbound application data extracted from a receive packet
#[derive(Debug, Clone)]
pub struct ReceivedData {
    /// Source radio address
    pub source: NodeAddress,
    /// Application payload bytes
    pub data: Vec<u8>,
}

/// Parse the payload of a [`FrameKind::ReceivePacket`] frame.
///
/// The application-data offset depends on the receive variant: 0x90 carries
/// addr64 + addr16 + options, 0x91 adds endpoints, cluster and profile ids.
pub fn parse_receive_packet(frame_type: u8, payload: &[u8]) -> Result<ReceivedData, ProtocolError> {
    let data_offset = match frame_type {
        TYPE_RECEIVE_16 => 11,
        TYPE_RECEIVE_EXPLICIT => 17,
        _ => return Err(ProtocolError::Malformed("not a receive packet")),
    };
    if payload.len() < data_offset {
        return Err(ProtocolError::Malformed("receive packet too short"));
    }
    Ok(ReceivedData {
        source: NodeAddress {
            addr64: BigEndian::read_u64(&payload[0..8]),
            addr16: BigEndian::read_u16(&payload[8..10]),
        },
        data: payload[data_offset..].to_vec(),
    })
}

/// Delivery status from a [`FrameKind::TransmitStatus`] payload, 0x00 = delivered
pub fn parse_transmit_status(payload: &[u8]) -> Result<u8, ProtocolError> {
    // frame id, addr16, retry count, delivery status
    if payload.len() < 5 {
        return Err(ProtocolError::Malformed("transmit status too short"));
    }
    Ok(payload[4])
}

/// Build an AT command request frame
pub fn at_command_frame(mnemonic: [u8; 2]) -> Vec<u8> {
    encode(
        TYPE_AT_COMMAND,
        &[OUTBOUND_FRAME_ID, mnemonic[0], mnemonic[1]],
    )
}

/// Build a transmit request frame addressed to `dest`
pub fn transmit_request_frame(dest: NodeAddress, data: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(13 + data.len());
    body.push(OUTBOUND_FRAME_ID);
    let mut addr64 = [0u8; 8];
    BigEndian::write_u64(&mut addr64, dest.addr64);
    body.extend_from_slice(&addr64);
    let mut addr16 = [0u8; 2];
    BigEndian::write_u16(&mut addr16, dest.addr16);
    body.extend_from_slice(&addr16);
    body.push(0x00); // broadcast radius
    body.push(0x00); // options
    body.extend_from_slice(data);
    encode(TYPE_TRANSMIT_REQUEST, &body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_frame_roundtrip() {
        for (frame_type, body) in [
            (TYPE_AT_COMMAND, vec![0x01, b'N', b'I']),
            (TYPE_RECEIVE_16, vec![0u8; 20]),
            (0x42, b"arbitrary".to_vec()),
        ] {
            let encoded = encode(frame_type, &body);
            let frame = decode(&encoded).expect("should decode");
            assert_eq!(frame.frame_type, frame_type);
            assert_eq!(frame.kind, FrameKind::from_type_byte(frame_type));
            assert_eq!(frame.payload, body);
        }
    }

    #[test]
    fn test_single_byte_corruption_rejected() {
        let encoded = encode(TYPE_AT_COMMAND, &[0x01, b'A', b'I']);
        for i in 3..encoded.len() {
            let mut bad = encoded.clone();
            bad[i] ^= 0x01;
            assert!(decode(&bad).is_err(), "corruption at byte {i} accepted");
        }
    }

    #[test]
    fn test_decode_rejects_bad_delimiter_and_length() {
        let mut encoded = encode(TYPE_AT_COMMAND, &[0x01, b'A', b'I']);
        encoded[0] = 0x7D;
        assert!(decode(&encoded).is_err());

        let mut truncated = encode(TYPE_AT_COMMAND, &[0x01, b'A', b'I']);
        truncated.pop();
        assert!(decode(&truncated).is_err());
    }

    #[test]
    fn test_deframer_resyncs_after_noise() {
        let mut deframer = Deframer::new();
        let frame = encode(TYPE_MODEM_STATUS, &[0x00]);
        deframer.extend(&[0xDE, 0xAD]);
        deframer.extend(&frame);

        let got = deframer.next_frame().expect("frame buffered").unwrap();
        assert_eq!(got.kind, FrameKind::ModemStatus);
        assert!(deframer.next_frame().is_none());
    }

    #[test]
    fn test_deframer_partial_then_complete() {
        let mut deframer = Deframer::new();
        let frame = encode(TYPE_AT_RESPONSE, &[0x01, b'N', b'I', 0x00, b'w']);
        deframer.extend(&frame[..4]);
        assert!(deframer.next_frame().is_none());
        deframer.extend(&frame[4..]);
        let got = deframer.next_frame().expect("complete now").unwrap();
        assert_eq!(got.kind, FrameKind::AtResponse);
    }

    #[test]
    fn test_deframer_reports_bad_checksum_then_recovers() {
        let mut deframer = Deframer::new();
        let mut bad = encode(TYPE_MODEM_STATUS, &[0x00]);
        let last = bad.len() - 1;
        bad[last] ^= 0xFF;
        let good = encode(TYPE_MODEM_STATUS, &[0x06]);
        deframer.extend(&bad);
        deframer.extend(&good);

        assert!(matches!(deframer.next_frame(), Some(Err(_))));
        let got = deframer.next_frame().expect("good frame").unwrap();
        assert_eq!(got.payload, vec![0x06]);
    }

    #[test]
    fn test_deframer_rejects_implausible_length_without_stalling() {
        // A stray delimiter followed by a garbage length field must not
        // leave the stream waiting for kilobytes of phantom payload.
        let mut deframer = Deframer::new();
        deframer.extend(&[FRAME_DELIMITER, 0xFF, 0xFF]);
        deframer.extend(&encode(TYPE_MODEM_STATUS, &[0x06]));

        assert!(matches!(deframer.next_frame(), Some(Err(_))));
        let got = deframer.next_frame().expect("good frame").unwrap();
        assert_eq!(got.kind, FrameKind::ModemStatus);
        assert_eq!(got.payload, vec![0x06]);
        assert!(deframer.next_frame().is_none());
    }

    #[test]
    fn test_deframer_rejects_zero_length() {
        let mut deframer = Deframer::new();
        deframer.extend(&[FRAME_DELIMITER, 0x00, 0x00, 0xFF]);
        assert!(matches!(deframer.next_frame(), Some(Err(_))));
        assert!(deframer.next_frame().is_none());
    }

    #[test]
    fn test_at_response_parse() {
        let frame = decode(&encode(
            TYPE_AT_RESPONSE,
            &[0x01, b'A', b'I', 0x00, 0x00],
        ))
        .unwrap();
        let at = parse_at_response(&frame.payload).unwrap();
        assert_eq!(at.command, *b"AI");
        assert_eq!(at.status, 0x00);
        assert_eq!(at.value, vec![0x00]);
    }

    #[test]
    fn test_receive_packet_offsets() {
        let mut body = vec![0u8; 10];
        BigEndian::write_u64(&mut body[0..8], 0x0013A20012345678);
        BigEndian::write_u16(&mut body[8..10], 0xFFFE);
        body.push(0x00); // options
        body.extend_from_slice(b"clk>3");

        let frame = decode(&encode(TYPE_RECEIVE_16, &body)).unwrap();
        let rx = parse_receive_packet(frame.frame_type, &frame.payload).unwrap();
        assert_eq!(rx.source.addr64, 0x0013A20012345678);
        assert_eq!(rx.data, b"clk>3");
    }

    #[test]
    fn test_transmit_request_frame_shape() {
        let dest = NodeAddress {
            addr64: 0x0013A200AABBCCDD,
            addr16: 0xFFFE,
        };
        let bytes = transmit_request_frame(dest, b"stm>1");
        let frame = decode(&bytes).unwrap();
        assert_eq!(frame.kind, FrameKind::TransmitRequest);
        assert_eq!(frame.payload[0], OUTBOUND_FRAME_ID);
        assert_eq!(&frame.payload[13..], b"stm>1");
    }
}
