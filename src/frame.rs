//! Wire framing for the tunnel protocol.
//!
//! Every frame on the TCP stream starts with a fixed 56-byte header:
//!
//! ```text
//! ┌──────┬──────────┬─────────────┬──────────┬────────────┐
//! │ Type │ Reserved │ Data length │    IV    │    HMAC    │
//! │ (1)  │   (3)    │  (4, BE)    │   (16)   │    (32)    │
//! └──────┴──────────┴─────────────┴──────────┴────────────┘
//! ```
//!
//! followed by `data_length` payload bytes. The HMAC covers the payload
//! only. The decoder accumulates stream bytes and yields complete frames;
//! a declared payload larger than [`MAX_FRAME_PAYLOAD`] is fatal to the
//! connection and is rejected before any payload allocation.

use crate::error::FrameError;
use bytes::{BufMut, Bytes, BytesMut};

/// Fixed header size on the wire.
pub const HEADER_SIZE: usize = 56;

/// Header IV field size (AES block size).
pub const HEADER_IV_SIZE: usize = 16;

/// HMAC-SHA-256 digest size.
pub const HMAC_SIZE: usize = 32;

/// Maximum accepted frame payload. Anything larger closes the connection.
pub const MAX_FRAME_PAYLOAD: u32 = 65536;

/// Plaintext carried by keepalive probes.
pub const KEEPALIVE_MAGIC: [u8; 4] = [0xDE, 0xAD, 0xBE, 0xEF];

/// Frame types multiplexed over the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    /// Client handshake opener, payload is the 16-byte key salt.
    AuthRequest = 0x01,
    /// Legacy success response, tolerated and treated like `AuthSuccess`.
    AuthResponse = 0x02,
    /// Server handshake acknowledgement, empty payload.
    AuthSuccess = 0x03,
    /// Handshake rejection.
    AuthFailed = 0x04,
    /// Encrypted IP packet (or encrypted keepalive probe).
    Data = 0x10,
    /// Bare liveness probe, no payload semantics.
    Keepalive = 0x20,
}

impl PacketType {
    /// Convert from the wire byte. Unknown values yield `None`; the bridge
    /// logs and drops those frames.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Self::AuthRequest),
            0x02 => Some(Self::AuthResponse),
            0x03 => Some(Self::AuthSuccess),
            0x04 => Some(Self::AuthFailed),
            0x10 => Some(Self::Data),
            0x20 => Some(Self::Keepalive),
            _ => None,
        }
    }

    /// Convert to the wire byte.
    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}

/// Parsed fixed-size frame header.
///
/// `packet_type` stays a raw byte here so frames with unknown types can
/// still be framed (and then dropped) without desynchronizing the stream.
#[derive(Debug, Clone)]
pub struct FrameHeader {
    pub packet_type: u8,
    pub data_length: u32,
    pub iv: [u8; HEADER_IV_SIZE],
    pub hmac: [u8; HMAC_SIZE],
}

impl FrameHeader {
    /// Parse a header from the first [`HEADER_SIZE`] bytes of `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self, FrameError> {
        if buf.len() < HEADER_SIZE {
            return Err(FrameError::ShortHeader(buf.len()));
        }

        let data_length = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let mut iv = [0u8; HEADER_IV_SIZE];
        iv.copy_from_slice(&buf[8..24]);
        let mut hmac = [0u8; HMAC_SIZE];
        hmac.copy_from_slice(&buf[24..56]);

        Ok(Self {
            packet_type: buf[0],
            data_length,
            iv,
            hmac,
        })
    }

    /// Serialize the header into `buf` (reserved bytes are zero).
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.reserve(HEADER_SIZE);
        buf.put_u8(self.packet_type);
        buf.put_bytes(0, 3);
        buf.put_u32(self.data_length);
        buf.put_slice(&self.iv);
        buf.put_slice(&self.hmac);
    }
}

/// One complete frame as read from (or written to) the wire.
#[derive(Debug, Clone)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Bytes,
}

impl Frame {
    /// Frame type, if the wire byte is a known type.
    pub fn packet_type(&self) -> Option<PacketType> {
        PacketType::from_byte(self.header.packet_type)
    }

    /// Total size of this frame on the wire.
    pub fn wire_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

/// Build a complete wire frame from its parts.
pub fn encode_frame(
    packet_type: PacketType,
    iv: &[u8; HEADER_IV_SIZE],
    hmac: &[u8; HMAC_SIZE],
    payload: &[u8],
) -> Bytes {
    let header = FrameHeader {
        packet_type: packet_type.as_byte(),
        data_length: payload.len() as u32,
        iv: *iv,
        hmac: *hmac,
    };

    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    header.encode_into(&mut buf);
    buf.put_slice(payload);
    buf.freeze()
}

/// Incremental frame decoder over a TCP byte stream.
///
/// Feed it reads of any size; it yields complete frames in order and keeps
/// partial trailing bytes buffered for the next read.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append stream bytes to the decode buffer.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pop the next complete frame, if one is buffered.
    ///
    /// The payload length is validated against [`MAX_FRAME_PAYLOAD`] as soon
    /// as the header is available, before any of the body has arrived.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        if self.buf.len() < HEADER_SIZE {
            return Ok(None);
        }

        let header = FrameHeader::decode(&self.buf)?;
        if header.data_length > MAX_FRAME_PAYLOAD {
            return Err(FrameError::OversizedPayload {
                len: header.data_length,
                max: MAX_FRAME_PAYLOAD,
            });
        }

        let total = HEADER_SIZE + header.data_length as usize;
        if self.buf.len() < total {
            return Ok(None);
        }

        let mut frame_bytes = self.buf.split_to(total);
        let payload = frame_bytes.split_off(HEADER_SIZE).freeze();
        Ok(Some(Frame { header, payload }))
    }

    /// Bytes currently buffered (complete or partial frames).
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}
