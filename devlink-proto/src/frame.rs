//! Fixed-header frame layout and packet construction.
//!
//! Layout (little-endian):
//!
//! ```text
//! 0  magic u16 | 2 version u8 | 3 order u8 | 4 req_type u16 | 6 dev_id u16
//! 8  total_len u32 | 12 slice_len u32 | 16 offset u32
//! 20 kind u16 | 22 status u16 | 24 payload[slice_len]
//! ```

use crate::message::{MsgKind, MsgStatus};
use crate::{ProtoError, Result};

/// Frame magic constant.
pub const MAGIC: u16 = 0xC396;

/// Protocol version byte.
pub const VERSION: u8 = 0x10;

/// Size of the encoded header in bytes.
pub const HEADER_SIZE: usize = 24;

/// Largest payload slice used by chunked file transfer.
pub const MAX_SLICE: usize = 500_000;

/// Largest payload a stream transport accepts for a single frame (16 MiB).
pub const MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub struct FrameHeader {
    /// Sequence/order byte, reserved.
    pub order: u8,
    /// Raw request-type code.
    pub req_type: u16,
    /// Originating or target device.
    pub dev_id: u16,
    /// Total bytes of the logical message across all slices.
    pub total_len: u32,
    /// Payload bytes carried by this frame.
    pub slice_len: u32,
    /// Byte offset of this slice within the logical message.
    pub offset: u32,
    /// Data or control frame.
    pub kind: MsgKind,
    /// Status code.
    pub status: MsgStatus,
}

impl FrameHeader {
    /// Header for a single-slice data frame of `slice_len` bytes.
    pub const fn data(req_type: u16, dev_id: u16, slice_len: u32) -> Self {
        Self {
            order: 0,
            req_type,
            dev_id,
            total_len: slice_len,
            slice_len,
            offset: 0,
            kind: MsgKind::Data,
            status: MsgStatus::NoError,
        }
    }

    /// Header for a payload-less control frame.
    pub const fn ctrl(req_type: u16, dev_id: u16, status: MsgStatus) -> Self {
        Self {
            order: 0,
            req_type,
            dev_id,
            total_len: 0,
            slice_len: 0,
            offset: 0,
            kind: MsgKind::Ctrl,
            status,
        }
    }

    /// Returns `true` if this is the final slice of its message.
    pub const fn is_last_slice(&self) -> bool {
        self.total_len as u64 == self.slice_len as u64 + self.offset as u64
    }

    /// Encodes the header into its fixed wire representation.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut b = [0u8; HEADER_SIZE];
        b[0..2].copy_from_slice(&MAGIC.to_le_bytes());
        b[2] = VERSION;
        b[3] = self.order;
        b[4..6].copy_from_slice(&self.req_type.to_le_bytes());
        b[6..8].copy_from_slice(&self.dev_id.to_le_bytes());
        b[8..12].copy_from_slice(&self.total_len.to_le_bytes());
        b[12..16].copy_from_slice(&self.slice_len.to_le_bytes());
        b[16..20].copy_from_slice(&self.offset.to_le_bytes());
        b[20..22].copy_from_slice(&(self.kind as u16).to_le_bytes());
        b[22..24].copy_from_slice(&(self.status as u16).to_le_bytes());
        b
    }

    /// Decodes and validates a header from the first [`HEADER_SIZE`] bytes.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let Some(b) = buf.get(..HEADER_SIZE) else {
            return Err(ProtoError::Truncated(buf.len()));
        };
        let u16_at = |i: usize| u16::from_le_bytes([b[i], b[i + 1]]);
        let u32_at = |i: usize| u32::from_le_bytes([b[i], b[i + 1], b[i + 2], b[i + 3]]);

        let magic = u16_at(0);
        if magic != MAGIC {
            return Err(ProtoError::BadMagic(magic));
        }
        if b[2] != VERSION {
            return Err(ProtoError::BadVersion(b[2]));
        }
        Ok(Self {
            order: b[3],
            req_type: u16_at(4),
            dev_id: u16_at(6),
            total_len: u32_at(8),
            slice_len: u32_at(12),
            offset: u32_at(16),
            kind: MsgKind::try_from(u16_at(20))?,
            status: MsgStatus::try_from(u16_at(22))?,
        })
    }
}

/// A header plus its owned payload.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct Frame {
    /// Decoded header; `header.slice_len == payload.len()`.
    pub header: FrameHeader,
    /// Payload bytes.
    pub payload: Vec<u8>,
}

impl Frame {
    /// Builds a payload-less control frame.
    pub const fn ctrl(req_type: u16, dev_id: u16, status: MsgStatus) -> Self {
        Self {
            header: FrameHeader::ctrl(req_type, dev_id, status),
            payload: Vec::new(),
        }
    }

    /// Builds a single-slice data frame owning `payload`.
    pub fn data(req_type: u16, dev_id: u16, payload: Vec<u8>) -> Result<Self> {
        let slice_len = checked_len(payload.len())?;
        Ok(Self {
            header: FrameHeader::data(req_type, dev_id, slice_len),
            payload,
        })
    }

    /// Builds one slice of a multi-slice transfer.
    ///
    /// Fails if the payload does not fit a frame or if the slice would run
    /// past `total_len`.
    pub fn slice(
        req_type: u16,
        dev_id: u16,
        total_len: u32,
        offset: u32,
        payload: Vec<u8>,
    ) -> Result<Self> {
        let slice_len = checked_len(payload.len())?;
        if u64::from(offset) + u64::from(slice_len) > u64::from(total_len) {
            return Err(ProtoError::Overflow(payload.len()));
        }
        let mut header = FrameHeader::data(req_type, dev_id, slice_len);
        header.total_len = total_len;
        header.offset = offset;
        Ok(Self { header, payload })
    }

    /// Number of bytes this frame occupies on the wire.
    pub const fn wire_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// Serializes header and payload into one contiguous buffer.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.wire_len());
        buf.extend_from_slice(&self.header.encode());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Parses one complete frame, taking ownership of the buffer.
    ///
    /// The buffer must hold exactly `HEADER_SIZE + slice_len` bytes.
    pub fn from_bytes(mut buf: Vec<u8>) -> Result<Self> {
        let header = FrameHeader::decode(&buf)?;
        let actual = buf.len() - HEADER_SIZE;
        if actual != header.slice_len as usize {
            return Err(ProtoError::LengthMismatch {
                expected: header.slice_len,
                actual,
            });
        }
        let payload = buf.split_off(HEADER_SIZE);
        Ok(Self { header, payload })
    }
}

/// Returns the wire size of a frame carrying `len` payload bytes.
///
/// `None` when `len > u32::MAX - HEADER_SIZE`, i.e. when the size
/// computation would overflow the 32-bit length fields.
pub fn packet_size(len: usize) -> Option<usize> {
    let len = u32::try_from(len).ok()?;
    #[allow(clippy::cast_possible_truncation)]
    let total = len.checked_add(HEADER_SIZE as u32)?;
    Some(total as usize)
}

/// Validates that `len` fits a frame and returns it as a header field.
fn checked_len(len: usize) -> Result<u32> {
    packet_size(len).ok_or(ProtoError::Overflow(len))?;
    u32::try_from(len).map_err(|_| ProtoError::Overflow(len))
}
