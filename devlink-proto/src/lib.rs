//! Wire format for devlink device↔host communication.
//!
//! Every message is one frame: a fixed 24-byte little-endian
//! [`FrameHeader`] followed by `slice_len` bytes of payload. Control
//! frames ([`MsgKind::Ctrl`]) carry only a [`MsgStatus`]; data frames
//! ([`MsgKind::Data`]) carry an application payload, possibly one slice of
//! a larger file transfer.

mod chunk;
mod frame;
mod message;

pub use chunk::{ChunkPayload, LAST_CHUNK};
pub use frame::{
    Frame, FrameHeader, HEADER_SIZE, MAGIC, MAX_PAYLOAD, MAX_SLICE, VERSION, packet_size,
};
pub use message::{ComponentType, DESCRIPTORS, Descriptor, MsgKind, MsgStatus, RequestType};

/// Result type for wire-format operations.
pub type Result<T> = std::result::Result<T, ProtoError>;

/// Errors raised while building or parsing frames.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum ProtoError {
    /// Header magic did not match [`MAGIC`].
    #[error("bad magic {0:#06x}")]
    BadMagic(u16),

    /// Header version did not match [`VERSION`].
    #[error("unsupported protocol version {0:#04x}")]
    BadVersion(u8),

    /// Fewer bytes than a header were supplied.
    #[error("truncated header: {0} bytes")]
    Truncated(usize),

    /// The header's slice length disagrees with the bytes received.
    #[error("length mismatch: header says {expected} payload bytes, got {actual}")]
    LengthMismatch {
        /// Payload length declared by the header.
        expected: u32,
        /// Payload length actually present.
        actual: usize,
    },

    /// Payload length does not fit into a frame.
    #[error("payload of {0} bytes overflows the frame size")]
    Overflow(usize),

    /// Unknown message kind discriminant.
    #[error("unknown message kind {0}")]
    BadKind(u16),

    /// Unknown status discriminant.
    #[error("unknown status code {0}")]
    BadStatus(u16),

    /// A dump chunk payload could not be decoded.
    #[error("malformed dump chunk: {0}")]
    BadChunk(&'static str),
}
