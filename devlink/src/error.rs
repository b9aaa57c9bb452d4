//! Error types for devlink operations.

use std::io;

use devlink_proto::{ComponentType, MsgStatus, ProtoError};

use crate::handle::TransportKind;

/// Alias for `Result<T, devlink::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by transports, the codec, and the server.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// No transport is registered for this kind.
    #[error("transport {0} is not registered")]
    Unregistered(TransportKind),

    /// The handle is closed, invalid, or of the wrong role.
    #[error("invalid handle: {0}")]
    InvalidHandle(&'static str),

    /// The transport failed to move bytes.
    #[error("channel error: {0}")]
    Channel(#[source] io::Error),

    /// The peer closed the session.
    #[error("peer closed the connection")]
    Closed,

    /// A non-blocking read saw no data within its retry budget.
    #[error("no data after {attempts} read attempts")]
    ReadTimeout {
        /// Number of read attempts made.
        attempts: u32,
    },

    /// Malformed or oversized frame.
    #[error(transparent)]
    Protocol(#[from] ProtoError),

    /// Peer reported its queue as full; the request may be retried.
    #[error("peer queue is full")]
    CacheFull,

    /// Peer kept reporting a full queue past the retry budget.
    #[error("peer queue stayed full for {attempts} attempts")]
    Backpressure {
        /// Number of sends attempted.
        attempts: u32,
    },

    /// Peer answered with a failure status.
    #[error("peer rejected the request: {0:?}")]
    Rejected(MsgStatus),

    /// A data frame arrived where a control frame was expected.
    #[error("unexpected data frame where a response was expected")]
    UnexpectedData,

    /// Frame buffer could not be allocated.
    #[error("cannot allocate {0} bytes for a frame")]
    Alloc(usize),

    /// A component of this type is already registered.
    #[error("component {0} is already registered")]
    DuplicateComponent(ComponentType),

    /// Server started without a required collaborator.
    #[error("server not ready: {0}")]
    NotReady(&'static str),

    /// The multiplexer's event table is full.
    #[error("event table full ({0} entries)")]
    TableFull(usize),

    /// A requested path escapes its base directory.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// Configuration file could not be parsed.
    #[error("config: {0}")]
    Config(#[from] serde_json::Error),

    /// Local filesystem or OS error.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Wire status reported to the peer for this failure.
    pub fn status(&self) -> MsgStatus {
        match self {
            Self::CacheFull | Self::Backpressure { .. } => MsgStatus::CacheFull,
            Self::Alloc(_) => MsgStatus::MemError,
            Self::Rejected(s) => *s,
            Self::InvalidPath(_) => MsgStatus::PermissionDenied,
            Self::Io(e) | Self::Channel(e) => match e.kind() {
                io::ErrorKind::StorageFull => MsgStatus::NoSpace,
                io::ErrorKind::PermissionDenied => MsgStatus::PermissionDenied,
                io::ErrorKind::OutOfMemory => MsgStatus::MemError,
                _ => MsgStatus::FileError,
            },
            _ => MsgStatus::FileError,
        }
    }
}
