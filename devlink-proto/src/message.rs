//! Message kinds, status codes, request types, and the component table.

use std::fmt;

use crate::ProtoError;

/// Distinguishes payload-carrying frames from status-only frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
#[repr(u16)]
pub enum MsgKind {
    /// Carries an application payload.
    Data = 0,
    /// Carries only a status code (handshakes, end markers, errors).
    Ctrl = 1,
}

impl TryFrom<u16> for MsgKind {
    type Error = ProtoError;

    fn try_from(v: u16) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Self::Data),
            1 => Ok(Self::Ctrl),
            other => Err(ProtoError::BadKind(other)),
        }
    }
}

/// Status code carried in every frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[non_exhaustive]
#[repr(u16)]
pub enum MsgStatus {
    /// Success / no error.
    #[default]
    NoError = 0,
    /// Opening handshake of an exchange.
    HandShake = 1,
    /// Data transfer in progress.
    DataProcess = 2,
    /// Data transfer finished.
    DataEnd = 3,
    /// File load started.
    FileLoad = 4,
    /// File load failed.
    FileLoadError = 5,
    /// File load finished.
    FileLoadDone = 6,
    /// File could not be read or written.
    FileError = 7,
    /// Out of memory for a frame.
    MemError = 8,
    /// Destination storage is full.
    NoSpace = 9,
    /// Permission denied on the destination.
    PermissionDenied = 10,
    /// Receiver queue saturated; retry later.
    CacheFull = 11,
}

impl MsgStatus {
    /// Returns `true` for statuses a sender may retry after a pause.
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::CacheFull)
    }
}

impl TryFrom<u16> for MsgStatus {
    type Error = ProtoError;

    fn try_from(v: u16) -> Result<Self, Self::Error> {
        Ok(match v {
            0 => Self::NoError,
            1 => Self::HandShake,
            2 => Self::DataProcess,
            3 => Self::DataEnd,
            4 => Self::FileLoad,
            5 => Self::FileLoadError,
            6 => Self::FileLoadDone,
            7 => Self::FileError,
            8 => Self::MemError,
            9 => Self::NoSpace,
            10 => Self::PermissionDenied,
            11 => Self::CacheFull,
            other => return Err(ProtoError::BadStatus(other)),
        })
    }
}

/// Wire request-type codes understood by the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
#[repr(u16)]
pub enum RequestType {
    /// Run a command on the device.
    ExecCommand = 0,
    /// Push a file from host to device.
    SendFile = 1,
    /// Interactive debug session.
    Debug = 2,
    /// Black-box (crash record) upload.
    Blackbox = 3,
    /// Push a log file to the device log area.
    Log = 4,
    /// Operator dump stream.
    OmeDump = 6,
    /// Directory synchronisation, one file at a time.
    FileSync = 7,
    /// Liveness / version check.
    Detect = 10,
    /// Pull a file from device to host.
    FileGet = 11,
    /// Tensor / core dump stream.
    Dump = 13,
}

impl RequestType {
    /// Wire code of this request type.
    pub const fn code(self) -> u16 {
        self as u16
    }

    /// Looks up a request type by its wire code.
    pub const fn from_code(code: u16) -> Option<Self> {
        Some(match code {
            0 => Self::ExecCommand,
            1 => Self::SendFile,
            2 => Self::Debug,
            3 => Self::Blackbox,
            4 => Self::Log,
            6 => Self::OmeDump,
            7 => Self::FileSync,
            10 => Self::Detect,
            11 => Self::FileGet,
            13 => Self::Dump,
            _ => return None,
        })
    }
}

/// Logical handler a request type resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[non_exhaustive]
pub enum ComponentType {
    /// Version / liveness check.
    Detect,
    /// File push and pull.
    FileTransfer,
    /// Streamed dump chunks.
    Dump,
}

impl ComponentType {
    /// Human-readable component name.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Detect => "detect",
            Self::FileTransfer => "file_transfer",
            Self::Dump => "dump",
        }
    }

    /// Resolves a wire request code through [`DESCRIPTORS`].
    ///
    /// The first matching descriptor wins; unknown codes yield `None`.
    pub fn resolve(code: u16) -> Option<Self> {
        DESCRIPTORS
            .iter()
            .find(|d| d.request.code() == code)
            .map(|d| d.component)
    }
}

impl fmt::Display for ComponentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One row of the static request → component table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub struct Descriptor {
    /// Wire request type.
    pub request: RequestType,
    /// Component handling it.
    pub component: ComponentType,
}

/// Static many-to-one mapping from request types to components.
pub const DESCRIPTORS: &[Descriptor] = &[
    Descriptor {
        request: RequestType::Detect,
        component: ComponentType::Detect,
    },
    Descriptor {
        request: RequestType::SendFile,
        component: ComponentType::FileTransfer,
    },
    Descriptor {
        request: RequestType::FileSync,
        component: ComponentType::FileTransfer,
    },
    Descriptor {
        request: RequestType::Log,
        component: ComponentType::FileTransfer,
    },
    Descriptor {
        request: RequestType::FileGet,
        component: ComponentType::FileTransfer,
    },
    Descriptor {
        request: RequestType::Dump,
        component: ComponentType::Dump,
    },
    Descriptor {
        request: RequestType::OmeDump,
        component: ComponentType::Dump,
    },
    Descriptor {
        request: RequestType::Blackbox,
        component: ComponentType::Dump,
    },
];
