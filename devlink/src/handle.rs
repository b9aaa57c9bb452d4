//! Ownership-tagged connection handles.
//!
//! A [`Handle`] pairs a transport-specific resource with its
//! [`TransportKind`] and [`Role`]. Handles are not `Clone`: exactly one
//! owner closes each one, and a closed handle is distinguishable from one
//! that was never valid.

use std::fmt;
#[cfg(unix)]
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Identifies a transport implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum TransportKind {
    /// In-process channel transport.
    Local,
    /// Unix domain stream sockets.
    Unix,
    /// AF_VSOCK stream sockets.
    Vsock,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Local => "local",
            Self::Unix => "unix",
            Self::Vsock => "vsock",
        })
    }
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "unix" => Ok(Self::Unix),
            "vsock" => Ok(Self::Vsock),
            _ => Err(format!("unknown transport kind: {s}")),
        }
    }
}

/// What a handle refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Role {
    /// Listening endpoint.
    Server,
    /// Unconnected client context.
    Client,
    /// Established session.
    Session,
}

/// Transport-specific resource behind an open handle.
#[derive(Debug)]
#[non_exhaustive]
pub enum Resource {
    /// An OS file descriptor.
    #[cfg(unix)]
    Fd(OwnedFd),
    /// An opaque identifier interpreted by the owning transport.
    Token(u64),
}

/// Lifecycle of a handle.
#[derive(Debug)]
enum State {
    /// Holds a live resource.
    Open(Resource),
    /// Was open and has been closed.
    Closed,
    /// Never referred to anything.
    Invalid,
}

/// Ownership-tagged reference to a listening endpoint, client, or session.
#[derive(Debug)]
pub struct Handle {
    /// Transport that created the handle.
    kind: TransportKind,
    /// Endpoint role.
    role: Role,
    /// Open / closed / invalid.
    state: State,
}

impl Handle {
    /// Wraps an open file descriptor.
    #[cfg(unix)]
    pub fn from_fd(kind: TransportKind, role: Role, fd: OwnedFd) -> Self {
        Self {
            kind,
            role,
            state: State::Open(Resource::Fd(fd)),
        }
    }

    /// Wraps a transport-interpreted token.
    pub const fn from_token(kind: TransportKind, role: Role, token: u64) -> Self {
        Self {
            kind,
            role,
            state: State::Open(Resource::Token(token)),
        }
    }

    /// The "invalid handle" sentinel.
    pub const fn invalid(kind: TransportKind, role: Role) -> Self {
        Self {
            kind,
            role,
            state: State::Invalid,
        }
    }

    /// Transport kind that owns this handle.
    pub const fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Role of this handle.
    pub const fn role(&self) -> Role {
        self.role
    }

    /// Returns `true` while the handle holds a live resource.
    pub const fn is_open(&self) -> bool {
        matches!(self.state, State::Open(_))
    }

    /// Returns `true` once the handle has been closed.
    pub const fn is_closed(&self) -> bool {
        matches!(self.state, State::Closed)
    }

    /// Returns `true` for the invalid sentinel.
    pub const fn is_invalid(&self) -> bool {
        matches!(self.state, State::Invalid)
    }

    /// Numeric identity used as a multiplexer token.
    pub fn raw_id(&self) -> Option<i64> {
        match &self.state {
            #[cfg(unix)]
            State::Open(Resource::Fd(fd)) => Some(i64::from(fd.as_raw_fd())),
            #[allow(clippy::cast_possible_wrap)]
            State::Open(Resource::Token(t)) => Some(*t as i64),
            State::Closed | State::Invalid => None,
        }
    }

    /// Borrows the descriptor of an open fd-backed handle.
    #[cfg(unix)]
    pub fn fd(&self) -> Option<BorrowedFd<'_>> {
        match &self.state {
            State::Open(Resource::Fd(fd)) => Some(fd.as_fd()),
            _ => None,
        }
    }

    /// Token of an open token-backed handle.
    pub const fn token(&self) -> Option<u64> {
        match &self.state {
            State::Open(Resource::Token(t)) => Some(*t),
            _ => None,
        }
    }

    /// Takes the resource out and marks the handle closed.
    ///
    /// Returns `None` when the handle was already closed or invalid, which
    /// makes closing idempotent.
    pub fn release(&mut self) -> Option<Resource> {
        match std::mem::replace(&mut self.state, State::Closed) {
            State::Open(r) => Some(r),
            State::Invalid => {
                self.state = State::Invalid;
                None
            }
            State::Closed => None,
        }
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.raw_id() {
            Some(id) => write!(f, "{}:{:?}#{id}", self.kind, self.role),
            None if self.is_closed() => write!(f, "{}:{:?}#closed", self.kind, self.role),
            None => write!(f, "{}:{:?}#invalid", self.kind, self.role),
        }
    }
}
