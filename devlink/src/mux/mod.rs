//! Readiness multiplexing over connection handles.

#[cfg(unix)]
mod poll;

use std::fmt;
use std::ops::BitOr;
use std::time::Duration;

#[cfg(unix)]
pub use poll::PollMux;
use tracing::{error, warn};

use crate::error::{Error, Result};
use crate::handle::Handle;

/// Closed set of readiness conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Interest(u8);

impl Interest {
    /// No condition.
    pub const NONE: Self = Self(0);
    /// A listening endpoint has a connection to accept.
    pub const CONNECT: Self = Self(0b001);
    /// A session has data to read.
    pub const DATA: Self = Self(0b010);
    /// The peer hung up or the handle failed.
    pub const HANGUP: Self = Self(0b100);

    /// Returns `true` if every bit of `other` is set.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    /// Returns `true` if no bit is set.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Removes the bits of `other`.
    #[must_use]
    pub const fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }
}

impl BitOr for Interest {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Display for Interest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Self::CONNECT, "connect"),
            (Self::DATA, "data"),
            (Self::HANGUP, "hangup"),
        ];
        let mut first = true;
        for (bit, name) in names {
            if self.contains(bit) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        if first {
            f.write_str("none")?;
        }
        Ok(())
    }
}

/// One ready handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub struct Event {
    /// [`Handle::raw_id`] of the ready handle.
    pub token: i64,
    /// Conditions that fired.
    pub ready: Interest,
}

impl Event {
    /// Creates an event.
    pub const fn new(token: i64, ready: Interest) -> Self {
        Self { token, ready }
    }
}

/// Condition reported to [`Multiplexer::error_handle`].
#[derive(Debug)]
#[non_exhaustive]
pub enum Fault<'a> {
    /// The low-level wait failed.
    Wait(&'a Error),
    /// An event other than connection-ready (hang-up, stray data).
    Event(Event),
}

/// Readiness notification over a fixed-capacity table of handles.
pub trait Multiplexer: Send + fmt::Debug {
    /// Starts watching `handle` for `interest`, or widens an existing watch.
    fn add(&mut self, handle: &Handle, interest: Interest) -> Result<()>;

    /// Stops watching `interest` on `handle`; an empty watch is removed.
    fn del(&mut self, handle: &Handle, interest: Interest) -> Result<()>;

    /// Waits up to `timeout` and fills `events` with at most `capacity`
    /// ready handles. Returns the number of events.
    fn wait(&mut self, events: &mut Vec<Event>, capacity: usize, timeout: Duration)
    -> Result<usize>;

    /// Reports a non-fatal fault. The default implementation logs it.
    fn error_handle(&mut self, fault: Fault<'_>) {
        match fault {
            Fault::Wait(e) => error!(error = %e, "multiplexer wait failed"),
            Fault::Event(ev) => warn!(token = ev.token, ready = %ev.ready, "unexpected event"),
        }
    }

    /// Drops every watch. Later `add` calls fail.
    fn destroy(&mut self);

    /// Size of the event table.
    fn capacity(&self) -> usize;
}
