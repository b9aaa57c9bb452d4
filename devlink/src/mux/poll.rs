//! `poll(2)` multiplexer for fd-backed handles.

use std::os::fd::{AsRawFd, RawFd};
use std::time::Duration;

use nix::poll::PollFlags;

use crate::error::{Error, Result};
use crate::handle::Handle;
use crate::mux::{Event, Interest, Multiplexer};
use crate::sys;

/// One watched descriptor.
#[derive(Debug, Clone, Copy)]
struct Watch {
    /// Watched descriptor; owned by the caller's handle.
    fd: RawFd,
    /// Requested conditions.
    interest: Interest,
}

/// Fixed-capacity `poll(2)` table.
///
/// Readable maps to [`Interest::CONNECT`] on handles watched for connections
/// and to [`Interest::DATA`] otherwise; `POLLHUP`, `POLLERR` and `POLLNVAL`
/// map to [`Interest::HANGUP`]. Other native bits are dropped.
#[derive(Debug)]
pub struct PollMux {
    /// Watched descriptors, at most `capacity`.
    watches: Vec<Watch>,
    /// Table size.
    capacity: usize,
    /// Set by [`Multiplexer::destroy`].
    destroyed: bool,
}

impl PollMux {
    /// Creates a table for up to `capacity` handles.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            watches: Vec::with_capacity(capacity),
            capacity,
            destroyed: false,
        }
    }

    /// Number of watched handles.
    pub fn len(&self) -> usize {
        self.watches.len()
    }

    /// Returns `true` when nothing is watched.
    pub fn is_empty(&self) -> bool {
        self.watches.is_empty()
    }

    /// Descriptor behind `handle`.
    fn raw(handle: &Handle) -> Result<RawFd> {
        handle
            .fd()
            .map(|fd| fd.as_raw_fd())
            .ok_or(Error::InvalidHandle("poll multiplexer needs an open fd"))
    }

    /// Translates native `revents` into the closed interest set.
    fn translate(revents: libc::c_short, interest: Interest) -> Interest {
        let flags = PollFlags::from_bits_truncate(revents);
        let mut ready = Interest::NONE;
        if flags.contains(PollFlags::POLLIN) {
            ready = ready
                | if interest.contains(Interest::CONNECT) {
                    Interest::CONNECT
                } else {
                    Interest::DATA
                };
        }
        if flags.intersects(PollFlags::POLLHUP | PollFlags::POLLERR | PollFlags::POLLNVAL) {
            ready = ready | Interest::HANGUP;
        }
        ready
    }
}

impl Multiplexer for PollMux {
    fn add(&mut self, handle: &Handle, interest: Interest) -> Result<()> {
        if self.destroyed {
            return Err(Error::NotReady("multiplexer destroyed"));
        }
        let fd = Self::raw(handle)?;
        if let Some(w) = self.watches.iter_mut().find(|w| w.fd == fd) {
            w.interest = w.interest | interest;
            return Ok(());
        }
        if self.watches.len() >= self.capacity {
            return Err(Error::TableFull(self.capacity));
        }
        self.watches.push(Watch { fd, interest });
        Ok(())
    }

    fn del(&mut self, handle: &Handle, interest: Interest) -> Result<()> {
        let fd = Self::raw(handle)?;
        if let Some(i) = self.watches.iter().position(|w| w.fd == fd) {
            let left = self.watches[i].interest.without(interest);
            if left.is_empty() {
                self.watches.swap_remove(i);
            } else {
                self.watches[i].interest = left;
            }
        }
        Ok(())
    }

    fn wait(
        &mut self,
        events: &mut Vec<Event>,
        capacity: usize,
        timeout: Duration,
    ) -> Result<usize> {
        events.clear();
        let mut fds: Vec<libc::pollfd> = self
            .watches
            .iter()
            .map(|w| libc::pollfd {
                fd: w.fd,
                events: libc::POLLIN,
                revents: 0,
            })
            .collect();
        let timeout_ms = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
        let hits = sys::poll(&mut fds, timeout_ms).map_err(Error::Channel)?;
        if hits == 0 {
            return Ok(0);
        }
        let limit = capacity.min(self.capacity);
        for (pfd, watch) in fds.iter().zip(&self.watches) {
            if events.len() >= limit {
                break;
            }
            let ready = Self::translate(pfd.revents, watch.interest);
            if !ready.is_empty() {
                events.push(Event {
                    token: i64::from(watch.fd),
                    ready,
                });
            }
        }
        Ok(events.len())
    }

    fn destroy(&mut self) {
        self.watches.clear();
        self.destroyed = true;
    }

    fn capacity(&self) -> usize {
        self.capacity
    }
}
