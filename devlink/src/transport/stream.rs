//! Frame I/O over stream file descriptors, shared by the socket transports.

use std::io;
use std::os::fd::BorrowedFd;
use std::time::Duration;

use devlink_proto::{FrameHeader, HEADER_SIZE, MAX_PAYLOAD, ProtoError};

use crate::error::{Error, Result};
use crate::handle::Handle;
use crate::retry::RetryPolicy;
use crate::sys;
use crate::transport::IoMode;

/// Borrows the descriptor of an open fd-backed handle.
pub(super) fn session_fd(handle: &Handle) -> Result<BorrowedFd<'_>> {
    handle
        .fd()
        .ok_or(Error::InvalidHandle("expected an open socket"))
}

/// Maps a socket error, turning EOF and resets into [`Error::Closed`].
fn channel(e: io::Error) -> Error {
    match e.kind() {
        io::ErrorKind::UnexpectedEof
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::BrokenPipe => Error::Closed,
        _ => Error::Channel(e),
    }
}

/// Reads one frame (header, then `slice_len` payload bytes).
pub(super) fn read_frame(fd: BorrowedFd<'_>) -> Result<Vec<u8>> {
    let mut head = [0u8; HEADER_SIZE];
    sys::read_exact(fd, &mut head).map_err(channel)?;
    let header = FrameHeader::decode(&head)?;
    let len = header.slice_len as usize;
    if len > MAX_PAYLOAD {
        return Err(ProtoError::Overflow(len).into());
    }
    let mut buf = Vec::new();
    buf.try_reserve_exact(HEADER_SIZE + len)
        .map_err(|_| Error::Alloc(HEADER_SIZE + len))?;
    buf.extend_from_slice(&head);
    buf.resize(HEADER_SIZE + len, 0);
    sys::read_exact(fd, &mut buf[HEADER_SIZE..]).map_err(channel)?;
    Ok(buf)
}

/// Reads a frame in `mode`, polling within `retry` when non-blocking.
pub(super) fn read_mode(fd: BorrowedFd<'_>, mode: IoMode, retry: &RetryPolicy) -> Result<Vec<u8>> {
    match mode {
        IoMode::Blocking => read_frame(fd),
        IoMode::NonBlocking => retry.run(|| {
            if sys::readable(fd, 0).map_err(Error::Channel)? {
                read_frame(fd).map(Some)
            } else {
                Ok(None)
            }
        }),
    }
}

/// Polls `fd` for up to `timeout`; `true` once it is readable or hung up.
pub(super) fn wait_readable(fd: BorrowedFd<'_>, timeout: Duration) -> Result<bool> {
    let ms = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
    sys::readable(fd, ms).map_err(Error::Channel)
}

/// Writes one complete frame.
pub(super) fn write_frame(fd: BorrowedFd<'_>, frame: &[u8]) -> Result<()> {
    sys::write_all(fd, frame).map_err(channel)
}
