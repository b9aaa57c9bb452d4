//! Frame exchange on top of a [`Conn`]: packets, handshakes, responses, and
//! chunked file transfer.
//!
//! The codec is stateless across exchanges. A handshake goes
//! `IDLE → HANDSHAKE_SENT → ACK | NACK | TIMEOUT`; a file send goes
//! `IDLE → SENDING(1..n) → AWAITING_ACK → DONE | FAILED`. Anything needed to
//! resume after a failure is the caller's business.

use std::fs::File;
use std::io::{self, Read, Write};
use std::thread;

use devlink_proto::{Frame, MAX_SLICE, MsgKind, MsgStatus, ProtoError, packet_size};
use tracing::{debug, warn};

use crate::conn::Conn;
use crate::error::{Error, Result};
use crate::retry::Backoff;
use crate::transport::IoMode;

/// Outcome of [`send_file`] / [`send_reader`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct SendSummary {
    /// Payload bytes sent.
    pub bytes: u64,
    /// Slices sent.
    pub slices: u32,
}

/// Outcome of [`recv_file`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct RecvSummary {
    /// Payload bytes written to the destination.
    pub bytes: u64,
    /// Data slices received.
    pub slices: u32,
    /// Status of a control frame that ended the transfer early.
    pub aborted: Option<MsgStatus>,
}

/// Builds a single-slice data frame carrying a copy of `payload`.
///
/// Fails closed with [`ProtoError::Overflow`] when the frame size would not
/// fit the 32-bit length fields, and with [`Error::Alloc`] when the buffer
/// cannot be allocated.
pub fn create_packet(req_type: u16, dev_id: u16, payload: &[u8]) -> Result<Frame> {
    frame_len(payload.len())?;
    let buf = alloc_copy(payload)?;
    Ok(Frame::data(req_type, dev_id, buf)?)
}

/// Wire size of a frame carrying `len` payload bytes, or an overflow error.
fn frame_len(len: usize) -> Result<usize> {
    Ok(packet_size(len).ok_or(ProtoError::Overflow(len))?)
}

/// Copies `data` into a freshly reserved buffer.
fn alloc_copy(data: &[u8]) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(data.len())
        .map_err(|_| Error::Alloc(data.len()))?;
    buf.extend_from_slice(data);
    Ok(buf)
}

/// Writes one frame; returns the number of bytes handed to the transport.
pub fn send_frame(conn: &Conn, frame: &Frame) -> Result<usize> {
    let bytes = frame.to_bytes();
    conn.write_bytes(&bytes).map_err(|e| match e {
        Error::Io(io) => Error::Channel(io),
        other => other,
    })?;
    Ok(bytes.len())
}

/// Reads and parses one frame.
pub fn recv_frame(conn: &Conn, mode: IoMode) -> Result<Frame> {
    Ok(Frame::from_bytes(conn.read_bytes(mode)?)?)
}

/// Sends `data` as one data frame with `status`.
pub fn send_buffer(conn: &Conn, req_type: u16, status: MsgStatus, data: &[u8]) -> Result<()> {
    let mut frame = create_packet(req_type, conn.device(), data)?;
    frame.header.status = status;
    send_frame(conn, &frame)?;
    Ok(())
}

/// Sends a payload-less control frame.
pub fn send_response(conn: &Conn, req_type: u16, status: MsgStatus) -> Result<()> {
    send_frame(conn, &Frame::ctrl(req_type, conn.device(), status))?;
    Ok(())
}

/// Reads one control frame and maps its status.
///
/// `NoError` is success, `CacheFull` is [`Error::CacheFull`], any other
/// status is [`Error::Rejected`], and a data frame is
/// [`Error::UnexpectedData`].
pub fn recv_response(conn: &Conn, mode: IoMode) -> Result<()> {
    let frame = recv_frame(conn, mode)?;
    check_response(&frame)
}

/// Maps a frame expected to be a response.
pub fn check_response(frame: &Frame) -> Result<()> {
    match (frame.header.kind, frame.header.status) {
        (MsgKind::Ctrl, MsgStatus::NoError) => Ok(()),
        (MsgKind::Ctrl, MsgStatus::CacheFull) => Err(Error::CacheFull),
        (MsgKind::Ctrl, status) => Err(Error::Rejected(status)),
        _ => Err(Error::UnexpectedData),
    }
}

/// Opens an exchange: sends `payload` with status `HandShake` and waits for
/// the peer's response.
pub fn handshake(conn: &Conn, req_type: u16, payload: &[u8]) -> Result<()> {
    send_buffer(conn, req_type, MsgStatus::HandShake, payload)?;
    recv_response(conn, IoMode::NonBlocking)
}

/// Sends a whole file in slices of at most [`MAX_SLICE`] bytes, then waits
/// for the peer's acknowledgement.
///
/// Every slice is stamped with the connection's device id
/// ([`Conn::device`]); bind it with [`Conn::with_device`] before sending.
pub fn send_file(conn: &Conn, req_type: u16, file: &mut File) -> Result<SendSummary> {
    let len = file.metadata()?.len();
    let total = u32::try_from(len)
        .map_err(|_| ProtoError::Overflow(usize::try_from(len).unwrap_or(usize::MAX)))?;
    send_reader(conn, req_type, file, total)
}

/// Sends `total` bytes from `reader` as a sliced transfer, stamped with
/// [`Conn::device`] like [`send_file`].
///
/// A source that runs dry early ends the transfer with a `DataEnd` control
/// frame instead of an error. An empty source is sent as one empty slice.
pub fn send_reader<R: Read + ?Sized>(
    conn: &Conn,
    req_type: u16,
    reader: &mut R,
    total: u32,
) -> Result<SendSummary> {
    let mut summary = SendSummary::default();
    let mut offset: u32 = 0;
    loop {
        let want = MAX_SLICE.min((total - offset) as usize);
        let mut buf = Vec::new();
        buf.try_reserve_exact(want).map_err(|_| Error::Alloc(want))?;
        buf.resize(want, 0);
        let n = fill(reader, &mut buf)?;
        if n == 0 && want > 0 {
            debug!(offset, total, "source ended early");
            send_response(conn, req_type, MsgStatus::DataEnd)?;
            break;
        }
        buf.truncate(n);
        let frame = Frame::slice(req_type, conn.device(), total, offset, buf)?;
        send_frame(conn, &frame)?;
        summary.slices += 1;
        summary.bytes += n as u64;
        #[allow(clippy::cast_possible_truncation)]
        {
            offset += n as u32;
        }
        if offset == total {
            break;
        }
    }
    recv_response(conn, IoMode::Blocking)?;
    Ok(summary)
}

/// Reads until `buf` is full or the source is exhausted.
fn fill<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Receives a sliced transfer into `dest` and acknowledges it.
///
/// A control frame mid-transfer ends the transfer early and successfully;
/// it is acknowledged only when it is `DataEnd`. A failed write is
/// reported to the peer before the error is returned.
pub fn recv_file<W: Write + ?Sized>(conn: &Conn, dest: &mut W) -> Result<RecvSummary> {
    let mut summary = RecvSummary::default();
    loop {
        let frame = recv_frame(conn, IoMode::NonBlocking)?;
        let h = frame.header;
        if h.kind == MsgKind::Ctrl {
            debug!(status = ?h.status, bytes = summary.bytes, "transfer ended by peer");
            summary.aborted = Some(h.status);
            if h.status == MsgStatus::DataEnd {
                dest.flush()?;
                send_response(conn, h.req_type, MsgStatus::NoError)?;
            }
            return Ok(summary);
        }

        let len = frame.payload.len();
        if len > MAX_SLICE {
            warn!(len, "dropping oversized slice");
        } else if len > 0 {
            if let Err(e) = dest.write_all(&frame.payload) {
                return Err(courtesy(conn, h.req_type, e.into()));
            }
            summary.bytes += len as u64;
        }
        summary.slices += 1;

        if h.is_last_slice() {
            if let Err(e) = dest.flush() {
                return Err(courtesy(conn, h.req_type, e.into()));
            }
            send_response(conn, h.req_type, MsgStatus::NoError)?;
            return Ok(summary);
        }
    }
}

/// Tells the peer why the transfer failed, then hands back the error.
fn courtesy(conn: &Conn, req_type: u16, err: Error) -> Error {
    if let Err(e) = send_response(conn, req_type, err.status()) {
        warn!(error = %e, "failed to report transfer failure");
    }
    err
}

/// Sends `frame` until the peer stops answering cache-full.
///
/// Sleeps [`Backoff::interval`] between attempts and gives up with
/// [`Error::Backpressure`] after [`Backoff::attempts`] sends.
pub fn send_with_backoff(conn: &Conn, frame: &Frame, backoff: Backoff) -> Result<()> {
    for attempt in 1..=backoff.attempts {
        send_frame(conn, frame)?;
        match recv_response(conn, IoMode::NonBlocking) {
            Err(Error::CacheFull) => {
                debug!(attempt, "peer queue full, backing off");
                if attempt < backoff.attempts {
                    thread::sleep(backoff.interval());
                }
            }
            other => return other,
        }
    }
    Err(Error::Backpressure {
        attempts: backoff.attempts,
    })
}
