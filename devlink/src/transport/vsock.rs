//! AF_VSOCK stream transport for guest↔host links.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::handle::{Handle, Role, TransportKind};
use crate::retry::RetryPolicy;
use crate::sys;
use crate::transport::{IoMode, OpenParams, Transport, stream};

/// CID of the host as seen from a guest.
pub const HOST_CID: u32 = 2;

/// Device `n` listens on `base_port + n`; peers are addressed by CID.
#[derive(Debug)]
pub struct VsockTransport {
    /// Port of device 0.
    base_port: u32,
    /// Budget for non-blocking reads.
    retry: RetryPolicy,
    /// Source of client-context tokens.
    next_client: AtomicU64,
}

impl VsockTransport {
    /// Creates a transport whose device ports start at `base_port`.
    pub fn new(base_port: u32) -> Self {
        Self::with_retry(base_port, RetryPolicy::default())
    }

    /// Creates a transport with a custom non-blocking read budget.
    pub const fn with_retry(base_port: u32, retry: RetryPolicy) -> Self {
        Self {
            base_port,
            retry,
            next_client: AtomicU64::new(1),
        }
    }

    /// Port serving the device named in `params`.
    pub fn port(&self, params: &OpenParams) -> Result<u32> {
        let device = params
            .device()
            .ok_or(Error::InvalidHandle("missing device id"))?;
        self.base_port
            .checked_add(u32::from(device))
            .ok_or(Error::InvalidHandle("device port out of range"))
    }
}

impl Transport for VsockTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Vsock
    }

    fn open_server(&self, params: &OpenParams) -> Result<Handle> {
        let fd = sys::vsock_listen(self.port(params)?).map_err(Error::Channel)?;
        Ok(Handle::from_fd(TransportKind::Vsock, Role::Server, fd))
    }

    fn open_client(&self, _params: &OpenParams) -> Result<Handle> {
        let token = self.next_client.fetch_add(1, Ordering::Relaxed);
        Ok(Handle::from_token(TransportKind::Vsock, Role::Client, token))
    }

    fn accept(&self, server: &Handle) -> Result<Handle> {
        let fd = sys::accept(stream::session_fd(server)?).map_err(Error::Channel)?;
        Ok(Handle::from_fd(TransportKind::Vsock, Role::Session, fd))
    }

    fn connect(&self, mut client: Handle, params: &OpenParams) -> Result<Handle> {
        if client.release().is_none() {
            return Err(Error::InvalidHandle("client context is not open"));
        }
        let cid = match params.peer() {
            Some(p) => p
                .parse()
                .map_err(|_| Error::InvalidHandle("peer is not a vsock CID"))?,
            None => HOST_CID,
        };
        let fd = sys::vsock_connect(cid, self.port(params)?).map_err(Error::Channel)?;
        Ok(Handle::from_fd(TransportKind::Vsock, Role::Session, fd))
    }

    fn read(&self, session: &Handle, mode: IoMode) -> Result<Vec<u8>> {
        stream::read_mode(stream::session_fd(session)?, mode, &self.retry)
    }

    fn wait_readable(&self, session: &Handle, timeout: Duration) -> Result<bool> {
        stream::wait_readable(stream::session_fd(session)?, timeout)
    }

    fn write(&self, session: &Handle, frame: &[u8]) -> Result<()> {
        stream::write_frame(stream::session_fd(session)?, frame)
    }

    fn close_server(&self, server: &mut Handle) -> Result<()> {
        drop(server.release());
        Ok(())
    }

    fn close_client(&self, client: &mut Handle) -> Result<()> {
        drop(client.release());
        Ok(())
    }

    fn close_session(&self, session: &mut Handle) -> Result<()> {
        drop(session.release());
        Ok(())
    }
}
