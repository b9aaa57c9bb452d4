//! A session handle bound to the transport that owns it.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::error::{Error, Result};
use crate::handle::{Handle, TransportKind};
use crate::transport::{IoMode, OpenParams, Transport, TransportRegistry};

/// An open session plus its transport.
///
/// `Conn` is the single owner of its [`Handle`]: it closes the session
/// exactly once, either through [`Conn::close`] or on drop.
pub struct Conn {
    /// Transport that created the handle.
    transport: Arc<dyn Transport>,
    /// Session handle.
    handle: Handle,
    /// Device the session belongs to.
    device: u16,
}

impl fmt::Debug for Conn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conn")
            .field("handle", &self.handle)
            .field("device", &self.device)
            .finish_non_exhaustive()
    }
}

impl Conn {
    /// Wraps an accepted or connected session.
    pub fn new(transport: Arc<dyn Transport>, handle: Handle) -> Self {
        Self {
            transport,
            handle,
            device: 0,
        }
    }

    /// Tags the connection with its device id.
    #[must_use]
    pub const fn with_device(mut self, device: u16) -> Self {
        self.device = device;
        self
    }

    /// Opens a client context on `kind` and connects it.
    pub fn connect(
        registry: &TransportRegistry,
        kind: TransportKind,
        params: &OpenParams,
    ) -> Result<Self> {
        let transport = registry.require(kind)?;
        let client = transport.open_client(params)?;
        let handle = transport.connect(client, params)?;
        Ok(Self::new(transport, handle).with_device(params.device().unwrap_or(0)))
    }

    /// Session handle.
    pub const fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Device the session belongs to.
    pub const fn device(&self) -> u16 {
        self.device
    }

    /// Transport kind of the session.
    pub const fn kind(&self) -> TransportKind {
        self.handle.kind()
    }

    /// Writes one encoded frame.
    pub fn write_bytes(&self, frame: &[u8]) -> Result<()> {
        if !self.handle.is_open() {
            return Err(Error::InvalidHandle("connection is closed"));
        }
        self.transport.write(&self.handle, frame)
    }

    /// Reads one encoded frame.
    pub fn read_bytes(&self, mode: IoMode) -> Result<Vec<u8>> {
        if !self.handle.is_open() {
            return Err(Error::InvalidHandle("connection is closed"));
        }
        self.transport.read(&self.handle, mode)
    }

    /// Waits up to `timeout` for the peer to send; `false` on timeout.
    pub fn wait_readable(&self, timeout: Duration) -> Result<bool> {
        if !self.handle.is_open() {
            return Err(Error::InvalidHandle("connection is closed"));
        }
        self.transport.wait_readable(&self.handle, timeout)
    }

    /// Closes the session. Idempotent.
    pub fn close(&mut self) -> Result<()> {
        if self.handle.is_open() {
            self.transport.close_session(&mut self.handle)?;
        }
        Ok(())
    }
}

impl Drop for Conn {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(handle = %self.handle, error = %e, "failed to close connection");
        }
    }
}

/// Helpers shared by unit tests.
#[cfg(test)]
#[allow(clippy::unwrap_used)]
pub(crate) mod test_support {
    use super::*;
    use crate::transport::LocalTransport;

    /// A connected `(client, server)` pair over a fresh local transport.
    pub(crate) fn local_pair(device: u16) -> (Conn, Conn) {
        let local: Arc<dyn Transport> = Arc::new(LocalTransport::new());
        let params = OpenParams::for_device("test", device);
        let mut server = local.open_server(&params).unwrap();
        let client = local.open_client(&params).unwrap();
        let session = local.connect(client, &params).unwrap();
        let accepted = local.accept(&server).unwrap();
        local.close_server(&mut server).unwrap();
        (
            Conn::new(Arc::clone(&local), session).with_device(device),
            Conn::new(local, accepted).with_device(device),
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::transport::LocalTransport;

    #[test]
    fn close_is_idempotent_and_blocks_io() {
        let registry = TransportRegistry::new();
        let local = Arc::new(LocalTransport::new());
        registry.register(local.clone()).unwrap();
        let params = OpenParams::for_device("svc", 4);
        let _server = local.open_server(&params).unwrap();

        let mut conn = Conn::connect(&registry, TransportKind::Local, &params).unwrap();
        assert_eq!(conn.device(), 4);
        conn.close().unwrap();
        conn.close().unwrap();
        assert!(conn.handle().is_closed());
        assert!(matches!(
            conn.write_bytes(b"x"),
            Err(Error::InvalidHandle(_))
        ));
    }

    #[test]
    fn connect_on_unregistered_kind_fails() {
        let registry = TransportRegistry::new();
        let res = Conn::connect(&registry, TransportKind::Unix, &OpenParams::new());
        assert!(matches!(res, Err(Error::Unregistered(TransportKind::Unix))));
    }
}
