//! Pluggable point-to-point transports.
//!
//! A [`Transport`] moves whole frames between a device and a host. Each
//! implementation is registered once per [`TransportKind`] in a
//! [`TransportRegistry`] and used through [`Handle`]s it creates.

mod local;
mod registry;
#[cfg(unix)]
mod stream;
#[cfg(unix)]
mod unix;
#[cfg(target_os = "linux")]
mod vsock;

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

pub use local::LocalTransport;
pub use registry::TransportRegistry;
#[cfg(unix)]
pub use unix::UnixTransport;
#[cfg(target_os = "linux")]
pub use vsock::VsockTransport;

use crate::error::Result;
use crate::handle::{Handle, TransportKind};

/// Parameter key carrying the device id.
pub const PARAM_DEVICE: &str = "device_id";

/// Parameter key selecting the service / channel.
pub const PARAM_SERVICE: &str = "service";

/// Parameter key addressing a remote peer (vsock CID, host name, ...).
pub const PARAM_PEER: &str = "peer";

/// Whether a read may wait for data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum IoMode {
    /// Wait until a frame arrives or the peer closes.
    Blocking,
    /// Poll within the transport's bounded retry budget.
    NonBlocking,
}

/// String-keyed parameters for opening endpoints.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpenParams(BTreeMap<String, String>);

impl OpenParams {
    /// Creates an empty parameter set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parameters addressing `device` on `service`.
    pub fn for_device(service: &str, device: u16) -> Self {
        Self::new()
            .with(PARAM_SERVICE, service)
            .with(PARAM_DEVICE, device.to_string())
    }

    /// Sets `key` to `value`.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Looks up a raw value.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// The device id, if present and numeric.
    pub fn device(&self) -> Option<u16> {
        self.get(PARAM_DEVICE)?.parse().ok()
    }

    /// The service name, or `"default"`.
    pub fn service(&self) -> &str {
        self.get(PARAM_SERVICE).unwrap_or("default")
    }

    /// The peer address, if any.
    pub fn peer(&self) -> Option<&str> {
        self.get(PARAM_PEER)
    }
}

/// A point-to-point channel implementation.
///
/// `read` returns exactly one encoded frame (header plus payload). In
/// [`IoMode::NonBlocking`] a transport polls within a bounded retry budget
/// and fails with [`Error::ReadTimeout`](crate::Error::ReadTimeout) once it
/// is spent. `close_*` calls are idempotent.
pub trait Transport: Send + Sync + fmt::Debug {
    /// Kind this transport registers under.
    fn kind(&self) -> TransportKind;

    /// Opens a listening endpoint.
    fn open_server(&self, params: &OpenParams) -> Result<Handle>;

    /// Creates an unconnected client context.
    fn open_client(&self, params: &OpenParams) -> Result<Handle>;

    /// Accepts one pending session from a listening endpoint.
    fn accept(&self, server: &Handle) -> Result<Handle>;

    /// Connects a client context, consuming it, and returns the session.
    fn connect(&self, client: Handle, params: &OpenParams) -> Result<Handle>;

    /// Reads one whole frame from a session.
    fn read(&self, session: &Handle, mode: IoMode) -> Result<Vec<u8>>;

    /// Waits up to `timeout` for a session to have a frame or hang up.
    ///
    /// Returns `false` on timeout. Transports that cannot wait report the
    /// session as ready and leave the bound to [`read`](Self::read).
    fn wait_readable(&self, _session: &Handle, _timeout: Duration) -> Result<bool> {
        Ok(true)
    }

    /// Writes one whole frame to a session.
    fn write(&self, session: &Handle, frame: &[u8]) -> Result<()>;

    /// Closes a listening endpoint.
    fn close_server(&self, server: &mut Handle) -> Result<()>;

    /// Closes a client context.
    fn close_client(&self, client: &mut Handle) -> Result<()>;

    /// Closes a session.
    fn close_session(&self, session: &mut Handle) -> Result<()>;

    /// Periodic housekeeping hook, called once per server loop iteration.
    fn timer(&self) {}
}
