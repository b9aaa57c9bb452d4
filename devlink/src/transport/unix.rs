//! Unix domain stream socket transport.

use std::collections::HashMap;
use std::fs;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::handle::{Handle, Role, TransportKind};
use crate::retry::RetryPolicy;
use crate::sys;
use crate::transport::{IoMode, OpenParams, Transport, stream};

/// Listens and connects on `<dir>/<service>-<device>.sock`.
#[derive(Debug)]
pub struct UnixTransport {
    /// Directory holding the socket files.
    dir: PathBuf,
    /// Budget for non-blocking reads.
    retry: RetryPolicy,
    /// Socket files owned by open listeners, keyed by listener fd.
    paths: Mutex<HashMap<RawFd, PathBuf>>,
    /// Source of client-context tokens.
    next_client: AtomicU64,
}

impl UnixTransport {
    /// Creates a transport rooted at `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self::with_retry(dir, RetryPolicy::default())
    }

    /// Creates a transport with a custom non-blocking read budget.
    pub fn with_retry(dir: impl Into<PathBuf>, retry: RetryPolicy) -> Self {
        Self {
            dir: dir.into(),
            retry,
            paths: Mutex::new(HashMap::new()),
            next_client: AtomicU64::new(1),
        }
    }

    /// Directory holding the socket files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Socket path for the endpoint described by `params`.
    pub fn socket_path(&self, params: &OpenParams) -> Result<PathBuf> {
        let device = params
            .device()
            .ok_or(Error::InvalidHandle("missing device id"))?;
        Ok(self
            .dir
            .join(format!("{}-{device}.sock", params.service())))
    }
}

impl Transport for UnixTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Unix
    }

    fn open_server(&self, params: &OpenParams) -> Result<Handle> {
        let path = self.socket_path(params)?;
        fs::create_dir_all(&self.dir)?;
        match fs::remove_file(&path) {
            Ok(()) => debug!(path = %path.display(), "removed stale socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let fd = OwnedFd::from(UnixListener::bind(&path)?);
        self.paths
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(fd.as_raw_fd(), path);
        Ok(Handle::from_fd(TransportKind::Unix, Role::Server, fd))
    }

    fn open_client(&self, _params: &OpenParams) -> Result<Handle> {
        let token = self.next_client.fetch_add(1, Ordering::Relaxed);
        Ok(Handle::from_token(TransportKind::Unix, Role::Client, token))
    }

    fn accept(&self, server: &Handle) -> Result<Handle> {
        let fd = stream::session_fd(server)?;
        let session = sys::accept(fd).map_err(Error::Channel)?;
        Ok(Handle::from_fd(TransportKind::Unix, Role::Session, session))
    }

    fn connect(&self, mut client: Handle, params: &OpenParams) -> Result<Handle> {
        if client.release().is_none() {
            return Err(Error::InvalidHandle("client context is not open"));
        }
        let path = self.socket_path(params)?;
        let stream = UnixStream::connect(&path).map_err(Error::Channel)?;
        Ok(Handle::from_fd(
            TransportKind::Unix,
            Role::Session,
            OwnedFd::from(stream),
        ))
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
        let Some(raw) = server.fd().map(|fd| fd.as_raw_fd()) else {
            return Ok(());
        };
        let path = self
            .paths
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&raw);
        drop(server.release());
        if let Some(path) = path
            && let Err(e) = fs::remove_file(&path)
        {
            warn!(path = %path.display(), error = %e, "failed to remove socket file");
        }
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

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::thread;

    use devlink_proto::Frame;

    use super::*;

    #[test]
    fn serve_accept_connect_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let t = UnixTransport::new(dir.path());
        let params = OpenParams::for_device("svc", 2);

        let mut server = t.open_server(&params).unwrap();
        let sock = dir.path().join("svc-2.sock");
        assert!(sock.exists());

        let client = t.open_client(&params).unwrap();
        let session = t.connect(client, &params).unwrap();
        let mut accepted = t.accept(&server).unwrap();

        let frame = Frame::data(10, 2, b"ping".to_vec()).unwrap();
        t.write(&session, &frame.to_bytes()).unwrap();
        let got = t.read(&accepted, IoMode::Blocking).unwrap();
        assert_eq!(Frame::from_bytes(got).unwrap(), frame);

        t.close_session(&mut accepted).unwrap();
        t.close_session(&mut accepted).unwrap();
        assert!(accepted.is_closed());

        t.close_server(&mut server).unwrap();
        t.close_server(&mut server).unwrap();
        assert!(!sock.exists());
    }

    #[test]
    fn stale_socket_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let t = UnixTransport::new(dir.path());
        let params = OpenParams::for_device("svc", 0);
        let first = t.open_server(&params).unwrap();
        // Leak the listener's file: simulate a crashed previous run.
        std::mem::forget(first);
        let mut second = t.open_server(&params).unwrap();
        assert!(second.is_open());
        t.close_server(&mut second).unwrap();
    }

    #[test]
    fn non_blocking_read_sees_late_data() {
        let dir = tempfile::tempdir().unwrap();
        let t = UnixTransport::with_retry(dir.path(), RetryPolicy::new(200, 1, 5));
        let params = OpenParams::for_device("svc", 1);
        let server = t.open_server(&params).unwrap();
        let session = t.connect(t.open_client(&params).unwrap(), &params).unwrap();
        let accepted = t.accept(&server).unwrap();

        let frame = Frame::data(1, 1, vec![1, 2, 3]).unwrap().to_bytes();
        thread::scope(|s| {
            s.spawn(|| {
                thread::sleep(std::time::Duration::from_millis(30));
                t.write(&session, &frame).unwrap();
            });
            let got = t.read(&accepted, IoMode::NonBlocking).unwrap();
            assert_eq!(got, frame);
        });
    }

    #[test]
    fn connect_without_listener_fails() {
        let dir = tempfile::tempdir().unwrap();
        let t = UnixTransport::new(dir.path());
        let params = OpenParams::for_device("svc", 9);
        let client = t.open_client(&params).unwrap();
        assert!(matches!(t.connect(client, &params), Err(Error::Channel(_))));
    }
}
