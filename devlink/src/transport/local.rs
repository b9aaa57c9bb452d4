//! In-process session transport over channels.
//!
//! Endpoints are addressed by `<service>/<device>`. Each session is a pair
//! of unbounded channels carrying whole frames, so message boundaries are
//! preserved the way a session-oriented hardware channel preserves them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crossbeam_channel::{Receiver, Select, Sender, TryRecvError};
use tracing::debug;

use crate::error::{Error, Result};
use crate::handle::{Handle, Role, TransportKind};
use crate::retry::RetryPolicy;
use crate::transport::{IoMode, OpenParams, Transport};

/// One side of a session.
#[derive(Debug, Clone)]
struct Endpoint {
    /// Frames towards the peer.
    tx: Sender<Vec<u8>>,
    /// Frames from the peer.
    rx: Receiver<Vec<u8>>,
}

impl Endpoint {
    /// Creates two connected endpoints.
    fn pair() -> (Self, Self) {
        let (a_tx, b_rx) = crossbeam_channel::unbounded();
        let (b_tx, a_rx) = crossbeam_channel::unbounded();
        (Self { tx: a_tx, rx: a_rx }, Self { tx: b_tx, rx: b_rx })
    }
}

/// What a token refers to.
#[derive(Debug)]
enum Slot {
    /// Listening endpoint and its queue of incoming sessions.
    Listener {
        /// Address it listens on.
        address: String,
        /// Sessions waiting to be accepted.
        pending: Receiver<Endpoint>,
    },
    /// Unconnected client context.
    Client,
    /// Established session.
    Session(Endpoint),
}

/// Shared tables.
#[derive(Debug, Default)]
struct Tables {
    /// Address → queue feeding the listener.
    listeners: HashMap<String, Sender<Endpoint>>,
    /// Token → resource.
    slots: HashMap<u64, Slot>,
}

/// Channel-backed transport for tests and single-process setups.
#[derive(Debug)]
pub struct LocalTransport {
    /// Budget for non-blocking reads.
    retry: RetryPolicy,
    /// Listener and session tables.
    tables: Mutex<Tables>,
    /// Next token to hand out.
    next: AtomicU64,
}

impl Default for LocalTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalTransport {
    /// Creates a transport with the default read budget.
    pub fn new() -> Self {
        Self::with_retry(RetryPolicy::default())
    }

    /// Creates a transport with a custom non-blocking read budget.
    pub fn with_retry(retry: RetryPolicy) -> Self {
        Self {
            retry,
            tables: Mutex::new(Tables::default()),
            next: AtomicU64::new(1),
        }
    }

    /// Locks the tables, recovering from a poisoned mutex.
    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocates a token.
    fn token(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    /// Address of the endpoint described by `params`.
    fn address(params: &OpenParams) -> Result<String> {
        let device = params
            .device()
            .ok_or(Error::InvalidHandle("missing device id"))?;
        Ok(format!("{}/{device}", params.service()))
    }

    /// Clones the endpoint of an open session.
    fn endpoint(&self, session: &Handle) -> Result<Endpoint> {
        let token = session
            .token()
            .ok_or(Error::InvalidHandle("session is not open"))?;
        match self.tables().slots.get(&token) {
            Some(Slot::Session(ep)) => Ok(ep.clone()),
            _ => Err(Error::InvalidHandle("not a local session")),
        }
    }

    /// Removes the slot behind `handle` and marks it closed.
    fn close(&self, handle: &mut Handle) {
        let Some(token) = handle.token() else {
            return;
        };
        let mut tables = self.tables();
        if let Some(Slot::Listener { address, .. }) = tables.slots.remove(&token) {
            tables.listeners.remove(&address);
            debug!(%address, "local listener closed");
        }
        drop(tables);
        drop(handle.release());
    }
}

impl Transport for LocalTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Local
    }

    fn open_server(&self, params: &OpenParams) -> Result<Handle> {
        let address = Self::address(params)?;
        let (tx, pending) = crossbeam_channel::unbounded();
        let token = self.token();
        let mut tables = self.tables();
        if tables.listeners.contains_key(&address) {
            return Err(Error::Io(std::io::ErrorKind::AddrInUse.into()));
        }
        tables.listeners.insert(address.clone(), tx);
        tables.slots.insert(token, Slot::Listener { address, pending });
        Ok(Handle::from_token(TransportKind::Local, Role::Server, token))
    }

    fn open_client(&self, _params: &OpenParams) -> Result<Handle> {
        let token = self.token();
        self.tables().slots.insert(token, Slot::Client);
        Ok(Handle::from_token(TransportKind::Local, Role::Client, token))
    }

    fn accept(&self, server: &Handle) -> Result<Handle> {
        let token = server
            .token()
            .ok_or(Error::InvalidHandle("listener is not open"))?;
        let pending = match self.tables().slots.get(&token) {
            Some(Slot::Listener { pending, .. }) => pending.clone(),
            _ => return Err(Error::InvalidHandle("not a local listener")),
        };
        let endpoint = pending.recv().map_err(|_| Error::Closed)?;
        let session = self.token();
        self.tables().slots.insert(session, Slot::Session(endpoint));
        Ok(Handle::from_token(TransportKind::Local, Role::Session, session))
    }

    fn connect(&self, mut client: Handle, params: &OpenParams) -> Result<Handle> {
        let token = client
            .token()
            .ok_or(Error::InvalidHandle("client context is not open"))?;
        let address = Self::address(params)?;
        let (ours, theirs) = Endpoint::pair();
        let session = self.token();
        {
            let mut tables = self.tables();
            tables.slots.remove(&token);
            let listener = tables.listeners.get(&address).ok_or_else(|| {
                Error::Channel(std::io::ErrorKind::ConnectionRefused.into())
            })?;
            listener.send(theirs).map_err(|_| Error::Closed)?;
            tables.slots.insert(session, Slot::Session(ours));
        }
        drop(client.release());
        Ok(Handle::from_token(TransportKind::Local, Role::Session, session))
    }

    fn read(&self, session: &Handle, mode: IoMode) -> Result<Vec<u8>> {
        let ep = self.endpoint(session)?;
        match mode {
            IoMode::Blocking => ep.rx.recv().map_err(|_| Error::Closed),
            IoMode::NonBlocking => self.retry.run(|| match ep.rx.try_recv() {
                Ok(frame) => Ok(Some(frame)),
                Err(TryRecvError::Empty) => Ok(None),
                Err(TryRecvError::Disconnected) => Err(Error::Closed),
            }),
        }
    }

    fn wait_readable(&self, session: &Handle, timeout: Duration) -> Result<bool> {
        let ep = self.endpoint(session)?;
        let mut sel = Select::new();
        sel.recv(&ep.rx);
        // A disconnected peer counts as ready so the next read sees it.
        Ok(sel.ready_timeout(timeout).is_ok())
    }

    fn write(&self, session: &Handle, frame: &[u8]) -> Result<()> {
        self.endpoint(session)?
            .tx
            .send(frame.to_vec())
            .map_err(|_| Error::Closed)
    }

    fn close_server(&self, server: &mut Handle) -> Result<()> {
        self.close(server);
        Ok(())
    }

    fn close_client(&self, client: &mut Handle) -> Result<()> {
        self.close(client);
        Ok(())
    }

    fn close_session(&self, session: &mut Handle) -> Result<()> {
        self.close(session);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn pair(t: &LocalTransport) -> (Handle, Handle, Handle) {
        let params = OpenParams::for_device("svc", 0);
        let server = t.open_server(&params).unwrap();
        let client = t.connect(t.open_client(&params).unwrap(), &params).unwrap();
        let accepted = t.accept(&server).unwrap();
        (server, client, accepted)
    }

    #[test]
    fn frames_keep_their_boundaries() {
        let t = LocalTransport::new();
        let (_server, client, accepted) = pair(&t);
        t.write(&client, b"one").unwrap();
        t.write(&client, b"two").unwrap();
        assert_eq!(t.read(&accepted, IoMode::Blocking).unwrap(), b"one");
        assert_eq!(t.read(&accepted, IoMode::NonBlocking).unwrap(), b"two");
        t.write(&accepted, b"back").unwrap();
        assert_eq!(t.read(&client, IoMode::Blocking).unwrap(), b"back");
    }

    #[test]
    fn non_blocking_read_exhausts_budget() {
        let t = LocalTransport::with_retry(RetryPolicy::new(5, 0, 0));
        let (_server, _client, accepted) = pair(&t);
        assert!(matches!(
            t.read(&accepted, IoMode::NonBlocking),
            Err(Error::ReadTimeout { attempts: 5 })
        ));
    }

    #[test]
    fn closing_one_side_disconnects_the_other() {
        let t = LocalTransport::new();
        let (_server, mut client, accepted) = pair(&t);
        t.close_session(&mut client).unwrap();
        assert!(client.is_closed());
        assert!(matches!(
            t.read(&accepted, IoMode::Blocking),
            Err(Error::Closed)
        ));
    }

    #[test]
    fn wait_readable_sees_frames_and_hangups() {
        let t = LocalTransport::new();
        let (_server, mut client, accepted) = pair(&t);
        assert!(!t.wait_readable(&accepted, Duration::from_millis(20)).unwrap());
        t.write(&client, b"hi").unwrap();
        assert!(t.wait_readable(&accepted, Duration::ZERO).unwrap());
        assert_eq!(t.read(&accepted, IoMode::Blocking).unwrap(), b"hi");
        t.close_session(&mut client).unwrap();
        assert!(t.wait_readable(&accepted, Duration::from_secs(1)).unwrap());
    }

    #[test]
    fn connect_to_missing_listener_is_refused() {
        let t = LocalTransport::new();
        let params = OpenParams::for_device("svc", 5);
        let client = t.open_client(&params).unwrap();
        assert!(matches!(t.connect(client, &params), Err(Error::Channel(_))));
    }

    #[test]
    fn address_is_exclusive_until_closed() {
        let t = LocalTransport::new();
        let params = OpenParams::for_device("svc", 1);
        let mut server = t.open_server(&params).unwrap();
        assert!(t.open_server(&params).is_err());
        t.close_server(&mut server).unwrap();
        assert!(t.open_server(&params).is_ok());
    }
}
