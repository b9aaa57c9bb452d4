//! Process-wide table of transport instances, one per kind.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::handle::{Handle, Role, TransportKind};
use crate::transport::{IoMode, OpenParams, Transport};

/// Maps each [`TransportKind`] to its singleton [`Transport`].
///
/// The first registration for a kind wins; later ones are accepted and
/// ignored. Operations on an unregistered kind return the invalid handle
/// (open / accept / connect) or `Ok(())` (close), so callers never need to
/// special-case a missing transport.
#[derive(Debug, Default)]
pub struct TransportRegistry {
    /// Registered transports.
    inner: Mutex<HashMap<TransportKind, Arc<dyn Transport>>>,
}

impl TransportRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Locks the table, recovering from a poisoned mutex.
    fn table(&self) -> MutexGuard<'_, HashMap<TransportKind, Arc<dyn Transport>>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers `transport` under its kind unless one is already present.
    ///
    /// Always succeeds; a second registration leaves the first in effect.
    pub fn register(&self, transport: Arc<dyn Transport>) -> Result<()> {
        let kind = transport.kind();
        let mut table = self.table();
        if table.contains_key(&kind) {
            debug!(%kind, "transport already registered, keeping the first");
        } else {
            table.insert(kind, transport);
            debug!(%kind, "transport registered");
        }
        Ok(())
    }

    /// Returns the transport registered for `kind`.
    pub fn get(&self, kind: TransportKind) -> Option<Arc<dyn Transport>> {
        self.table().get(&kind).cloned()
    }

    /// Returns `true` if `kind` is registered.
    pub fn contains(&self, kind: TransportKind) -> bool {
        self.table().contains_key(&kind)
    }

    /// Returns the transport for `kind` or [`Error::Unregistered`].
    pub fn require(&self, kind: TransportKind) -> Result<Arc<dyn Transport>> {
        self.get(kind).ok_or(Error::Unregistered(kind))
    }

    /// Runs an open-style call, degrading failures to the invalid handle.
    fn open_with(
        &self,
        kind: TransportKind,
        role: Role,
        op: &str,
        f: impl FnOnce(&dyn Transport) -> Result<Handle>,
    ) -> Handle {
        let Some(t) = self.get(kind) else {
            warn!(%kind, op, "transport not registered");
            return Handle::invalid(kind, role);
        };
        match f(t.as_ref()) {
            Ok(h) => h,
            Err(e) => {
                warn!(%kind, op, error = %e, "transport call failed");
                Handle::invalid(kind, role)
            }
        }
    }

    /// Opens a listening endpoint, or returns the invalid handle.
    pub fn open_server(&self, kind: TransportKind, params: &OpenParams) -> Handle {
        self.open_with(kind, Role::Server, "open_server", |t| t.open_server(params))
    }

    /// Opens a client context, or returns the invalid handle.
    pub fn open_client(&self, kind: TransportKind, params: &OpenParams) -> Handle {
        self.open_with(kind, Role::Client, "open_client", |t| t.open_client(params))
    }

    /// Accepts a session on `server`, or returns the invalid handle.
    pub fn accept(&self, server: &Handle) -> Handle {
        self.open_with(server.kind(), Role::Session, "accept", |t| t.accept(server))
    }

    /// Connects `client`, or returns the invalid handle.
    pub fn connect(&self, client: Handle, params: &OpenParams) -> Handle {
        self.open_with(client.kind(), Role::Session, "connect", |t| {
            t.connect(client, params)
        })
    }

    /// Reads one frame from `session`.
    pub fn read(&self, session: &Handle, mode: IoMode) -> Result<Vec<u8>> {
        self.require(session.kind())?.read(session, mode)
    }

    /// Writes one frame to `session`.
    pub fn write(&self, session: &Handle, frame: &[u8]) -> Result<()> {
        self.require(session.kind())?.write(session, frame)
    }

    /// Closes a listening endpoint; a no-op for unregistered kinds.
    pub fn close_server(&self, server: &mut Handle) -> Result<()> {
        match self.get(server.kind()) {
            Some(t) => t.close_server(server),
            None => Ok(()),
        }
    }

    /// Closes a client context; a no-op for unregistered kinds.
    pub fn close_client(&self, client: &mut Handle) -> Result<()> {
        match self.get(client.kind()) {
            Some(t) => t.close_client(client),
            None => Ok(()),
        }
    }

    /// Closes a session; a no-op for unregistered kinds.
    pub fn close_session(&self, session: &mut Handle) -> Result<()> {
        match self.get(session.kind()) {
            Some(t) => t.close_session(session),
            None => Ok(()),
        }
    }

    /// Runs every registered transport's timer hook.
    pub fn timer(&self) {
        let all: Vec<_> = self.table().values().cloned().collect();
        for t in all {
            t.timer();
        }
    }
}
