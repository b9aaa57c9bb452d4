//! Request handlers and their registry.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use devlink_proto::{ComponentType, Frame};
use tracing::{debug, error, info, warn};

use crate::conn::Conn;
use crate::error::{Error, Result};

/// A pluggable handler bound to one or more wire request codes.
///
/// `process` receives the accepted connection and the already-parsed first
/// frame; it may exchange further frames on the connection before returning.
pub trait Component: Send + Sync + fmt::Debug {
    /// Logical type this component serves.
    fn component_type(&self) -> ComponentType;

    /// One-time setup before the server starts accepting.
    fn init(&self) -> Result<()> {
        Ok(())
    }

    /// Handles one request.
    fn process(&self, conn: &mut Conn, frame: &Frame) -> Result<()>;

    /// One-time teardown after the server stopped.
    fn uninit(&self) {}
}

/// Maps component types to handler instances.
#[derive(Debug, Default)]
pub struct ComponentRegistry {
    /// Registered handlers.
    inner: Mutex<BTreeMap<ComponentType, Arc<dyn Component>>>,
    /// Set once `uninit_all` has run.
    torn_down: AtomicBool,
}

impl ComponentRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Locks the table, recovering from a poisoned mutex.
    fn table(&self) -> MutexGuard<'_, BTreeMap<ComponentType, Arc<dyn Component>>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers `component`; fails if its type is already taken.
    pub fn register(&self, component: Arc<dyn Component>) -> Result<()> {
        let ty = component.component_type();
        let mut table = self.table();
        if table.contains_key(&ty) {
            return Err(Error::DuplicateComponent(ty));
        }
        table.insert(ty, component);
        debug!(component = %ty, "component registered");
        Ok(())
    }

    /// Component registered for `ty`.
    pub fn get(&self, ty: ComponentType) -> Option<Arc<dyn Component>> {
        self.table().get(&ty).cloned()
    }

    /// Component serving wire request code `req_type`.
    pub fn resolve(&self, req_type: u16) -> Option<Arc<dyn Component>> {
        self.get(ComponentType::resolve(req_type)?)
    }

    /// Number of registered components.
    pub fn len(&self) -> usize {
        self.table().len()
    }

    /// Returns `true` if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.table().is_empty()
    }

    /// Snapshot of every registered component.
    fn all(&self) -> Vec<Arc<dyn Component>> {
        self.table().values().cloned().collect()
    }

    /// Runs `init` on every component, stopping at the first failure.
    pub fn init_all(&self) -> Result<()> {
        for c in self.all() {
            c.init()?;
            debug!(component = %c.component_type(), "component initialized");
        }
        Ok(())
    }

    /// Runs `uninit` on every component. Only the first call has an effect.
    pub fn uninit_all(&self) {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }
        for c in self.all() {
            c.uninit();
            debug!(component = %c.component_type(), "component uninitialized");
        }
    }

    /// Routes one request to its component.
    ///
    /// Unknown request codes and component failures are logged; the caller
    /// closes the connection either way.
    pub fn dispatch(&self, conn: &mut Conn, frame: &Frame) -> Result<()> {
        let req_type = frame.header.req_type;
        let Some(component) = self.resolve(req_type) else {
            warn!(req_type, device = conn.device(), "no component for request");
            return Ok(());
        };
        let name = component.component_type().name();
        match component.process(conn, frame) {
            Ok(()) => {
                info!(component = name, req_type, device = conn.device(), "request handled");
                Ok(())
            }
            Err(e) => {
                error!(component = name, req_type, device = conn.device(), error = %e, "component failed");
                Err(e)
            }
        }
    }
}
