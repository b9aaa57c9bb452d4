//! Accept loop, device hot-plug, and dispatch to the worker pool.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::component::ComponentRegistry;
use crate::conn::Conn;
use crate::device::DeviceSource;
use crate::error::{Error, Result};
use crate::handle::{Handle, TransportKind};
use crate::mux::{Event, Fault, Interest, Multiplexer};
use crate::pool::WorkerPool;
use crate::transport::{OpenParams, Transport, TransportRegistry};

/// Tunables for a [`ServerManager`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct ServerOptions {
    /// Service name used when opening device endpoints.
    pub service: String,
    /// Worker threads serving accepted connections.
    pub workers: usize,
    /// Accepted connections that may wait for a worker.
    pub accept_queue: usize,
    /// Multiplexer wait timeout, which is also the hot-plug poll period.
    pub poll_interval: Duration,
    /// Events returned by one multiplexer wait.
    pub event_capacity: usize,
    /// How long an accepted connection may stay silent before its worker
    /// closes it.
    pub request_timeout: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            service: "devlink".to_owned(),
            workers: 4,
            accept_queue: 256,
            poll_interval: Duration::from_millis(500),
            event_capacity: 64,
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Lifecycle of a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ServerState {
    /// Not started.
    Uninitialized,
    /// Accept loop running.
    Running,
    /// Stop requested, loop winding down.
    Stopping,
    /// Loop exited and everything torn down.
    Stopped,
}

/// State shared between the loop thread and its [`ServerHandle`].
#[derive(Debug)]
struct Shared {
    /// Quiescence flag checked once per loop iteration.
    quit: AtomicBool,
    /// Current lifecycle state.
    state: Mutex<ServerState>,
    /// Read-only mirror of the device registration table.
    listening: Mutex<BTreeSet<u16>>,
}

impl Shared {
    /// Locks the listening mirror.
    fn listening(&self) -> MutexGuard<'_, BTreeSet<u16>> {
        self.listening.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Updates the lifecycle state.
    fn set_state(&self, state: ServerState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Reads the lifecycle state.
    fn state(&self) -> ServerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Builder for the accept loop.
///
/// Needs a registered transport kind, a multiplexer, a device source, and
/// at least one component; [`start`](Self::start) fails closed otherwise.
pub struct ServerManager {
    /// Registered transports.
    transports: Arc<TransportRegistry>,
    /// Registered components.
    components: Arc<ComponentRegistry>,
    /// Transport kind to serve on.
    kind: Option<TransportKind>,
    /// Readiness facility.
    mux: Option<Box<dyn Multiplexer>>,
    /// Device enumeration.
    devices: Option<Box<dyn DeviceSource>>,
    /// Tunables.
    options: ServerOptions,
}

impl fmt::Debug for ServerManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerManager")
            .field("kind", &self.kind)
            .field("mux", &self.mux)
            .field("devices", &self.devices)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl ServerManager {
    /// Creates a builder over the given registries.
    pub fn new(transports: Arc<TransportRegistry>, components: Arc<ComponentRegistry>) -> Self {
        Self {
            transports,
            components,
            kind: None,
            mux: None,
            devices: None,
            options: ServerOptions::default(),
        }
    }

    /// Serves on transport `kind`.
    #[must_use]
    pub const fn transport(mut self, kind: TransportKind) -> Self {
        self.kind = Some(kind);
        self
    }

    /// Uses `mux` for readiness notification.
    #[must_use]
    pub fn multiplexer(mut self, mux: Box<dyn Multiplexer>) -> Self {
        self.mux = Some(mux);
        self
    }

    /// Uses `devices` for hot-plug enumeration.
    #[must_use]
    pub fn devices(mut self, devices: Box<dyn DeviceSource>) -> Self {
        self.devices = Some(devices);
        self
    }

    /// Overrides the tunables.
    #[must_use]
    pub fn options(mut self, options: ServerOptions) -> Self {
        self.options = options;
        self
    }

    /// A builder has not started anything yet.
    pub const fn state(&self) -> ServerState {
        ServerState::Uninitialized
    }

    /// Initializes components and starts the loop thread.
    ///
    /// Components are uninitialized again if the workers or the loop thread
    /// fail to start.
    pub fn start(self) -> Result<ServerHandle> {
        let kind = self.kind.ok_or(Error::NotReady("no transport kind selected"))?;
        let transport = self.transports.require(kind)?;
        let mux = self.mux.ok_or(Error::NotReady("no multiplexer"))?;
        let devices = self.devices.ok_or(Error::NotReady("no device source"))?;
        if self.components.is_empty() {
            return Err(Error::NotReady("no components registered"));
        }
        self.components.init_all()?;

        let components = Arc::clone(&self.components);
        let launched = Launch {
            kind,
            transport,
            mux,
            devices,
            components: self.components,
            options: self.options,
        }
        .run();
        launched.inspect_err(|e| {
            error!(%kind, error = %e, "server failed to start");
            components.uninit_all();
        })
    }
}

/// Everything [`ServerManager::start`] validated, ready to launch.
struct Launch {
    /// Transport kind being served.
    kind: TransportKind,
    /// Transport serving device endpoints.
    transport: Arc<dyn Transport>,
    /// Readiness facility.
    mux: Box<dyn Multiplexer>,
    /// Device enumeration.
    devices: Box<dyn DeviceSource>,
    /// Initialized components.
    components: Arc<ComponentRegistry>,
    /// Tunables.
    options: ServerOptions,
}

impl Launch {
    /// Spawns the workers and the loop thread.
    fn run(self) -> Result<ServerHandle> {
        let kind = self.kind;
        let pool = WorkerPool::spawn(
            self.options.workers,
            self.options.accept_queue,
            self.options.request_timeout,
            Arc::clone(&self.components),
        )?;
        let shared = Arc::new(Shared {
            quit: AtomicBool::new(false),
            state: Mutex::new(ServerState::Running),
            listening: Mutex::new(BTreeSet::new()),
        });
        let mut event_loop = EventLoop {
            transport: self.transport,
            mux: self.mux,
            devices: self.devices,
            endpoints: BTreeMap::new(),
            failed: BTreeSet::new(),
            pool,
            components: Arc::clone(&self.components),
            options: self.options,
            shared: Arc::clone(&shared),
        };
        let thread = thread::Builder::new()
            .name("devlink-server".to_owned())
            .spawn(move || {
                event_loop.run();
                event_loop
            })?;
        info!(%kind, "server started");
        Ok(ServerHandle {
            thread: Some(thread),
            shared,
            components: self.components,
        })
    }
}

/// State owned by the loop thread.
struct EventLoop {
    /// Transport serving device endpoints.
    transport: Arc<dyn Transport>,
    /// Readiness facility.
    mux: Box<dyn Multiplexer>,
    /// Device enumeration.
    devices: Box<dyn DeviceSource>,
    /// Device registration table: device → listening endpoint.
    endpoints: BTreeMap<u16, Handle>,
    /// Devices whose endpoint failed to open, to log the failure once.
    failed: BTreeSet<u16>,
    /// Workers serving accepted connections.
    pool: WorkerPool,
    /// Components uninitialized during teardown.
    components: Arc<ComponentRegistry>,
    /// Tunables.
    options: ServerOptions,
    /// State shared with the handle.
    shared: Arc<Shared>,
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("endpoints", &self.endpoints)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl EventLoop {
    /// Returns `true` once stop was requested.
    fn quitting(&self) -> bool {
        self.shared.quit.load(Ordering::Acquire)
    }

    /// Runs until the quiescence flag is set.
    fn run(&mut self) {
        let capacity = self.options.event_capacity.min(self.mux.capacity()).max(1);
        let mut events = Vec::with_capacity(capacity);
        while !self.quitting() {
            self.poll_devices();
            self.transport.timer();
            match self
                .mux
                .wait(&mut events, capacity, self.options.poll_interval)
            {
                Ok(_) => {
                    for ev in events.drain(..) {
                        self.handle_event(ev);
                    }
                }
                Err(e) => {
                    self.mux.error_handle(Fault::Wait(&e));
                    thread::sleep(self.options.poll_interval);
                }
            }
        }
        debug!("server loop exited");
    }

    /// Opens endpoints for new devices and closes those of removed ones.
    fn poll_devices(&mut self) {
        for device in self.devices.disabled_devices() {
            self.failed.remove(&device);
            if let Some(mut handle) = self.endpoints.remove(&device) {
                self.close_endpoint(device, &mut handle);
                info!(device, "device removed, endpoint closed");
            }
        }
        for device in self.devices.enabled_devices() {
            if self.quitting() {
                return;
            }
            if self.endpoints.contains_key(&device) {
                continue;
            }
            self.open_endpoint(device);
        }
    }

    /// Opens and registers the listening endpoint of `device`.
    fn open_endpoint(&mut self, device: u16) {
        let params = OpenParams::for_device(&self.options.service, device);
        let mut handle = match self.transport.open_server(&params) {
            Ok(h) => h,
            Err(e) => {
                if self.failed.insert(device) {
                    warn!(device, error = %e, "failed to open device endpoint");
                }
                return;
            }
        };
        if let Err(e) = self.mux.add(&handle, Interest::CONNECT) {
            if self.failed.insert(device) {
                warn!(device, error = %e, "failed to watch device endpoint");
            }
            if let Err(e) = self.transport.close_server(&mut handle) {
                warn!(device, error = %e, "failed to close endpoint");
            }
            return;
        }
        self.failed.remove(&device);
        self.endpoints.insert(device, handle);
        self.shared.listening().insert(device);
        info!(device, "device endpoint listening");
    }

    /// Unwatches and closes one endpoint.
    fn close_endpoint(&mut self, device: u16, handle: &mut Handle) {
        if let Err(e) = self.mux.del(handle, Interest::CONNECT) {
            debug!(device, error = %e, "failed to unwatch endpoint");
        }
        if let Err(e) = self.transport.close_server(handle) {
            warn!(device, error = %e, "failed to close endpoint");
        }
        self.shared.listening().remove(&device);
    }

    /// Accepts on connection-ready, reports everything else.
    fn handle_event(&mut self, ev: Event) {
        if !ev.ready.contains(Interest::CONNECT) {
            self.mux.error_handle(Fault::Event(ev));
            return;
        }
        let Some((&device, server)) = self
            .endpoints
            .iter()
            .find(|(_, h)| h.raw_id() == Some(ev.token))
        else {
            self.mux.error_handle(Fault::Event(ev));
            return;
        };
        match self.transport.accept(server) {
            Ok(session) => {
                debug!(device, session = %session, "connection accepted");
                let conn = Conn::new(Arc::clone(&self.transport), session).with_device(device);
                if let Err(e) = self.pool.submit(conn) {
                    error!(device, error = %e, "failed to queue connection");
                }
            }
            Err(e) => warn!(device, error = %e, "accept failed"),
        }
        let rest = ev.ready.without(Interest::CONNECT);
        if !rest.is_empty() {
            self.mux.error_handle(Fault::Event(Event::new(ev.token, rest)));
        }
    }

    /// Closes every endpoint, uninitializes the components, destroys the
    /// multiplexer, then stops the pool.
    fn teardown(&mut self) {
        for (device, mut handle) in std::mem::take(&mut self.endpoints) {
            self.close_endpoint(device, &mut handle);
        }
        self.components.uninit_all();
        self.mux.destroy();
        self.pool.shutdown();
    }
}

/// Running server. Stops on drop.
#[derive(Debug)]
pub struct ServerHandle {
    /// Loop thread; `None` once stopped.
    thread: Option<JoinHandle<EventLoop>>,
    /// State shared with the loop.
    shared: Arc<Shared>,
    /// Components to tear down after the loop exits.
    components: Arc<ComponentRegistry>,
}

impl ServerHandle {
    /// Current lifecycle state.
    pub fn state(&self) -> ServerState {
        self.shared.state()
    }

    /// Devices that currently have a listening endpoint.
    pub fn listening_devices(&self) -> Vec<u16> {
        self.shared.listening().iter().copied().collect()
    }

    /// Stops the loop, closes every device endpoint, and uninitializes the
    /// components. Idempotent.
    ///
    /// Workers still serving a connection are left to finish on their own.
    pub fn stop(&mut self) -> Result<()> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        self.shared.set_state(ServerState::Stopping);
        self.shared.quit.store(true, Ordering::Release);
        match thread.join() {
            Ok(mut event_loop) => event_loop.teardown(),
            Err(_) => {
                error!("server loop panicked");
                self.components.uninit_all();
            }
        }
        self.shared.listening().clear();
        self.shared.set_state(ServerState::Stopped);
        info!("server stopped");
        Ok(())
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            error!(error = %e, "failed to stop server");
        }
    }
}
