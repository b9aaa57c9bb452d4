//! Fixed-size worker pool fed by the bounded accept queue.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, warn};

use crate::codec;
use crate::component::ComponentRegistry;
use crate::conn::Conn;
use crate::error::{Error, Result};
use crate::transport::IoMode;

/// Worker threads that each serve one accepted connection at a time.
///
/// [`submit`](Self::submit) blocks while the queue is full, so a saturated
/// pool slows the accept path instead of dropping connections.
#[derive(Debug)]
pub struct WorkerPool {
    /// Queue feeding the workers; `None` after shutdown.
    tx: Option<Sender<Conn>>,
    /// Number of worker threads.
    workers: usize,
}

impl WorkerPool {
    /// Spawns `workers` threads reading from a queue of `queue` slots.
    ///
    /// A connection that sends no request within `request_timeout` is
    /// closed so it cannot hold a worker. Zero workers is refused.
    pub fn spawn(
        workers: usize,
        queue: usize,
        request_timeout: Duration,
        components: Arc<ComponentRegistry>,
    ) -> Result<Self> {
        if workers == 0 {
            return Err(Error::NotReady("worker pool needs at least one worker"));
        }
        let (tx, rx) = crossbeam_channel::bounded::<Conn>(queue);
        for i in 0..workers {
            let rx = rx.clone();
            let components = Arc::clone(&components);
            thread::Builder::new()
                .name(format!("devlink-worker-{i}"))
                .spawn(move || work(&rx, &components, request_timeout))?;
        }
        Ok(Self {
            tx: Some(tx),
            workers,
        })
    }

    /// Number of worker threads.
    pub const fn workers(&self) -> usize {
        self.workers
    }

    /// Number of connections waiting for a worker.
    pub fn queued(&self) -> usize {
        self.tx.as_ref().map_or(0, Sender::len)
    }

    /// Hands `conn` to a worker, blocking while the queue is full.
    pub fn submit(&self, conn: Conn) -> Result<()> {
        let tx = self.tx.as_ref().ok_or(Error::NotReady("worker pool stopped"))?;
        tx.send(conn).map_err(|_| Error::NotReady("worker pool stopped"))
    }

    /// Stops intake. Workers drain what is queued and exit; they are not
    /// joined.
    pub fn shutdown(&mut self) {
        if self.tx.take().is_some() {
            debug!(workers = self.workers, "worker pool stopping");
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Worker loop.
fn work(rx: &Receiver<Conn>, components: &ComponentRegistry, request_timeout: Duration) {
    while let Ok(mut conn) = rx.recv() {
        serve(&mut conn, components, request_timeout);
        if let Err(e) = conn.close() {
            warn!(device = conn.device(), error = %e, "failed to close session");
        }
    }
}

/// Reads one request from `conn` and dispatches it.
fn serve(conn: &mut Conn, components: &ComponentRegistry, request_timeout: Duration) {
    match conn.wait_readable(request_timeout) {
        Ok(true) => {}
        Ok(false) => {
            debug!(
                device = conn.device(),
                timeout = ?request_timeout,
                "no request in time, closing"
            );
            return;
        }
        Err(e) => {
            warn!(device = conn.device(), error = %e, "failed to wait for request");
            return;
        }
    }
    let frame = match codec::recv_frame(conn, IoMode::NonBlocking) {
        Ok(f) => f,
        Err(Error::Closed) => {
            debug!(device = conn.device(), "peer closed before sending a request");
            return;
        }
        Err(e) => {
            warn!(device = conn.device(), error = %e, "failed to read request");
            return;
        }
    };
    // Already logged at error by dispatch; the connection is closed either way.
    if let Err(e) = components.dispatch(conn, &frame) {
        debug!(
            device = conn.device(),
            req_type = frame.header.req_type,
            status = ?e.status(),
            "request failed"
        );
    }
}
