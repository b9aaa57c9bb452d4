//! Bounded chunk queue drained by one background thread.
//!
//! Network readers [`push`](ChunkPipeline::push) received dump chunks; a
//! full queue is reported back immediately so the sender can be told to
//! retry, instead of blocking the reader or dropping data. The drain thread
//! forwards each chunk to a registered [`ChunkSink`] or writes it to disk.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use devlink_proto::{ChunkPayload, Frame, MsgStatus};
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};

/// Granularity of drain-thread and shutdown waits.
const TICK: Duration = Duration::from_millis(500);

/// One received chunk frame and its payload length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpChunk {
    /// Frame as read off the wire.
    frame: Frame,
    /// Payload length in bytes.
    len: usize,
}

impl DumpChunk {
    /// Takes ownership of a received frame.
    pub fn new(frame: Frame) -> Self {
        let len = frame.payload.len();
        Self { frame, len }
    }

    /// The wrapped frame.
    pub const fn frame(&self) -> &Frame {
        &self.frame
    }

    /// Raw chunk bytes.
    pub fn payload(&self) -> &[u8] {
        &self.frame.payload
    }

    /// Payload length in bytes.
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` for an empty chunk.
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Gives the frame back.
    pub fn into_frame(self) -> Frame {
        self.frame
    }
}

/// External consumer replacing the disk path. Receives the raw chunk bytes.
pub type ChunkSink = Arc<dyn Fn(&[u8]) -> Result<()> + Send + Sync>;

/// Maps a chunk's embedded file name to a path under a base directory.
pub trait PathResolver: Send + Sync + fmt::Debug {
    /// Resolves `name` under `base`.
    fn resolve(&self, base: &Path, name: &str) -> Result<PathBuf>;
}

/// Strips a remote `host:` prefix and configured path prefixes, then joins
/// the remainder onto the base directory.
///
/// Names that are empty or climb out of the base directory are rejected.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BaseDirResolver {
    /// Prefixes removed from the front of a name (first match wins).
    strip_prefixes: Vec<String>,
}

impl BaseDirResolver {
    /// Creates a resolver that strips `prefixes`.
    pub fn new(prefixes: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            strip_prefixes: prefixes.into_iter().map(Into::into).collect(),
        }
    }
}

impl PathResolver for BaseDirResolver {
    fn resolve(&self, base: &Path, name: &str) -> Result<PathBuf> {
        let mut rel = name;
        if let Some((host, rest)) = rel.split_once(':')
            && !host.is_empty()
            && !host.contains('/')
        {
            rel = rest;
        }
        if let Some(stripped) = self
            .strip_prefixes
            .iter()
            .find_map(|p| rel.strip_prefix(p.as_str()))
        {
            rel = stripped;
        }
        let mut clean = PathBuf::new();
        for part in Path::new(rel.trim_start_matches('/')).components() {
            match part {
                Component::Normal(p) => clean.push(p),
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(Error::InvalidPath(name.to_owned()));
                }
            }
        }
        if clean.as_os_str().is_empty() {
            return Err(Error::InvalidPath(name.to_owned()));
        }
        Ok(base.join(clean))
    }
}

/// Rejected push; carries the chunk back to the caller.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum PushError {
    /// The queue is at capacity; retry later.
    #[error("chunk queue is full")]
    Full(DumpChunk),
    /// The pipeline is shutting down.
    #[error("chunk pipeline is closed")]
    Closed(DumpChunk),
}

impl PushError {
    /// Returns the rejected chunk.
    pub fn into_chunk(self) -> DumpChunk {
        match self {
            Self::Full(c) | Self::Closed(c) => c,
        }
    }

    /// Wire status to answer the sender with.
    pub const fn status(&self) -> MsgStatus {
        match self {
            Self::Full(_) => MsgStatus::CacheFull,
            Self::Closed(_) => MsgStatus::FileError,
        }
    }
}

/// Tunables for a [`ChunkPipeline`].
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct PipelineOptions {
    /// Queue capacity.
    pub capacity: usize,
    /// Directory chunks are written under.
    pub base_dir: PathBuf,
    /// Chunk name → path strategy.
    pub resolver: Arc<dyn PathResolver>,
    /// Upper bound on the shutdown drain wait.
    pub drain_timeout: Duration,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            capacity: 64,
            base_dir: std::env::temp_dir().join("devlink-dump"),
            resolver: Arc::new(BaseDirResolver::default()),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

/// State shared with the drain thread.
struct Inner {
    /// Chunks pushed but not yet fully processed.
    pending: Mutex<usize>,
    /// Signalled when `pending` drops to zero.
    idle: Condvar,
    /// Tells the drain thread to exit.
    quit: AtomicBool,
    /// Optional external consumer.
    sink: RwLock<Option<ChunkSink>>,
    /// Chunks processed successfully.
    written: AtomicU64,
    /// Chunks that failed.
    failed: AtomicU64,
    /// Disk base directory.
    base_dir: PathBuf,
    /// Chunk name → path strategy.
    resolver: Arc<dyn PathResolver>,
}

impl fmt::Debug for Inner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inner")
            .field("pending", &self.pending)
            .field("base_dir", &self.base_dir)
            .field("resolver", &self.resolver)
            .finish_non_exhaustive()
    }
}

impl Inner {
    /// Locks the pending counter.
    fn pending(&self) -> MutexGuard<'_, usize> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Marks one chunk as finished.
    fn done(&self) {
        let mut pending = self.pending();
        *pending = pending.saturating_sub(1);
        if *pending == 0 {
            self.idle.notify_all();
        }
    }

    /// Drain loop.
    fn drain(&self, rx: &Receiver<DumpChunk>) {
        while !self.quit.load(Ordering::Acquire) {
            match rx.recv_timeout(TICK) {
                Ok(chunk) => {
                    self.process(&chunk);
                    self.done();
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        debug!("chunk drain thread exited");
    }

    /// Forwards or writes one chunk.
    fn process(&self, chunk: &DumpChunk) {
        let sink = self
            .sink
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let res = match sink {
            Some(sink) => sink(chunk.payload()),
            None => self.write(chunk),
        };
        match res {
            Ok(()) => {
                self.written.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                error!(len = chunk.len(), error = %e, "failed to consume dump chunk");
            }
        }
    }

    /// Writes a chunk at its offset in its resolved file.
    fn write(&self, chunk: &DumpChunk) -> Result<()> {
        let payload = ChunkPayload::decode(chunk.payload())?;
        let path = self.resolver.resolve(&self.base_dir, &payload.name)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)?;
        file.seek(SeekFrom::Start(payload.offset))?;
        file.write_all(&payload.data)?;
        if payload.last {
            file.sync_all()?;
            info!(path = %path.display(), "dump file complete");
        }
        Ok(())
    }
}

/// Bounded producer/consumer queue with one drain thread.
#[derive(Debug)]
pub struct ChunkPipeline {
    /// Producer side; `None` once intake stopped.
    tx: Mutex<Option<Sender<DumpChunk>>>,
    /// State shared with the drain thread.
    inner: Arc<Inner>,
    /// Drain thread; `None` once joined.
    drain: Mutex<Option<JoinHandle<()>>>,
    /// Queue capacity.
    capacity: usize,
    /// Upper bound on the shutdown drain wait.
    drain_timeout: Duration,
}

impl ChunkPipeline {
    /// Starts the drain thread.
    pub fn start(options: PipelineOptions) -> Result<Self> {
        let capacity = options.capacity.max(1);
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        let inner = Arc::new(Inner {
            pending: Mutex::new(0),
            idle: Condvar::new(),
            quit: AtomicBool::new(false),
            sink: RwLock::new(None),
            written: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            base_dir: options.base_dir,
            resolver: options.resolver,
        });
        let shared = Arc::clone(&inner);
        let drain = thread::Builder::new()
            .name("devlink-drain".to_owned())
            .spawn(move || shared.drain(&rx))?;
        Ok(Self {
            tx: Mutex::new(Some(tx)),
            inner,
            drain: Mutex::new(Some(drain)),
            capacity,
            drain_timeout: options.drain_timeout,
        })
    }

    /// Registers an external consumer; it replaces the disk path.
    pub fn set_sink(&self, sink: ChunkSink) {
        *self.inner.sink.write().unwrap_or_else(PoisonError::into_inner) = Some(sink);
    }

    /// Removes the external consumer.
    pub fn clear_sink(&self) {
        *self.inner.sink.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Queues `chunk` without blocking.
    ///
    /// A full queue yields [`PushError::Full`] carrying the chunk back, so
    /// nothing is dropped behind the caller's back.
    pub fn push(&self, chunk: DumpChunk) -> std::result::Result<(), PushError> {
        // Held until the chunk is counted and queued, so shutdown cannot
        // close intake between the two and miss it.
        let intake = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = intake.as_ref() else {
            return Err(PushError::Closed(chunk));
        };
        *self.inner.pending() += 1;
        match tx.try_send(chunk) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(c)) => {
                self.inner.done();
                Err(PushError::Full(c))
            }
            Err(TrySendError::Disconnected(c)) => {
                self.inner.done();
                Err(PushError::Closed(c))
            }
        }
    }

    /// Queue capacity.
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Chunks queued or being processed.
    pub fn pending(&self) -> usize {
        *self.inner.pending()
    }

    /// Chunks consumed successfully so far.
    pub fn written(&self) -> u64 {
        self.inner.written.load(Ordering::Relaxed)
    }

    /// Chunks that failed so far.
    pub fn failed(&self) -> u64 {
        self.inner.failed.load(Ordering::Relaxed)
    }

    /// Two-phase shutdown: stop intake, wait for the queue and the
    /// in-flight chunk to finish (bounded by the drain timeout), then stop
    /// and join the drain thread.
    ///
    /// Returns `true` if everything was drained. Idempotent.
    pub fn shutdown(&self) -> bool {
        let intake_open = self
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some();
        if intake_open {
            debug!(pending = self.pending(), "chunk pipeline draining");
        }

        let deadline = Instant::now() + self.drain_timeout;
        let mut pending = self.inner.pending();
        while *pending > 0 {
            let now = Instant::now();
            if now >= deadline {
                warn!(pending = *pending, "chunk pipeline drain timed out");
                break;
            }
            let wait = TICK.min(deadline - now);
            pending = self
                .inner
                .idle
                .wait_timeout(pending, wait)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        let drained = *pending == 0;
        drop(pending);

        self.inner.quit.store(true, Ordering::Release);
        let drain = self
            .drain
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = drain
            && handle.join().is_err()
        {
            error!("chunk drain thread panicked");
        }
        drained
    }
}

impl Drop for ChunkPipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}
