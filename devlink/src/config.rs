//! Agent configuration, loaded from JSON.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::handle::TransportKind;
use crate::pipeline::{BaseDirResolver, PipelineOptions};
use crate::retry::RetryPolicy;
use crate::server::ServerOptions;

/// Dump pipeline settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct DumpConfig {
    /// Directory dump chunks are written under.
    pub dir: PathBuf,
    /// Chunk queue capacity.
    pub queue_capacity: usize,
    /// Name prefixes removed before joining onto `dir`.
    pub strip_prefixes: Vec<String>,
    /// Upper bound on the shutdown drain wait, in milliseconds.
    pub drain_timeout_ms: u64,
}

impl Default for DumpConfig {
    fn default() -> Self {
        Self {
            dir: std::env::temp_dir().join("devlink").join("dump"),
            queue_capacity: 64,
            strip_prefixes: Vec::new(),
            drain_timeout_ms: 30_000,
        }
    }
}

/// Device-side agent configuration.
///
/// Every field has a default, so `{}` is a valid configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct AgentConfig {
    /// Transport to serve on.
    pub transport: TransportKind,
    /// Service name used in endpoint addresses.
    pub service: String,
    /// Directory holding Unix sockets.
    pub socket_dir: PathBuf,
    /// Vsock port of device 0.
    pub vsock_port_base: u32,
    /// Devices served from startup.
    pub devices: Vec<u16>,
    /// Worker threads.
    pub workers: usize,
    /// Accepted connections that may wait for a worker.
    pub accept_queue: usize,
    /// Loop wait timeout / hot-plug period, in milliseconds.
    pub poll_interval_ms: u64,
    /// Multiplexer event table size.
    pub event_capacity: usize,
    /// How long an accepted connection may stay silent, in milliseconds.
    pub request_timeout_ms: u64,
    /// Non-blocking read budget.
    pub read_retry: RetryPolicy,
    /// Root directory for pushed and pulled files.
    pub storage_root: PathBuf,
    /// Dump pipeline settings.
    pub dump: DumpConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        let server = ServerOptions::default();
        Self {
            transport: TransportKind::Unix,
            service: server.service,
            socket_dir: default_socket_dir(),
            vsock_port_base: 7000,
            devices: vec![0],
            workers: server.workers,
            accept_queue: server.accept_queue,
            #[allow(clippy::cast_possible_truncation)]
            poll_interval_ms: server.poll_interval.as_millis() as u64,
            event_capacity: server.event_capacity,
            #[allow(clippy::cast_possible_truncation)]
            request_timeout_ms: server.request_timeout.as_millis() as u64,
            read_retry: RetryPolicy::default(),
            storage_root: std::env::temp_dir().join("devlink").join("files"),
            dump: DumpConfig::default(),
        }
    }
}

/// Default directory for Unix sockets.
pub fn default_socket_dir() -> PathBuf {
    std::env::temp_dir().join("devlink")
}

impl AgentConfig {
    /// Loads a configuration from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }

    /// Writes the configuration as pretty JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        let file = fs::File::create(path)?;
        serde_json::to_writer_pretty(file, self)?;
        Ok(())
    }

    /// Server tunables derived from this configuration.
    pub fn server_options(&self) -> ServerOptions {
        let mut o = ServerOptions::default();
        o.service.clone_from(&self.service);
        o.workers = self.workers;
        o.accept_queue = self.accept_queue;
        o.poll_interval = Duration::from_millis(self.poll_interval_ms);
        o.event_capacity = self.event_capacity;
        o.request_timeout = Duration::from_millis(self.request_timeout_ms);
        o
    }

    /// Pipeline tunables derived from this configuration.
    pub fn pipeline_options(&self) -> PipelineOptions {
        let mut o = PipelineOptions::default();
        o.capacity = self.dump.queue_capacity;
        o.base_dir.clone_from(&self.dump.dir);
        o.resolver = Arc::new(BaseDirResolver::new(self.dump.strip_prefixes.clone()));
        o.drain_timeout = Duration::from_millis(self.dump.drain_timeout_ms);
        o
    }
}
