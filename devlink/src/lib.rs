//! Device↔host transport and dispatch for on-device agents.
//!
//! `devlink` moves control messages, files, and streamed dump chunks
//! between a device and a host over interchangeable point-to-point
//! transports. It provides:
//!
//! - [`Transport`] implementations ([`UnixTransport`], [`VsockTransport`],
//!   [`LocalTransport`]) behind a first-registration-wins
//!   [`TransportRegistry`];
//! - the frame [`codec`]: handshakes, responses, sliced file transfer,
//!   cache-full backoff;
//! - a [`ComponentRegistry`] routing request codes to [`Component`]s;
//! - the [`ServerManager`] accept loop with device hot-plug and a bounded
//!   [`WorkerPool`];
//! - the [`ChunkPipeline`], a bounded queue that reports saturation back to
//!   the sender instead of blocking or dropping.
//!
//! # Serving
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use devlink::{
//!     ComponentRegistry, PollMux, ServerManager, StaticDevices, TransportKind,
//!     TransportRegistry, UnixTransport,
//! };
//!
//! # fn main() -> devlink::Result<()> {
//! let transports = Arc::new(TransportRegistry::new());
//! transports.register(Arc::new(UnixTransport::new("/run/devlink")))?;
//! let components = Arc::new(ComponentRegistry::new());
//! // components.register(...)?;
//!
//! let mut server = ServerManager::new(transports, components)
//!     .transport(TransportKind::Unix)
//!     .multiplexer(Box::new(PollMux::with_capacity(64)))
//!     .devices(Box::new(StaticDevices::new([0, 1])))
//!     .start()?;
//! // ...
//! server.stop()?;
//! # Ok(())
//! # }
//! ```

#[cfg(unix)]
mod client;
#[cfg(unix)]
pub mod codec;
#[cfg(unix)]
mod component;
#[cfg(unix)]
mod config;
#[cfg(unix)]
mod conn;
mod device;
mod error;
mod handle;
#[cfg(unix)]
mod mux;
#[cfg(unix)]
mod pipeline;
#[cfg(unix)]
mod pool;
mod retry;
#[cfg(unix)]
mod server;
#[cfg(unix)]
mod sys;
#[cfg(unix)]
mod transport;

#[cfg(unix)]
pub use client::Client;
#[cfg(unix)]
pub use codec::{RecvSummary, SendSummary};
#[cfg(unix)]
pub use component::{Component, ComponentRegistry};
#[cfg(unix)]
pub use config::{AgentConfig, DumpConfig, default_socket_dir};
#[cfg(unix)]
pub use conn::Conn;
pub use device::{DeviceSet, DeviceSource, StaticDevices};
pub use devlink_proto as proto;
pub use error::{Error, Result};
pub use handle::{Handle, Resource, Role, TransportKind};
#[cfg(unix)]
pub use mux::{Event, Fault, Interest, Multiplexer, PollMux};
#[cfg(unix)]
pub use pipeline::{
    BaseDirResolver, ChunkPipeline, ChunkSink, DumpChunk, PathResolver, PipelineOptions,
    PushError,
};
#[cfg(unix)]
pub use pool::WorkerPool;
pub use retry::{Backoff, RetryPolicy};
#[cfg(unix)]
pub use server::{ServerHandle, ServerManager, ServerOptions, ServerState};
#[cfg(target_os = "linux")]
pub use transport::VsockTransport;
#[cfg(unix)]
pub use transport::{
    IoMode, LocalTransport, OpenParams, PARAM_DEVICE, PARAM_PEER, PARAM_SERVICE, Transport,
    TransportRegistry, UnixTransport,
};
