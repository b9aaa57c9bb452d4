//! devlink agent: serves detect, file transfer, and dump requests for the
//! devices attached to this host.
//!
//! Configuration comes from an optional JSON file (see
//! [`devlink::AgentConfig`]); command-line flags override it. `SIGHUP`
//! re-reads the file and applies device arrivals and removals without a
//! restart. `SIGINT`/`SIGTERM` stop the server and drain the dump queue.
#![allow(clippy::print_stderr)]

#[cfg(unix)]
mod detect;
#[cfg(unix)]
mod dump;
#[cfg(unix)]
mod files;

#[cfg(not(unix))]
fn main() {
    eprintln!("devlink-agent requires a Unix host");
    std::process::exit(1);
}

#[cfg(unix)]
fn main() {
    use clap::Parser;

    init_tracing();
    if let Err(e) = agent::run(agent::Args::parse()) {
        eprintln!("devlink-agent: {e:#}");
        std::process::exit(1);
    }
}

/// Installs the `RUST_LOG`-driven subscriber, defaulting to `info`.
#[cfg(unix)]
fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[cfg(unix)]
mod agent {
    use std::collections::BTreeSet;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;

    use anyhow::{Context, Result, bail};
    use clap::Parser;
    use devlink::{
        AgentConfig, ChunkPipeline, ComponentRegistry, DeviceSet, PollMux, ServerManager,
        Transport, TransportKind, TransportRegistry, UnixTransport,
    };
    use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
    use tracing::{info, warn};

    use crate::detect::Detect;
    use crate::dump::Dump;
    use crate::files::FileTransfer;

    /// How often the main thread checks the signal flags.
    const TICK: Duration = Duration::from_millis(100);

    /// Command-line arguments.
    #[derive(Debug, Parser)]
    #[command(name = "devlink-agent", version, about = "Device-side devlink agent")]
    pub(crate) struct Args {
        /// JSON configuration file.
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Transport to serve on (unix, vsock).
        #[arg(long)]
        transport: Option<TransportKind>,

        /// Device to serve; repeat for several. Overrides the configuration.
        #[arg(long = "device")]
        devices: Vec<u16>,

        /// Write the effective configuration to this file and exit.
        #[arg(long, value_name = "PATH")]
        write_config: Option<PathBuf>,
    }

    impl Args {
        /// Loads the configuration file, then applies flag overrides.
        fn config(&self) -> Result<AgentConfig> {
            let mut cfg = match &self.config {
                Some(path) => AgentConfig::load(path)
                    .with_context(|| format!("loading {}", path.display()))?,
                None => AgentConfig::default(),
            };
            if let Some(kind) = self.transport {
                cfg.transport = kind;
            }
            if !self.devices.is_empty() {
                cfg.devices.clone_from(&self.devices);
            }
            Ok(cfg)
        }
    }

    /// Builds the endpoint transport named by the configuration.
    fn transport(cfg: &AgentConfig) -> Result<Arc<dyn Transport>> {
        match cfg.transport {
            TransportKind::Unix => Ok(Arc::new(UnixTransport::with_retry(
                &cfg.socket_dir,
                cfg.read_retry,
            ))),
            #[cfg(target_os = "linux")]
            TransportKind::Vsock => Ok(Arc::new(devlink::VsockTransport::with_retry(
                cfg.vsock_port_base,
                cfg.read_retry,
            ))),
            other => bail!("transport `{other}` cannot serve device endpoints"),
        }
    }

    /// Brings the live device set in line with `wanted`.
    fn apply_devices(set: &DeviceSet, current: &mut BTreeSet<u16>, devices: &[u16]) {
        let wanted: BTreeSet<u16> = devices.iter().copied().collect();
        for &gone in current.difference(&wanted) {
            info!(device = gone, "device removed from configuration");
            set.disable(gone);
        }
        for &new in wanted.difference(current) {
            info!(device = new, "device added to configuration");
            set.enable(new);
        }
        *current = wanted;
    }

    /// Runs the agent until `SIGINT` or `SIGTERM`.
    pub(crate) fn run(args: Args) -> Result<()> {
        let cfg = args.config()?;
        if let Some(path) = &args.write_config {
            cfg.save(path)
                .with_context(|| format!("writing {}", path.display()))?;
            return Ok(());
        }

        let transports = Arc::new(TransportRegistry::new());
        transports.register(transport(&cfg)?)?;

        let pipeline = Arc::new(ChunkPipeline::start(cfg.pipeline_options())?);
        let components = Arc::new(ComponentRegistry::new());
        components.register(Arc::new(Detect::new(env!("CARGO_PKG_VERSION"))))?;
        components.register(Arc::new(FileTransfer::new(&cfg.storage_root)))?;
        components.register(Arc::new(Dump::new(Arc::clone(&pipeline))))?;

        let devices = DeviceSet::new(cfg.devices.iter().copied());
        let mut current: BTreeSet<u16> = cfg.devices.iter().copied().collect();
        let mut server = ServerManager::new(transports, components)
            .transport(cfg.transport)
            .multiplexer(Box::new(PollMux::with_capacity(cfg.event_capacity)))
            .devices(Box::new(devices.clone()))
            .options(cfg.server_options())
            .start()
            .context("starting server")?;

        let quit = Arc::new(AtomicBool::new(false));
        let reload = Arc::new(AtomicBool::new(false));
        signal_hook::flag::register(SIGINT, Arc::clone(&quit))?;
        signal_hook::flag::register(SIGTERM, Arc::clone(&quit))?;
        signal_hook::flag::register(SIGHUP, Arc::clone(&reload))?;
        info!(
            transport = %cfg.transport,
            service = %cfg.service,
            devices = ?cfg.devices,
            "agent running"
        );

        while !quit.load(Ordering::Relaxed) {
            thread::sleep(TICK);
            if reload.swap(false, Ordering::Relaxed) {
                match args.config() {
                    Ok(fresh) => apply_devices(&devices, &mut current, &fresh.devices),
                    Err(e) => warn!(error = %e, "reload failed, keeping current devices"),
                }
            }
        }

        info!("shutting down");
        server.stop()?;
        if !pipeline.shutdown() {
            warn!(pending = pipeline.pending(), "dump queue not fully drained");
        }
        info!(
            written = pipeline.written(),
            failed = pipeline.failed(),
            "agent stopped"
        );
        Ok(())
    }

}

/// Helpers shared by the component tests.
#[cfg(all(test, unix))]
#[allow(clippy::unwrap_used)]
mod test_support {
    use std::sync::Arc;
    use std::thread;

    use devlink::{
        Client, Component, Conn, IoMode, LocalTransport, OpenParams, Transport, TransportKind,
        TransportRegistry, codec,
    };

    /// Runs `host` against `component` serving a single connection, the way
    /// a worker would. Returns what `host` returned and the component result.
    pub(crate) fn serve_once<T>(
        component: &dyn Component,
        host: impl FnOnce(&Client) -> T,
    ) -> (T, devlink::Result<()>) {
        let local = Arc::new(LocalTransport::new());
        let transports = Arc::new(TransportRegistry::new());
        transports.register(Arc::clone(&local) as Arc<dyn Transport>).unwrap();
        let params = OpenParams::for_device("agent-test", 0);
        let server = local.open_server(&params).unwrap();
        let client = Client::new(transports, TransportKind::Local, params);

        thread::scope(|s| {
            let worker = s.spawn(|| {
                let session = local.accept(&server).unwrap();
                let mut conn = Conn::new(Arc::clone(&local) as Arc<dyn Transport>, session);
                let frame = codec::recv_frame(&conn, IoMode::Blocking).unwrap();
                component.process(&mut conn, &frame)
            });
            let out = host(&client);
            (out, worker.join().unwrap())
        })
    }
}
