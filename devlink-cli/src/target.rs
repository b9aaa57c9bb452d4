//! Which agent endpoint to talk to, and how.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use devlink::proto::ChunkPayload;
use devlink::{
    AgentConfig, Client, OpenParams, PARAM_PEER, Transport, TransportKind, TransportRegistry,
    UnixTransport,
};

/// Endpoint selection flags shared by every subcommand.
///
/// Defaults come from the agent configuration file when one is present, so
/// a host sharing the agent's config needs no flags at all.
#[derive(Debug, clap::Args)]
pub(crate) struct TargetArgs {
    /// Agent configuration to read endpoint defaults from.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Transport (unix, vsock).
    #[arg(long, global = true)]
    transport: Option<TransportKind>,

    /// Directory holding the agent's Unix sockets.
    #[arg(long, global = true, value_name = "DIR")]
    socket_dir: Option<PathBuf>,

    /// Service name of the agent.
    #[arg(long, global = true)]
    service: Option<String>,

    /// Device to address.
    #[arg(short, long, global = true, default_value_t = 0)]
    device: u16,

    /// Vsock context id of the peer.
    #[arg(long, global = true)]
    peer: Option<String>,
}

/// Conventional agent config location.
fn default_config() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("devlink").join("agent.json"))
}

impl TargetArgs {
    /// Effective agent configuration: file defaults plus flag overrides.
    fn config(&self) -> Result<AgentConfig> {
        let mut cfg = match &self.config {
            Some(path) => AgentConfig::load(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => match default_config().filter(|p| p.is_file()) {
                Some(path) => AgentConfig::load(&path)
                    .with_context(|| format!("loading {}", path.display()))?,
                None => AgentConfig::default(),
            },
        };
        if let Some(kind) = self.transport {
            cfg.transport = kind;
        }
        if let Some(dir) = &self.socket_dir {
            cfg.socket_dir.clone_from(dir);
        }
        if let Some(service) = &self.service {
            cfg.service.clone_from(service);
        }
        Ok(cfg)
    }

    /// Endpoint address for the selected device.
    fn params(&self, cfg: &AgentConfig) -> OpenParams {
        let params = OpenParams::for_device(&cfg.service, self.device);
        match &self.peer {
            Some(peer) => params.with(PARAM_PEER, peer.as_str()),
            None => params,
        }
    }

    /// Builds a client for the selected endpoint.
    pub(crate) fn client(&self) -> Result<Client> {
        let cfg = self.config()?;
        let transport: Arc<dyn Transport> = match cfg.transport {
            TransportKind::Unix => Arc::new(UnixTransport::with_retry(
                &cfg.socket_dir,
                cfg.read_retry,
            )),
            #[cfg(target_os = "linux")]
            TransportKind::Vsock => Arc::new(devlink::VsockTransport::with_retry(
                cfg.vsock_port_base,
                cfg.read_retry,
            )),
            other => bail!("transport `{other}` cannot reach an agent"),
        };
        let transports = Arc::new(TransportRegistry::new());
        transports.register(transport)?;
        Ok(Client::new(transports, cfg.transport, self.params(&cfg)))
    }
}

/// Final path component of `path` as UTF-8.
pub(crate) fn file_name(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_owned)
        .with_context(|| format!("{} has no usable file name", path.display()))
}

/// Opens a local file for streaming as dump chunks of at most `size` bytes.
pub(crate) fn chunk_file(path: &Path, name: &str, size: usize) -> Result<FileChunks> {
    if size == 0 {
        bail!("chunk size must be positive");
    }
    let file = File::open(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(FileChunks {
        reader: BufReader::new(file),
        name: name.to_owned(),
        size,
        offset: 0,
        ahead: None,
        done: false,
    })
}

/// Reads a file one chunk at a time.
///
/// One chunk is read ahead so the final chunk can carry the last flag. An
/// empty file yields a single empty, final chunk.
#[derive(Debug)]
pub(crate) struct FileChunks {
    /// Source file.
    reader: BufReader<File>,
    /// Name recorded in every chunk.
    name: String,
    /// Maximum chunk data length.
    size: usize,
    /// File offset of the next chunk returned.
    offset: u64,
    /// Data read ahead of the chunk being returned.
    ahead: Option<Vec<u8>>,
    /// Set after the final chunk or an error.
    done: bool,
}

impl FileChunks {
    /// Reads up to `size` bytes; empty at end of file.
    fn read_chunk(&mut self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.size);
        self.reader
            .by_ref()
            .take(self.size as u64)
            .read_to_end(&mut buf)?;
        Ok(buf)
    }

    /// Produces the next chunk, or `None` past the final one.
    fn advance(&mut self) -> io::Result<Option<ChunkPayload>> {
        if self.done {
            return Ok(None);
        }
        let data = match self.ahead.take() {
            Some(d) => d,
            None => self.read_chunk()?,
        };
        let following = if data.is_empty() {
            Vec::new()
        } else {
            self.read_chunk()?
        };
        let last = following.is_empty();
        let chunk = ChunkPayload::new(self.name.as_str(), self.offset, data, last);
        self.offset += chunk.data.len() as u64;
        if last {
            self.done = true;
        } else {
            self.ahead = Some(following);
        }
        Ok(Some(chunk))
    }
}

impl Iterator for FileChunks {
    type Item = io::Result<ChunkPayload>;

    fn next(&mut self) -> Option<Self::Item> {
        self.advance()
            .inspect_err(|_| self.done = true)
            .transpose()
    }
}
