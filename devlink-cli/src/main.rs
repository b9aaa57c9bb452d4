//! Host-side CLI for devlink agents.

#![allow(
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::missing_docs_in_private_items
)]

#[cfg(unix)]
mod target;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use devlink::proto::MAX_PAYLOAD;

/// Chunk header bytes with the longest name: name length, name, flag, offset.
const CHUNK_OVERHEAD: usize = 2 + u16::MAX as usize + 1 + 8;

/// Largest chunk that fits one frame whatever the name.
#[allow(clippy::cast_possible_truncation)]
const MAX_CHUNK: u32 = (MAX_PAYLOAD - CHUNK_OVERHEAD) as u32;

#[derive(Parser)]
#[command(name = "devlink", version, about = "Talk to a devlink agent")]
struct Cli {
    #[cfg(unix)]
    #[command(flatten)]
    target: target::TargetArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the agent version.
    Detect,

    /// Copy a local file to the device.
    Push {
        /// Local file.
        local: std::path::PathBuf,
        /// Destination path on the device.
        remote: String,
        /// Append to a device log instead of replacing.
        #[arg(long, conflicts_with = "sync")]
        log: bool,
        /// Mark the transfer as part of a directory sync.
        #[arg(long)]
        sync: bool,
    },

    /// Copy a device file to the host.
    Pull {
        /// Source path on the device.
        remote: String,
        /// Local destination.
        local: std::path::PathBuf,
    },

    /// Stream a local file to the agent's dump area in chunks.
    Dump {
        /// Local file to stream.
        file: std::path::PathBuf,
        /// Name recorded on the device; defaults to the file name.
        #[arg(long)]
        name: Option<String>,
        /// Chunk size in bytes.
        #[arg(
            long,
            default_value_t = 64 * 1024,
            value_parser = clap::value_parser!(u32).range(1..=i64::from(MAX_CHUNK)),
        )]
        chunk_size: u32,
        /// Dump stream flavour.
        #[arg(long, value_enum, default_value = "dump")]
        kind: DumpKind,
    },

    /// Generate shell completion scripts.
    #[command(hide = true)]
    Completion {
        /// Target shell.
        shell: Shell,
    },
}

/// Dump stream flavours.
#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum DumpKind {
    /// Tensor / core dump.
    Dump,
    /// Operator dump.
    Ome,
    /// Black-box crash record.
    Blackbox,
}

fn main() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    if let Err(e) = Cli::parse().dispatch() {
        eprintln!("devlink: {e:#}");
        std::process::exit(1);
    }
}

impl Cli {
    fn dispatch(self) -> anyhow::Result<()> {
        if let Command::Completion { shell } = self.command {
            clap_complete::generate(shell, &mut Self::command(), "devlink", &mut std::io::stdout());
            return Ok(());
        }
        self.run()
    }

    #[cfg(unix)]
    fn run(self) -> anyhow::Result<()> {
        use devlink::proto::RequestType;

        let client = self.target.client()?;
        match self.command {
            Command::Detect => println!("{}", client.detect()?),
            Command::Push {
                local,
                remote,
                log,
                sync,
            } => {
                let request = if log {
                    RequestType::Log
                } else if sync {
                    RequestType::FileSync
                } else {
                    RequestType::SendFile
                };
                let sent = client.push_file(&local, &remote, request)?;
                println!("{} bytes in {} slices", sent.bytes, sent.slices);
            }
            Command::Pull { remote, local } => {
                let got = client.pull_file(&remote, &local)?;
                println!("{} bytes -> {}", got.bytes, local.display());
            }
            Command::Dump {
                file,
                name,
                chunk_size,
                kind,
            } => {
                let request = match kind {
                    DumpKind::Dump => RequestType::Dump,
                    DumpKind::Ome => RequestType::OmeDump,
                    DumpKind::Blackbox => RequestType::Blackbox,
                };
                let label = match name {
                    Some(n) => n,
                    None => target::file_name(&file)?,
                };
                let chunks = target::chunk_file(&file, &label, usize::try_from(chunk_size)?)?;
                let n = client.send_dump(request, chunks)?;
                println!("{n} chunks -> {label}");
            }
            Command::Completion { .. } => {}
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn run(self) -> anyhow::Result<()> {
        anyhow::bail!("devlink transports require a Unix host")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk_size(arg: &str) -> Option<u32> {
        let cli = Cli::try_parse_from(["devlink", "dump", "core.0", "--chunk-size", arg]).ok()?;
        match cli.command {
            Command::Dump { chunk_size, .. } => Some(chunk_size),
            _ => None,
        }
    }

    #[test]
    fn chunk_size_is_bounded_by_the_frame_payload() {
        assert_eq!(chunk_size("4096"), Some(4096));
        assert_eq!(chunk_size(&MAX_CHUNK.to_string()), Some(MAX_CHUNK));
        assert_eq!(chunk_size("0"), None);
        assert_eq!(chunk_size(&(MAX_CHUNK + 1).to_string()), None);
        assert_eq!(chunk_size(&MAX_PAYLOAD.to_string()), None);
    }

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }
}
