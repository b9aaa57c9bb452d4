//! Host-side convenience wrapper around the request exchanges.

use std::fs::File;
use std::io;
use std::path::Path;
use std::sync::Arc;

use devlink_proto::{ChunkPayload, MsgKind, MsgStatus, RequestType};
use tracing::{debug, info, warn};

use crate::codec::{self, RecvSummary, SendSummary};
use crate::conn::Conn;
use crate::error::{Error, Result};
use crate::handle::TransportKind;
use crate::retry::Backoff;
use crate::transport::{IoMode, OpenParams, TransportRegistry};

/// Talks to one device endpoint. Every request uses a fresh session, since
/// the agent serves exactly one request per accepted connection.
#[derive(Debug, Clone)]
pub struct Client {
    /// Registered transports.
    transports: Arc<TransportRegistry>,
    /// Transport to connect over.
    kind: TransportKind,
    /// Endpoint address.
    params: OpenParams,
    /// Cache-full resend budget.
    backoff: Backoff,
}

impl Client {
    /// Creates a client for the endpoint described by `params`.
    pub fn new(transports: Arc<TransportRegistry>, kind: TransportKind, params: OpenParams) -> Self {
        Self {
            transports,
            kind,
            params,
            backoff: Backoff::default(),
        }
    }

    /// Overrides the cache-full resend budget.
    #[must_use]
    pub const fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Opens a new session.
    fn open(&self) -> Result<Conn> {
        Conn::connect(&self.transports, self.kind, &self.params)
    }

    /// Asks the agent for its version string.
    pub fn detect(&self) -> Result<String> {
        let conn = self.open()?;
        codec::send_buffer(&conn, RequestType::Detect.code(), MsgStatus::HandShake, &[])?;
        let frame = codec::recv_frame(&conn, IoMode::NonBlocking)?;
        if frame.header.kind == MsgKind::Ctrl {
            codec::check_response(&frame)?;
            return Err(Error::Rejected(frame.header.status));
        }
        Ok(String::from_utf8_lossy(&frame.payload).into_owned())
    }

    /// Pushes `local` to `remote` on the device.
    ///
    /// `request` selects the flavour (`SendFile`, `FileSync`, `Log`).
    pub fn push_file(&self, local: &Path, remote: &str, request: RequestType) -> Result<SendSummary> {
        let mut file = File::open(local)?;
        let conn = self.open()?;
        codec::handshake(&conn, request.code(), remote.as_bytes())?;
        let summary = codec::send_file(&conn, request.code(), &mut file)?;
        info!(local = %local.display(), remote, bytes = summary.bytes, "file pushed");
        Ok(summary)
    }

    /// Pulls `remote` from the device into `dest`.
    pub fn pull_file(&self, remote: &str, dest: &Path) -> Result<RecvSummary> {
        let conn = self.open()?;
        codec::handshake(&conn, RequestType::FileGet.code(), remote.as_bytes())?;
        let mut file = File::create(dest)?;
        let summary = codec::recv_file(&conn, &mut file)?;
        info!(remote, dest = %dest.display(), bytes = summary.bytes, "file pulled");
        Ok(summary)
    }

    /// Streams dump chunks, resending each one while the agent's queue is
    /// full, then ends the stream with `DataEnd`. Returns the chunk count.
    ///
    /// Chunks are pulled lazily. A source error ends the stream with the
    /// matching failure status instead of `DataEnd` and is returned.
    pub fn send_dump<I>(&self, request: RequestType, chunks: I) -> Result<usize>
    where
        I: IntoIterator<Item = io::Result<ChunkPayload>>,
    {
        let conn = self.open()?;
        let mut sent = 0;
        for item in chunks {
            let chunk = match item {
                Ok(c) => c,
                Err(e) => {
                    let err = Error::from(e);
                    if let Err(report) = codec::send_response(&conn, request.code(), err.status()) {
                        warn!(error = %report, "failed to abort dump stream");
                    }
                    return Err(err);
                }
            };
            let frame = codec::create_packet(request.code(), conn.device(), &chunk.encode()?)?;
            codec::send_with_backoff(&conn, &frame, self.backoff)?;
            sent += 1;
            debug!(name = %chunk.name, offset = chunk.offset, "dump chunk accepted");
        }
        codec::send_response(&conn, request.code(), MsgStatus::DataEnd)?;
        Ok(sent)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::thread;

    use super::*;
    use crate::transport::{LocalTransport, Transport};

    #[test]
    fn detect_reads_version_payload() {
        let transports = Arc::new(TransportRegistry::new());
        let local = Arc::new(LocalTransport::new());
        transports.register(local.clone()).unwrap();
        let params = OpenParams::for_device("svc", 0);
        let server = local.open_server(&params).unwrap();

        let client = Client::new(Arc::clone(&transports), TransportKind::Local, params);
        thread::scope(|s| {
            s.spawn(|| {
                let session = local.accept(&server).unwrap();
                let conn = Conn::new(local.clone(), session);
                let req = codec::recv_frame(&conn, IoMode::Blocking).unwrap();
                assert_eq!(req.header.req_type, RequestType::Detect.code());
                codec::send_buffer(&conn, req.header.req_type, MsgStatus::NoError, b"1.2.3")
                    .unwrap();
            });
            assert_eq!(client.detect().unwrap(), "1.2.3");
        });
    }

    #[test]
    fn detect_surfaces_rejection() {
        let transports = Arc::new(TransportRegistry::new());
        let local = Arc::new(LocalTransport::new());
        transports.register(local.clone()).unwrap();
        let params = OpenParams::for_device("svc", 0);
        let server = local.open_server(&params).unwrap();

        let client = Client::new(transports, TransportKind::Local, params);
        thread::scope(|s| {
            s.spawn(|| {
                let conn = Conn::new(local.clone(), local.accept(&server).unwrap());
                codec::recv_frame(&conn, IoMode::Blocking).unwrap();
                codec::send_response(&conn, 10, MsgStatus::PermissionDenied).unwrap();
            });
            assert!(matches!(
                client.detect(),
                Err(Error::Rejected(MsgStatus::PermissionDenied))
            ));
        });
    }

    #[test]
    fn dump_source_error_aborts_the_stream() {
        let transports = Arc::new(TransportRegistry::new());
        let local = Arc::new(LocalTransport::new());
        transports.register(local.clone()).unwrap();
        let params = OpenParams::for_device("svc", 0);
        let server = local.open_server(&params).unwrap();

        let client = Client::new(transports, TransportKind::Local, params);
        let chunks = vec![
            Ok(ChunkPayload::new("core", 0, vec![1; 4], false)),
            Err(io::Error::other("disk went away")),
            Ok(ChunkPayload::new("core", 4, vec![2; 4], true)),
        ];
        thread::scope(|s| {
            let agent = s.spawn(|| {
                let conn = Conn::new(local.clone(), local.accept(&server).unwrap());
                let first = codec::recv_frame(&conn, IoMode::Blocking).unwrap();
                assert_eq!(first.header.kind, MsgKind::Data);
                codec::send_response(&conn, first.header.req_type, MsgStatus::NoError).unwrap();
                codec::recv_frame(&conn, IoMode::Blocking).unwrap().header
            });
            assert!(matches!(
                client.send_dump(RequestType::Dump, chunks),
                Err(Error::Io(_))
            ));
            let end = agent.join().unwrap();
            assert_eq!(end.kind, MsgKind::Ctrl);
            assert_eq!(end.status, MsgStatus::FileError);
        });
    }
}
