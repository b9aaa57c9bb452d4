//! Streamed dump intake.

use std::sync::Arc;

use devlink::proto::{ComponentType, Frame, MsgKind, MsgStatus};
use devlink::{ChunkPipeline, Component, Conn, DumpChunk, IoMode, PushError, codec};
use tracing::{debug, info};

/// Feeds every dump chunk of a session into the shared pipeline.
///
/// Each chunk is answered individually: `NoError` once queued, `CacheFull`
/// when the queue is saturated so the host resends it later. A control
/// frame ends the stream.
#[derive(Debug)]
pub(crate) struct Dump {
    /// Queue drained to disk in the background.
    pipeline: Arc<ChunkPipeline>,
}

impl Dump {
    /// Creates a handler pushing into `pipeline`.
    pub(crate) const fn new(pipeline: Arc<ChunkPipeline>) -> Self {
        Self { pipeline }
    }
}

impl Component for Dump {
    fn component_type(&self) -> ComponentType {
        ComponentType::Dump
    }

    fn process(&self, conn: &mut Conn, frame: &Frame) -> devlink::Result<()> {
        let mut next = frame.clone();
        let (mut queued, mut refused) = (0u64, 0u64);
        loop {
            let h = next.header;
            if h.kind == MsgKind::Ctrl {
                info!(device = conn.device(), queued, refused, status = ?h.status, "dump stream ended");
                return Ok(());
            }
            let status = match self.pipeline.push(DumpChunk::new(next)) {
                Ok(()) => {
                    queued += 1;
                    MsgStatus::NoError
                }
                Err(e) => {
                    if matches!(e, PushError::Full(_)) {
                        refused += 1;
                        debug!(pending = self.pipeline.pending(), "dump queue full");
                    }
                    e.status()
                }
            };
            codec::send_response(conn, h.req_type, status)?;
            next = codec::recv_frame(conn, IoMode::NonBlocking)?;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use devlink::PipelineOptions;
    use devlink::proto::{ChunkPayload, RequestType};

    use super::*;
    use crate::test_support::serve_once;

    #[test]
    fn chunks_land_on_disk() {
        let out = tempfile::tempdir().unwrap();
        let mut opts = PipelineOptions::default();
        opts.base_dir = out.path().to_path_buf();
        let pipeline = Arc::new(ChunkPipeline::start(opts).unwrap());
        let dump = Dump::new(Arc::clone(&pipeline));

        let chunks = vec![
            ChunkPayload::new("host:/dump/core.0", 0, b"abcd".to_vec(), false),
            ChunkPayload::new("host:/dump/core.0", 4, b"efgh".to_vec(), true),
        ];
        let (sent, served) =
            serve_once(&dump, |client| {
                client.send_dump(RequestType::Dump, chunks.into_iter().map(Ok))
            });
        assert_eq!(sent.unwrap(), 2);
        served.unwrap();

        assert!(pipeline.shutdown());
        assert_eq!(pipeline.written(), 2);
        assert_eq!(
            std::fs::read(out.path().join("dump/core.0")).unwrap(),
            b"abcdefgh"
        );
    }
}
