//! Liveness / version check.

use devlink::proto::{ComponentType, Frame, MsgStatus};
use devlink::{Component, Conn, codec};
use tracing::debug;

/// Answers every detect request with the agent version.
#[derive(Debug, Clone)]
pub(crate) struct Detect {
    /// Version string sent back as the payload.
    version: String,
}

impl Detect {
    /// Creates a handler reporting `version`.
    pub(crate) fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
        }
    }
}

impl Component for Detect {
    fn component_type(&self) -> ComponentType {
        ComponentType::Detect
    }

    fn process(&self, conn: &mut Conn, frame: &Frame) -> devlink::Result<()> {
        debug!(device = conn.device(), "detect");
        codec::send_buffer(
            conn,
            frame.header.req_type,
            MsgStatus::NoError,
            self.version.as_bytes(),
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::test_support::serve_once;

    #[test]
    fn replies_with_version() {
        let detect = Detect::new("0.3.0");
        let (version, served) = serve_once(&detect, |client| client.detect().unwrap());
        assert_eq!(version, "0.3.0");
        served.unwrap();
    }
}
