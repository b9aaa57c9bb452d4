//! File push and pull handlers rooted at the agent's storage directory.

use std::fs::{self, File, OpenOptions};
use std::path::{Component as PathPart, Path, PathBuf};

use devlink::proto::{ComponentType, Frame, MsgStatus, RequestType};
use devlink::{Component, Conn, Error, codec};
use tracing::{debug, info, warn};

/// Serves `SendFile`, `FileSync`, `Log`, and `FileGet`.
///
/// The opening frame carries the device-side path; it is always resolved
/// under `root` and never escapes it.
#[derive(Debug, Clone)]
pub(crate) struct FileTransfer {
    /// Storage root every request path is joined onto.
    root: PathBuf,
}

impl FileTransfer {
    /// Creates a handler storing files under `root`.
    pub(crate) fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Joins a request path onto the root, rejecting traversal.
    fn resolve(&self, raw: &[u8]) -> devlink::Result<PathBuf> {
        let text = std::str::from_utf8(raw)
            .map_err(|_| Error::InvalidPath(String::from_utf8_lossy(raw).into_owned()))?;
        let mut rel = PathBuf::new();
        for part in Path::new(text.trim_end_matches('\0')).components() {
            match part {
                PathPart::Normal(p) => rel.push(p),
                PathPart::RootDir | PathPart::CurDir => {}
                PathPart::ParentDir | PathPart::Prefix(_) => {
                    return Err(Error::InvalidPath(text.to_owned()));
                }
            }
        }
        if rel.as_os_str().is_empty() {
            return Err(Error::InvalidPath(text.to_owned()));
        }
        Ok(self.root.join(rel))
    }

    /// Host → device: acknowledge, then receive the slices.
    fn receive(&self, conn: &Conn, req: RequestType, path: &Path) -> devlink::Result<()> {
        let opened = path
            .parent()
            .map_or(Ok(()), fs::create_dir_all)
            .and_then(|()| {
                let mut opts = OpenOptions::new();
                opts.create(true);
                if req == RequestType::Log {
                    opts.append(true);
                } else {
                    opts.write(true).truncate(true);
                }
                opts.open(path)
            });
        let mut file = match opened {
            Ok(f) => f,
            Err(e) => return Err(reject(conn, req, e.into())),
        };
        codec::send_response(conn, req.code(), MsgStatus::NoError)?;
        let summary = codec::recv_file(conn, &mut file)?;
        if let Some(status) = summary.aborted
            && status != MsgStatus::DataEnd
        {
            warn!(path = %path.display(), ?status, "host aborted transfer");
        }
        file.sync_all()?;
        info!(path = %path.display(), bytes = summary.bytes, "file received");
        Ok(())
    }

    /// Device → host: acknowledge, then send the slices.
    fn send(&self, conn: &Conn, req: RequestType, path: &Path) -> devlink::Result<()> {
        let mut file = match File::open(path) {
            Ok(f) => f,
            Err(e) => {
                codec::send_response(conn, req.code(), MsgStatus::FileLoadError)?;
                return Err(e.into());
            }
        };
        codec::send_response(conn, req.code(), MsgStatus::NoError)?;
        let summary = codec::send_file(conn, req.code(), &mut file)?;
        info!(path = %path.display(), bytes = summary.bytes, "file sent");
        Ok(())
    }
}

/// Reports `err` to the host as a status and hands it back.
fn reject(conn: &Conn, req: RequestType, err: Error) -> Error {
    if let Err(e) = codec::send_response(conn, req.code(), err.status()) {
        debug!(error = %e, "failed to report rejection");
    }
    err
}

impl Component for FileTransfer {
    fn component_type(&self) -> ComponentType {
        ComponentType::FileTransfer
    }

    fn init(&self) -> devlink::Result<()> {
        fs::create_dir_all(&self.root)?;
        Ok(())
    }

    fn process(&self, conn: &mut Conn, frame: &Frame) -> devlink::Result<()> {
        let Some(req) = RequestType::from_code(frame.header.req_type) else {
            return Err(Error::Rejected(MsgStatus::PermissionDenied));
        };
        let path = match self.resolve(&frame.payload) {
            Ok(p) => p,
            Err(e) => return Err(reject(conn, req, e)),
        };
        debug!(device = conn.device(), ?req, path = %path.display(), "file request");
        match req {
            RequestType::FileGet => self.send(conn, req, &path),
            _ => self.receive(conn, req, &path),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::test_support::serve_once;

    #[test]
    fn resolve_stays_under_root() {
        let files = FileTransfer::new("/srv/devlink");
        assert_eq!(
            files.resolve(b"/var/log/boot.log").unwrap(),
            PathBuf::from("/srv/devlink/var/log/boot.log")
        );
        assert_eq!(
            files.resolve(b"./a/b\0").unwrap(),
            PathBuf::from("/srv/devlink/a/b")
        );
        assert!(files.resolve(b"../etc/passwd").is_err());
        assert!(files.resolve(b"a/../../b").is_err());
        assert!(files.resolve(b"/").is_err());
        assert!(files.resolve(&[0xff, 0xfe]).is_err());
    }

    #[test]
    fn push_then_pull() {
        let root = tempfile::tempdir().unwrap();
        let host = tempfile::tempdir().unwrap();
        let files = FileTransfer::new(root.path());
        files.init().unwrap();

        let local = host.path().join("model.bin");
        let data: Vec<u8> = (0..700_000u32).map(|i| (i % 251) as u8).collect();
        fs::write(&local, &data).unwrap();

        let (pushed, served) = serve_once(&files, |client| {
            client
                .push_file(&local, "models/model.bin", RequestType::SendFile)
                .unwrap()
        });
        served.unwrap();
        assert_eq!(pushed.slices, 2);
        assert_eq!(fs::read(root.path().join("models/model.bin")).unwrap(), data);

        let back = host.path().join("back.bin");
        let (pulled, served) = serve_once(&files, |client| {
            client.pull_file("models/model.bin", &back).unwrap()
        });
        served.unwrap();
        assert_eq!(pulled.bytes, data.len() as u64);
        assert_eq!(fs::read(&back).unwrap(), data);
    }

    #[test]
    fn log_pushes_append() {
        let root = tempfile::tempdir().unwrap();
        let host = tempfile::tempdir().unwrap();
        let files = FileTransfer::new(root.path());
        let local = host.path().join("run.log");
        fs::write(&local, b"line\n").unwrap();

        for _ in 0..2 {
            let (_, served) = serve_once(&files, |client| {
                client.push_file(&local, "logs/run.log", RequestType::Log).unwrap()
            });
            served.unwrap();
        }
        assert_eq!(
            fs::read(root.path().join("logs/run.log")).unwrap(),
            b"line\nline\n"
        );
    }

    #[test]
    fn missing_file_is_a_load_error() {
        let root = tempfile::tempdir().unwrap();
        let host = tempfile::tempdir().unwrap();
        let files = FileTransfer::new(root.path());
        let dest = host.path().join("never");

        let (pulled, served) = serve_once(&files, |client| client.pull_file("nope.bin", &dest));
        assert!(matches!(
            pulled,
            Err(Error::Rejected(MsgStatus::FileLoadError))
        ));
        assert!(served.is_err());
        assert!(!dest.exists());
    }

    #[test]
    fn traversal_is_rejected_on_the_wire() {
        let root = tempfile::tempdir().unwrap();
        let host = tempfile::tempdir().unwrap();
        let files = FileTransfer::new(root.path());
        let local = host.path().join("x");
        fs::write(&local, b"x").unwrap();

        let (pushed, served) = serve_once(&files, |client| {
            client.push_file(&local, "../escape", RequestType::SendFile)
        });
        assert!(matches!(
            pushed,
            Err(Error::Rejected(MsgStatus::PermissionDenied))
        ));
        assert!(matches!(served, Err(Error::InvalidPath(_))));
    }
}
