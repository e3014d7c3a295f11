//! Filesystem-backed request handlers.

use std::io;
use std::path::PathBuf;

use async_trait::async_trait;
use tftp::{ReadHandler, ReadRequest, WriteHandler, WriteRequest};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tracing::debug;

/// Serves files from, and optionally stores uploads into, a root directory.
///
/// Requested names are resolved against the root and rejected when they
/// escape it, so `../` tricks surface as access violations on the wire.
#[derive(Debug, Clone)]
pub struct FileServer {
    root: PathBuf,
}

impl FileServer {
    /// `root` should already be canonicalized.
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn resolve(&self, name: &str) -> io::Result<PathBuf> {
        let resolved = self.root.join(name).canonicalize()?;
        if !resolved.starts_with(&self.root) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "path escapes the served root",
            ));
        }
        Ok(resolved)
    }

    /// Resolve a write target: the parent directory must exist inside the
    /// root, the file itself need not.
    fn resolve_target(&self, name: &str) -> io::Result<PathBuf> {
        let requested = self.root.join(name);
        let file_name = requested
            .file_name()
            .ok_or_else(|| io::Error::new(io::ErrorKind::PermissionDenied, "invalid file name"))?
            .to_owned();
        let parent = requested
            .parent()
            .unwrap_or(&self.root)
            .canonicalize()?;
        if !parent.starts_with(&self.root) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "path escapes the served root",
            ));
        }
        Ok(parent.join(file_name))
    }
}

#[async_trait]
impl ReadHandler for FileServer {
    async fn serve(&self, request: &mut ReadRequest) -> tftp::Result<()> {
        let path = self.resolve(request.name())?;
        debug!(peer = %request.remote_addr(), path = %path.display(), "serving file");
        let file = fs::File::open(&path).await?;
        request.set_size(file.metadata().await?.len());
        let mut reader = BufReader::new(file);
        let mut buf = vec![0u8; 32 * 1024];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            request.write_all(&buf[..n]).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl WriteHandler for FileServer {
    async fn receive(&self, request: &mut WriteRequest) -> tftp::Result<()> {
        let path = self.resolve_target(request.name())?;
        debug!(peer = %request.remote_addr(), path = %path.display(), "storing file");
        let mut file = fs::File::create(&path).await?;
        let mut buf = vec![0u8; 32 * 1024];
        loop {
            let n = request.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n]).await?;
        }
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn file_server(root: &std::path::Path) -> FileServer {
        FileServer::new(root.canonicalize().unwrap())
    }

    #[test]
    fn resolves_files_inside_the_root() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("boot.img"), b"image").unwrap();
        let server = file_server(dir.path());

        let resolved = server.resolve("boot.img").unwrap();
        assert!(resolved.ends_with("boot.img"));
        assert!(server.resolve("missing.img").is_err());
    }

    #[test]
    fn rejects_path_traversal() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let server = file_server(&dir.path().join("sub"));

        std::fs::write(dir.path().join("secret"), b"keep out").unwrap();
        assert!(server.resolve("../secret").is_err());
        assert!(server.resolve_target("../clobber").is_err());
    }

    #[test]
    fn resolve_target_allows_new_files() {
        let dir = tempdir().unwrap();
        let server = file_server(dir.path());

        let target = server.resolve_target("upload.bin").unwrap();
        assert!(target.ends_with("upload.bin"));
        assert!(!target.exists());
    }
}
