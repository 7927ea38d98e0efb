use std::{io, os::unix::fs::FileTypeExt as _, path::Path};

use tracing::trace;

/// Ensures that the given path is ready for use as a Unix domain socket.
///
/// If the path already exists, and is a Unix domain socket, it will be removed. If it is not a Unix domain socket, an
/// error will be returned.
pub(super) async fn ensure_unix_socket_free<P: AsRef<Path>>(path: P) -> io::Result<()> {
    let path = path.as_ref();

    // A stale socket left behind by a previous process would otherwise make the bind fail.
    match tokio::fs::metadata(path).await {
        Ok(metadata) => {
            if !metadata.file_type().is_socket() {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    "path already exists and is not a Unix domain socket",
                ));
            }

            tokio::fs::remove_file(path).await?;

            trace!(
                socket_path = path.to_string_lossy().as_ref(),
                "Cleared existing Unix domain socket."
            );
        }
        Err(err) => {
            if err.kind() != io::ErrorKind::NotFound {
                return Err(err);
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_path_is_free() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.sock");
        ensure_unix_socket_free(&path).await.unwrap();
    }

    #[tokio::test]
    async fn regular_file_is_not_removed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not-a-socket");
        std::fs::write(&path, b"data").unwrap();

        let err = ensure_unix_socket_free(&path).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        assert!(path.exists());
    }

    #[tokio::test]
    async fn stale_socket_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stale.sock");
        let listener = std::os::unix::net::UnixListener::bind(&path).unwrap();
        drop(listener);

        ensure_unix_socket_free(&path).await.unwrap();
        assert!(!path.exists());
    }
}
