//! Shared IPC layer for the voice assistant process trio.
//!
//! Three processes cooperate over UNIX stream sockets under `/tmp/lva-ipc/`:
//! the satellite core, the vision daemon, and the front panel daemon. All
//! messages are newline-delimited JSON envelopes; legacy `{"cmd": ...}` and
//! `{"event": ...}` shapes are accepted on ingress and normalized so that no
//! downstream component ever sees them.

mod codec;
mod envelope;

use std::path::{Path, PathBuf};

use thiserror::Error;

pub use codec::{read_envelope, spawn_writer, write_envelope};
pub use envelope::{msg, Envelope, Source};

/// Directory holding every socket of the local bus.
pub const IPC_DIR: &str = "/tmp/lva-ipc";

/// Frames larger than this are dropped, not parsed.
pub const MAX_FRAME_BYTES: usize = 64 * 1024;

/// Core inbound socket: commands and events from the daemons and external
/// controllers.
pub fn control_socket_path() -> PathBuf {
    Path::new(IPC_DIR).join("control.sock")
}

/// Core outbound socket: state and LED events, bound by the front panel
/// daemon.
pub fn gpio_event_socket_path() -> PathBuf {
    Path::new(IPC_DIR).join("gpio-events.sock")
}

/// Vision daemon request/reply socket.
pub fn visd_socket_path() -> PathBuf {
    Path::new(IPC_DIR).join("visd.sock")
}

/// Errors produced by the envelope layer.
#[derive(Debug, Error)]
pub enum IpcError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),

    /// Frame exceeded [`MAX_FRAME_BYTES`]; the caller should count and
    /// continue reading.
    #[error("oversize frame ({len} bytes)")]
    OversizeFrame { len: usize },

    #[error("envelope is not a JSON object")]
    NotAnObject,
}

/// Removes a socket file this process bound. Dropping the guard (or calling
/// [`SocketGuard::cleanup`]) unlinks the file exactly once; sockets bound by
/// other processes are never touched.
pub struct SocketGuard {
    path: PathBuf,
    removed: bool,
}

impl SocketGuard {
    /// Create the IPC directory, remove a stale socket file, bind, and open
    /// permissions so sibling daemons running as other users can connect.
    /// Returns the listener together with the cleanup guard for its path.
    pub fn bind(path: &Path) -> std::io::Result<(tokio::net::UnixListener, Self)> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let _ = std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o777));
            }
        }

        if path.exists() {
            std::fs::remove_file(path)?;
        }

        let listener = tokio::net::UnixListener::bind(path)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o666))?;
        }

        tracing::info!(?path, "IPC socket bound");

        let guard = Self {
            path: path.to_owned(),
            removed: false,
        };
        Ok((listener, guard))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the socket file. Idempotent; `Drop` calls it as well.
    pub fn cleanup(&mut self) {
        if self.removed {
            return;
        }
        self.removed = true;
        if self.path.exists() {
            if let Err(err) = std::fs::remove_file(&self.path) {
                tracing::warn!(path = ?self.path, ?err, "failed to remove socket file");
            }
        }
    }
}

impl Drop for SocketGuard {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn socket_guard_removes_only_its_own_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.sock");

        let (listener, mut guard) = SocketGuard::bind(&path).unwrap();
        assert!(path.exists());
        drop(listener);

        guard.cleanup();
        assert!(!path.exists());

        // Idempotent, and does not touch a file re-created by someone else.
        std::fs::write(&path, b"foreign").unwrap();
        guard.cleanup();
        assert!(path.exists());
    }

    #[tokio::test]
    async fn bind_replaces_stale_socket_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stale.sock");
        std::fs::write(&path, b"stale").unwrap();

        let (_listener, guard) = SocketGuard::bind(&path).unwrap();
        assert!(path.exists());
        drop(guard);
        assert!(!path.exists());
    }
}
