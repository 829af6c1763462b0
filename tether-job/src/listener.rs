//! The job's Unix domain socket

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::net::UnixListener;
use tracing::{debug, error, info, warn};

use tether_utils::{ensure_private_dir, Result, TetherError};

use crate::conn::serve_connection;
use crate::manager::JobManager;

/// Removes the socket file when dropped
#[derive(Debug)]
struct SocketGuard {
    path: PathBuf,
}

impl Drop for SocketGuard {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "removed job socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "failed to remove job socket"),
        }
    }
}

/// Listening socket for main-server connections
#[derive(Debug)]
pub struct JobListener {
    listener: UnixListener,
    guard: SocketGuard,
}

impl JobListener {
    /// Bind `path`, owner-only
    ///
    /// The parent directory is created 0700 and a stale socket left by an
    /// earlier run is replaced. Must be called from within a tokio runtime.
    pub fn bind(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            ensure_private_dir(parent).map_err(|e| TetherError::FileWrite {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        match std::fs::remove_file(path) {
            Ok(()) => debug!(path = %path.display(), "removed stale job socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(TetherError::FileWrite {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        }

        let listener = UnixListener::bind(path).map_err(|e| {
            TetherError::connection(format!("Failed to bind {}: {}", path.display(), e))
        })?;
        let guard = SocketGuard {
            path: path.to_path_buf(),
        };
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).map_err(|e| {
            TetherError::FileWrite {
                path: path.to_path_buf(),
                source: e,
            }
        })?;

        info!(path = %path.display(), "job socket listening");
        Ok(Self { listener, guard })
    }

    pub fn path(&self) -> &Path {
        &self.guard.path
    }

    /// Accept connections until the manager shuts down
    pub async fn run(self, manager: Arc<JobManager>) {
        let mut shutdown_rx = manager.subscribe_shutdown();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, _addr)) => {
                            debug!("accepted job socket connection");
                            tokio::spawn(serve_connection(stream, Arc::clone(&manager)));
                        }
                        Err(e) => {
                            error!(error = %e, "job socket accept error");
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("shutdown received, closing job socket");
                    break;
                }
            }
        }
    }
}
