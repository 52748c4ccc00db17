//! Unix socket listener and accept loop

use crate::connection::{handle_new_conn, ConnectionConfig};
use crate::router::Router;
use crate::shutdown::Shutdown;
use crate::{Result, TetherError};
use std::io::ErrorKind;
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UnixListener;
use tracing::{debug, error, info, warn};

/// Socket file permissions: owner only
pub const SOCKET_MODE: u32 = 0o700;

/// Pause after a recoverable accept failure
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Bind a Unix socket at `path`.
///
/// The parent directory is created when missing and a stale socket left by
/// an earlier run is replaced. Any other file at `path` is left alone and
/// reported as an error.
pub fn bind_unix_listener(path: &Path) -> Result<UnixListener> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| {
                TetherError::Listener(format!("cannot create {}: {}", parent.display(), e))
            })?;
        }
    }

    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => {
            debug!("Removing stale socket {}", path.display());
            std::fs::remove_file(path).map_err(|e| {
                TetherError::Listener(format!("cannot remove stale socket {}: {}", path.display(), e))
            })?;
        }
        Ok(_) => {
            return Err(TetherError::Listener(format!(
                "{} exists and is not a socket",
                path.display()
            )));
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => {
            return Err(TetherError::Listener(format!("cannot inspect {}: {}", path.display(), e)));
        }
    }

    let listener = UnixListener::bind(path)
        .map_err(|e| TetherError::Listener(format!("cannot bind {}: {}", path.display(), e)))?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(SOCKET_MODE))
        .map_err(|e| TetherError::Listener(format!("cannot set permissions on {}: {}", path.display(), e)))?;

    info!("Listening on {}", path.display());
    Ok(listener)
}

/// Accept errors after which the listening socket itself is unusable
fn is_fatal_accept_error(err: &std::io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EBADF) | Some(libc::EINVAL) | Some(libc::ENOTSOCK) | Some(libc::EOPNOTSUPP)
    )
}

/// Accept connections until `shutdown` fires or the listener fails.
///
/// Each connection is served on its own task. Accept failures are logged
/// and retried unless the listening socket itself is unusable, which ends
/// the loop with [`TetherError::Listener`].
pub async fn run_listener(
    listener: UnixListener,
    router: Arc<Router>,
    config: ConnectionConfig,
    shutdown: Shutdown,
) -> Result<()> {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("Accept loop stopping for shutdown");
                return Ok(());
            }
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, _addr)) => {
                debug!("Accepted connection");
                let router = router.clone();
                let config = config.clone();
                tokio::spawn(async move {
                    handle_new_conn(stream, router, config).await;
                });
            }
            Err(e) if is_fatal_accept_error(&e) => {
                error!("Listener closed: {}", e);
                return Err(TetherError::Listener(e.to_string()));
            }
            Err(e) => {
                warn!("Accept failed, retrying: {}", e);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}
