//! Unix socket listener.
//!
//! One task per accepted connection, bounded by a semaphore. Each peer is
//! authenticated from kernel credentials before any byte is read.

pub mod session;

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::net::UnixListener;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::dispatch::Dispatcher;
use crate::protocol::ProtocolError;

pub use session::{peer_credentials, Session};

/// Listening daemon socket.
pub struct Server {
    listener: UnixListener,
    path: PathBuf,
    dispatcher: Arc<Dispatcher>,
    limit: Arc<Semaphore>,
    max_frame: u32,
}

impl Server {
    /// Bind the socket, replacing a stale socket file if one exists.
    ///
    /// # Errors
    ///
    /// Fails if the path exists and is not a socket, or if binding or
    /// setting permissions fails.
    pub fn bind(config: &ServerConfig, dispatcher: Arc<Dispatcher>) -> Result<Self, ProtocolError> {
        let path = config.socket_path.clone();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        cleanup_socket(&path)?;

        let listener = UnixListener::bind(&path)?;
        set_socket_permissions(&path, config.socket_mode)?;
        info!(path = %path.display(), mode = %format!("{:o}", config.socket_mode), "listening");

        Ok(Self {
            listener,
            path,
            dispatcher,
            limit: Arc::new(Semaphore::new(config.max_connections.max(1))),
            max_frame: config.max_frame_bytes,
        })
    }

    /// Socket path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept connections until `shutdown_rx` turns true or closes.
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            let permit = tokio::select! {
                permit = Arc::clone(&self.limit).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                    continue;
                }
            };

            let stream = tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _addr)) => stream,
                    Err(err) => {
                        warn!(error = %err, "accept failed");
                        continue;
                    }
                },
                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                    continue;
                }
            };

            let dispatcher = Arc::clone(&self.dispatcher);
            let max_frame = self.max_frame;
            tokio::spawn(async move {
                let _permit = permit;
                let creds = match peer_credentials(&stream) {
                    Ok(creds) => creds,
                    Err(err) => {
                        warn!(error = %err, "rejecting unauthenticated peer");
                        return;
                    }
                };
                Session::new(stream, creds, dispatcher, max_frame).run().await;
            });
        }

        info!(path = %self.path.display(), "listener stopped");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            if err.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %err, "failed to remove socket");
            }
        }
    }
}

fn cleanup_socket(path: &Path) -> Result<(), ProtocolError> {
    use std::os::unix::fs::FileTypeExt;

    let metadata = match std::fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err.into()),
    };
    if !metadata.file_type().is_socket() {
        return Err(ProtocolError::Io(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("path {} exists but is not a socket", path.display()),
        )));
    }
    std::fs::remove_file(path)?;
    debug!(path = %path.display(), "removed stale socket");
    Ok(())
}

fn set_socket_permissions(path: &Path, mode: u32) -> Result<(), ProtocolError> {
    use std::os::unix::fs::PermissionsExt;

    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    Ok(())
}
