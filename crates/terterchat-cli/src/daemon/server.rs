//! Unix socket control plane for the daemon process.
//!
//! Each connection carries exactly one newline-terminated command:
//!
//! | Command | Reply |
//! |---------|-------|
//! | `status` | `connected` or `disconnected` |
//! | `disconnect` | none, the connection is closed once shutdown is triggered |
//!
//! Anything else is ignored and the connection closed.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use terterchat_core::protocol::ControlCommand;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::daemon::paths;
use crate::daemon::shutdown::{Shutdown, ShutdownReason};
use crate::daemon::state::SharedConnectionState;

/// Maximum number of concurrent control connections.
const MAX_CONNECTIONS: usize = 64;

/// How long a client gets to send its command.
const COMMAND_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Commands are single words; anything longer is garbage.
const MAX_COMMAND_SIZE: usize = 1024;

/// How long to wait for in-flight connections to complete during shutdown.
const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// The socket file on disk. Removed when dropped.
#[derive(Debug)]
pub struct SocketFile {
    path: PathBuf,
}

impl SocketFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the socket file now.
    pub fn remove(self) {
        drop(self)
    }
}

impl Drop for SocketFile {
    fn drop(&mut self) {
        if !self.path.exists() {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("Removed control socket {:?}", self.path),
            Err(e) => warn!("Failed to remove control socket {:?}: {}", self.path, e),
        }
    }
}

/// Listener for short-lived CLI connections.
pub struct ControlServer {
    listener: UnixListener,
    socket: SocketFile,
    state: SharedConnectionState,
    shutdown: Shutdown,
    /// Limits concurrent connections to prevent resource exhaustion.
    connection_semaphore: Arc<Semaphore>,
}

impl ControlServer {
    /// Bind to a specific socket path.
    ///
    /// Tries to bind first. If the path is taken, connects to it: a socket
    /// that still accepts connections belongs to a live daemon and is left alone;
    /// otherwise it is a leftover from an unclean exit and is replaced.
    pub async fn bind_to(
        socket_path: PathBuf,
        state: SharedConnectionState,
        shutdown: Shutdown,
    ) -> Result<Self> {
        paths::ensure_socket_dir(&socket_path).with_context(|| {
            format!("Failed to create socket directory for {:?}", socket_path)
        })?;

        let listener = match UnixListener::bind(&socket_path) {
            Ok(l) => l,
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                if UnixStream::connect(&socket_path).await.is_ok() {
                    anyhow::bail!(
                        "Daemon already running (socket {:?} accepts connections)",
                        socket_path
                    );
                }

                remove_stale_socket(&socket_path)?;
                UnixListener::bind(&socket_path)
                    .with_context(|| format!("Failed to bind to socket: {:?}", socket_path))?
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to bind to socket: {:?}", socket_path));
            }
        };
        let socket = SocketFile { path: socket_path };

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(socket.path(), std::fs::Permissions::from_mode(0o600))
                .with_context(|| format!("Failed to restrict socket {:?}", socket.path()))?;
        }

        info!("Control socket listening on {:?}", socket.path());

        Ok(Self {
            listener,
            socket,
            state,
            shutdown,
            connection_semaphore: Arc::new(Semaphore::new(MAX_CONNECTIONS)),
        })
    }

    pub fn socket_path(&self) -> &Path {
        self.socket.path()
    }

    /// Accept control connections until shutdown.
    ///
    /// The listener is closed when this returns; the socket file is handed
    /// back so the caller decides when it disappears.
    pub async fn run(self) -> SocketFile {
        let Self {
            listener,
            socket,
            state,
            shutdown,
            connection_semaphore,
        } = self;
        let mut connection_tasks: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.wait() => {
                    debug!("Control listener stopping");
                    break;
                }
                result = listener.accept() => {
                    match result {
                        Ok((stream, _addr)) => {
                            let permit = match connection_semaphore.clone().try_acquire_owned() {
                                Ok(permit) => permit,
                                Err(_) => {
                                    warn!(
                                        "Connection limit ({}) reached, rejecting new connection",
                                        MAX_CONNECTIONS
                                    );
                                    drop(stream);
                                    continue;
                                }
                            };

                            let state = state.clone();
                            let shutdown = shutdown.clone();
                            connection_tasks.spawn(async move {
                                let _permit = permit;
                                if let Err(e) = handle_connection(stream, state, shutdown).await {
                                    warn!("Control connection error: {:#}", e);
                                }
                            });
                        }
                        Err(e) if shutdown.is_triggered() => {
                            debug!("Accept failed during shutdown: {}", e);
                            break;
                        }
                        Err(e) => {
                            error!("Unexpected error accepting control connections: {}", e);
                            shutdown.trigger(ShutdownReason::ListenerFailed(e.to_string()));
                            break;
                        }
                    }
                }
                // Reap completed connection tasks to prevent unbounded growth
                Some(_) = connection_tasks.join_next(), if !connection_tasks.is_empty() => {}
            }
        }

        drop(listener);

        if !connection_tasks.is_empty() {
            let drained = timeout(GRACEFUL_SHUTDOWN_TIMEOUT, async {
                while connection_tasks.join_next().await.is_some() {}
            })
            .await;

            if drained.is_err() {
                warn!(
                    "Aborting {} control connection(s) still open after {:?}",
                    connection_tasks.len(),
                    GRACEFUL_SHUTDOWN_TIMEOUT
                );
                connection_tasks.abort_all();
            }
        }

        socket
    }
}

/// Remove a leftover socket file, refusing anything that is not a socket.
fn remove_stale_socket(socket_path: &Path) -> Result<()> {
    // Don't follow symlinks (could delete unintended files)
    let metadata = std::fs::symlink_metadata(socket_path)
        .with_context(|| format!("Failed to stat socket path: {:?}", socket_path))?;

    if metadata.file_type().is_symlink() {
        anyhow::bail!(
            "Socket path {:?} is a symlink, refusing to delete for safety",
            socket_path
        );
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::FileTypeExt;
        if !metadata.file_type().is_socket() {
            anyhow::bail!(
                "Path {:?} exists but is not a socket file (type: {:?})",
                socket_path,
                metadata.file_type()
            );
        }
    }

    info!("Removing stale control socket from a previous run");
    std::fs::remove_file(socket_path)
        .with_context(|| format!("Failed to remove stale socket: {:?}", socket_path))
}

/// Read a line with a maximum size limit to prevent memory DoS.
///
/// Returns the number of bytes read (0 means EOF).
/// Returns an error if the line exceeds max_size before finding a newline.
async fn read_line_bounded<R: tokio::io::AsyncBufRead + Unpin>(
    reader: &mut R,
    buf: &mut String,
    max_size: usize,
) -> Result<usize> {
    use tokio::io::AsyncBufReadExt;

    let mut total = 0;
    let mut bytes = Vec::new();

    loop {
        let available = reader
            .fill_buf()
            .await
            .context("Failed to read from client")?;

        if available.is_empty() {
            break;
        }

        let newline_pos = available.iter().position(|&b| b == b'\n');
        let bytes_to_consume = newline_pos.map(|p| p + 1).unwrap_or(available.len());

        if total + bytes_to_consume > max_size {
            anyhow::bail!("Command too large: exceeded {} byte limit", max_size);
        }

        bytes.extend_from_slice(&available[..bytes_to_consume]);
        total += bytes_to_consume;
        reader.consume(bytes_to_consume);

        if newline_pos.is_some() {
            break;
        }
    }

    let line = std::str::from_utf8(&bytes).context("Invalid UTF-8 in command")?;
    buf.push_str(line);
    Ok(total)
}

/// Handle a single control connection: one command, at most one reply.
async fn handle_connection(
    stream: UnixStream,
    state: SharedConnectionState,
    shutdown: Shutdown,
) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    let bytes_read = timeout(
        COMMAND_READ_TIMEOUT,
        read_line_bounded(&mut reader, &mut line, MAX_COMMAND_SIZE),
    )
    .await
    .context("Timed out waiting for command")??;

    if bytes_read == 0 {
        debug!("Client disconnected without sending a command");
        return Ok(());
    }

    match line.parse::<ControlCommand>() {
        Ok(ControlCommand::Status) => {
            let reply = state.get().status_line();
            debug!("Status query: {}", reply.trim_end());
            writer
                .write_all(reply.as_bytes())
                .await
                .context("Failed to write status")?;
            writer.flush().await.context("Failed to flush")?;
        }
        Ok(ControlCommand::Disconnect) => {
            info!("Disconnect requested over control socket");
            shutdown.trigger(ShutdownReason::DisconnectCommand);
        }
        Err(e) => debug!("Ignoring control connection: {}", e),
    }

    Ok(())
}
