//! Client side of the control socket, used by `status`, `disconnect` and
//! `connect`.

use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use terterchat_core::protocol::{ConnectionState, ControlCommand};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::daemon::paths;

/// Maximum time to wait for daemon to start up.
const DAEMON_STARTUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum time to wait for the daemon to reach the server. Covers the
/// channel's own connect timeout.
const HANDSHAKE_WAIT_TIMEOUT: Duration = Duration::from_secs(15);

/// Interval between socket connection attempts.
const RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// How long to wait for a reply, or for the daemon to hang up.
const REPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// Replies are a single short line.
const MAX_REPLY_SIZE: u64 = 1024;

/// Talks to a daemon over its control socket.
pub struct ControlClient {
    socket_path: PathBuf,
}

impl Default for ControlClient {
    fn default() -> Self {
        Self::new(paths::get_socket_path())
    }
}

impl ControlClient {
    pub fn new(socket_path: PathBuf) -> Self {
        Self { socket_path }
    }

    /// Whether a daemon is accepting connections on the socket.
    pub async fn is_running(&self) -> bool {
        UnixStream::connect(&self.socket_path).await.is_ok()
    }

    /// Ask the daemon for its connection state. No daemon means
    /// [`ConnectionState::Disconnected`].
    pub async fn status(&self) -> Result<ConnectionState> {
        let Some(reply) = self.send(ControlCommand::Status).await? else {
            debug!("No daemon listening on {:?}", self.socket_path);
            return Ok(ConnectionState::Disconnected);
        };

        match reply.trim() {
            "connected" => Ok(ConnectionState::Connected),
            "disconnected" => Ok(ConnectionState::Disconnected),
            other => bail!("Unexpected status reply from daemon: {:?}", other),
        }
    }

    /// Ask the daemon to shut down and wait until it hangs up.
    ///
    /// Returns `false` if no daemon was running.
    pub async fn disconnect(&self) -> Result<bool> {
        Ok(self.send(ControlCommand::Disconnect).await?.is_some())
    }

    /// Send one command and read until the daemon closes the connection.
    ///
    /// Returns `None` when nothing is listening on the socket.
    async fn send(&self, command: ControlCommand) -> Result<Option<String>> {
        let mut stream = match UnixStream::connect(&self.socket_path).await {
            Ok(stream) => stream,
            Err(e) if is_not_listening(&e) => return Ok(None),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to connect to {:?}", self.socket_path));
            }
        };

        debug!("Sending: {}", command);
        stream
            .write_all(command.to_line().as_bytes())
            .await
            .context("Failed to write command")?;
        stream.flush().await.context("Failed to flush")?;

        let mut reply = Vec::new();
        timeout(
            REPLY_TIMEOUT,
            (&mut stream).take(MAX_REPLY_SIZE).read_to_end(&mut reply),
        )
        .await
        .context("Timed out waiting for daemon")?
        .context("Failed to read reply")?;

        let reply = String::from_utf8(reply).context("Invalid UTF-8 in reply")?;
        debug!("Received: {:?}", reply);
        Ok(Some(reply))
    }

    /// Start a detached daemon for `phone` unless one is already running,
    /// then wait until it reports a live server connection.
    ///
    /// `daemon_args` are passed after `daemon <PHONE>`.
    pub async fn start_daemon(&self, phone: &str, daemon_args: &[OsString]) -> Result<()> {
        if self.is_running().await {
            info!("Daemon already running");
            return Ok(());
        }

        info!("Starting daemon");
        let mut child = spawn_daemon(phone, daemon_args)?;
        self.wait_for_daemon(&mut child).await
    }

    /// Wait for the daemon to come up and finish its handshake.
    ///
    /// The control socket appears before the server connection is made, so
    /// the socket alone proves nothing. Polls `status` until `connected`,
    /// failing fast with the exit status if the daemon process dies first.
    async fn wait_for_daemon(&self, child: &mut std::process::Child) -> Result<()> {
        let start = std::time::Instant::now();
        let mut socket_seen = false;

        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    bail!(
                        "Daemon exited with status: {} (run 'terterchat daemon' directly to diagnose)",
                        status
                    );
                }
                Ok(None) => {}
                Err(e) => debug!("Error checking daemon status: {}", e),
            }

            if self.is_running().await {
                if !socket_seen {
                    debug!("Control socket up after {:?}", start.elapsed());
                    socket_seen = true;
                }
                match self.status().await {
                    Ok(ConnectionState::Connected) => {
                        info!("Daemon connected after {:?}", start.elapsed());
                        return Ok(());
                    }
                    Ok(_) => {}
                    Err(e) => debug!("Status query failed: {:#}", e),
                }
            }

            if !socket_seen && start.elapsed() > DAEMON_STARTUP_TIMEOUT {
                bail!("Daemon failed to start within {:?}", DAEMON_STARTUP_TIMEOUT);
            }
            if start.elapsed() > HANDSHAKE_WAIT_TIMEOUT {
                bail!(
                    "Daemon is running but not connected after {:?}; check 'terterchat status'",
                    HANDSHAKE_WAIT_TIMEOUT
                );
            }
            tokio::time::sleep(RETRY_INTERVAL).await;
        }
    }
}

fn is_not_listening(e: &std::io::Error) -> bool {
    matches!(e.kind(), ErrorKind::NotFound | ErrorKind::ConnectionRefused)
}

/// Spawn `terterchat daemon <PHONE> ...` as a detached background process.
fn spawn_daemon(phone: &str, daemon_args: &[OsString]) -> Result<std::process::Child> {
    use std::os::unix::process::CommandExt;

    let exe = std::env::current_exe().context("Failed to get current executable path")?;

    // process_group(0) keeps the daemon out of the terminal's process group,
    // so closing the terminal does not deliver SIGHUP to it.
    std::process::Command::new(exe)
        .arg("daemon")
        .arg(phone)
        .args(daemon_args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .process_group(0)
        .spawn()
        .context("Failed to spawn daemon process")
}
