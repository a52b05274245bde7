//! One-shot shutdown coordination.
//!
//! Every loop in the daemon watches the same [`Shutdown`] handle. Any of them
//! (or the OS signal watcher) may call [`Shutdown::trigger`]; only the first
//! call has an effect, later ones are logged and ignored.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// What caused the daemon to shut down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// SIGINT or SIGTERM.
    Signal(&'static str),
    /// `disconnect` received on the control socket.
    DisconnectCommand,
    /// The secure channel hit a fatal error or the server went away.
    ChannelClosed(String),
    /// The control listener failed while the daemon was running.
    ListenerFailed(String),
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::Signal(name) => write!(f, "received {}", name),
            ShutdownReason::DisconnectCommand => write!(f, "disconnect requested"),
            ShutdownReason::ChannelClosed(cause) => write!(f, "connection closed: {}", cause),
            ShutdownReason::ListenerFailed(cause) => write!(f, "control listener failed: {}", cause),
        }
    }
}

/// Lifecycle phase of the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Phase {
    Running = 0,
    ShuttingDown = 1,
    Stopped = 2,
}

impl Phase {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Phase::Running,
            1 => Phase::ShuttingDown,
            _ => Phase::Stopped,
        }
    }
}

struct Inner {
    token: CancellationToken,
    reason: OnceLock<ShutdownReason>,
    phase: AtomicU8,
}

/// Cloneable shutdown handle shared by every daemon task.
#[derive(Clone)]
pub struct Shutdown {
    inner: Arc<Inner>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Shutdown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shutdown")
            .field("phase", &self.phase())
            .field("reason", &self.reason())
            .finish()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                token: CancellationToken::new(),
                reason: OnceLock::new(),
                phase: AtomicU8::new(Phase::Running as u8),
            }),
        }
    }

    /// Request shutdown.
    ///
    /// Returns `true` for the call that actually started the shutdown and
    /// `false` for every later call, whichever task makes it.
    pub fn trigger(&self, reason: ShutdownReason) -> bool {
        match self.inner.reason.set(reason) {
            Ok(()) => {
                self.inner
                    .phase
                    .store(Phase::ShuttingDown as u8, Ordering::Release);
                if let Some(reason) = self.inner.reason.get() {
                    info!("Shutting down: {}", reason);
                }
                self.inner.token.cancel();
                true
            }
            Err(reason) => {
                debug!("Shutdown already in progress, ignoring: {}", reason);
                false
            }
        }
    }

    /// Wait until shutdown has been triggered. Returns immediately if it
    /// already was.
    pub async fn wait(&self) {
        self.inner.token.cancelled().await
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// The reason passed to the first successful [`trigger`](Self::trigger).
    pub fn reason(&self) -> Option<&ShutdownReason> {
        self.inner.reason.get()
    }

    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.inner.phase.load(Ordering::Acquire))
    }

    /// Record that every task has returned.
    ///
    /// Only valid after a trigger; returns `true` on the single transition
    /// from `ShuttingDown` to `Stopped`.
    pub fn mark_stopped(&self) -> bool {
        self.inner
            .phase
            .compare_exchange(
                Phase::ShuttingDown as u8,
                Phase::Stopped as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

/// Trip `shutdown` on SIGINT or SIGTERM. Returns once shutdown has been
/// triggered by anyone.
pub async fn watch_signals(shutdown: Shutdown) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            match result {
                Ok(()) => {
                    shutdown.trigger(ShutdownReason::Signal("SIGINT"));
                }
                Err(e) => {
                    tracing::warn!("Failed to listen for SIGINT: {}", e);
                    shutdown.wait().await;
                }
            }
        }
        _ = sigterm() => {
            shutdown.trigger(ShutdownReason::Signal("SIGTERM"));
        }
        _ = shutdown.wait() => {}
    }
    debug!("Signal watcher stopped");
}

/// Wait for SIGTERM signal (Unix only).
///
/// If signal registration fails, logs a warning and waits indefinitely.
#[cfg(unix)]
async fn sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            tracing::warn!(
                "Failed to register SIGTERM handler: {}, daemon will only respond to SIGINT",
                e
            );
            std::future::pending::<()>().await;
        }
    }
}

/// SIGTERM is not available on non-Unix platforms; use a never-completing future.
#[cfg(not(unix))]
async fn sigterm() {
    std::future::pending::<()>().await;
}
