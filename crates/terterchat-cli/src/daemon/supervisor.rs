//! Daemon lifecycle: start every loop, wait for all of them, clean up.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use terterchat_core::protocol::ConnectionState;
use tokio::task::JoinSet;
use tracing::{error, info};

use crate::daemon::channel::{ChannelConfig, SecureChannel};
use crate::daemon::dispatch::Dispatcher;
use crate::daemon::notify::Notifier;
use crate::daemon::server::{ControlServer, SocketFile};
use crate::daemon::shutdown::{watch_signals, Shutdown, ShutdownReason};
use crate::daemon::state::SharedConnectionState;

/// What each supervised task hands back when it finishes.
enum TaskExit {
    Signals,
    Control(SocketFile),
    Channel(Result<()>),
}

/// A configured daemon, ready to run.
pub struct Daemon {
    config: ChannelConfig,
    notifier: Arc<dyn Notifier>,
    socket_path: PathBuf,
}

impl Daemon {
    pub fn new(config: ChannelConfig, notifier: Arc<dyn Notifier>, socket_path: PathBuf) -> Self {
        Self {
            config,
            notifier,
            socket_path,
        }
    }

    /// Run until shutdown.
    ///
    /// Fails if the control socket cannot be bound or the server connection
    /// cannot be established. Everything after the handshake ends in `Ok`.
    pub async fn run(self, phone: String) -> Result<()> {
        let state = SharedConnectionState::new();
        let shutdown = Shutdown::new();
        let channel = SecureChannel::new(
            self.config,
            state.clone(),
            Dispatcher::new(self.notifier),
            shutdown.clone(),
        );

        supervise(self.socket_path, state, shutdown, async move {
            channel.run(&phone).await
        })
        .await
    }
}

/// Bind the control socket, run the signal watcher, the accept loop and
/// `channel` side by side, then clean up once all three have returned.
async fn supervise<C>(
    socket_path: PathBuf,
    state: SharedConnectionState,
    shutdown: Shutdown,
    channel: C,
) -> Result<()>
where
    C: Future<Output = Result<()>> + Send + 'static,
{
    let server = ControlServer::bind_to(socket_path, state.clone(), shutdown.clone()).await?;
    info!("Daemon started, control socket at {:?}", server.socket_path());

    let mut tasks: JoinSet<TaskExit> = JoinSet::new();

    let signal_shutdown = shutdown.clone();
    tasks.spawn(async move {
        watch_signals(signal_shutdown).await;
        TaskExit::Signals
    });

    tasks.spawn(async move { TaskExit::Control(server.run().await) });

    let channel_shutdown = shutdown.clone();
    tasks.spawn(async move {
        let result = channel.await;
        if let Err(e) = &result {
            channel_shutdown.trigger(ShutdownReason::ChannelClosed(format!("{:#}", e)));
        }
        TaskExit::Channel(result)
    });

    let mut socket = None;
    let mut channel_result = Ok(());
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(TaskExit::Signals) => {}
            Ok(TaskExit::Control(file)) => socket = Some(file),
            Ok(TaskExit::Channel(result)) => channel_result = result,
            Err(e) => {
                error!("Daemon task failed: {}", e);
                shutdown.trigger(ShutdownReason::ChannelClosed(format!("task failed: {}", e)));
            }
        }
    }

    if let Some(socket) = socket {
        socket.remove();
    }
    state.set(ConnectionState::Disconnected);
    shutdown.mark_stopped();

    match shutdown.reason() {
        Some(reason) => info!("Daemon stopped ({})", reason),
        None => info!("Daemon stopped"),
    }

    channel_result
}
