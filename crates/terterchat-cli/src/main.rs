//! terterchat CLI and daemon entry point.

mod args;
mod daemon;

use clap::Parser;
use tracing::error;

use crate::args::{Cli, Commands, ConnectArgs};
use crate::daemon::{paths, ControlClient, Daemon};

fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!("Failed to create tokio runtime: {}", e);
            std::process::exit(1);
        }
    };

    let result = runtime.block_on(async {
        match cli.command {
            Commands::Daemon(args) => run_daemon(args).await,
            command => run_client_command(command).await,
        }
    });

    if let Err(e) = result {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

/// Run the daemon in the foreground until shutdown.
async fn run_daemon(args: ConnectArgs) -> anyhow::Result<()> {
    let config = args.channel.to_config();
    let notifier = args.channel.notifier.build();
    Daemon::new(config, notifier, paths::get_socket_path())
        .run(args.phone)
        .await
}

/// Commands that talk to an existing daemon over the control socket.
async fn run_client_command(command: Commands) -> anyhow::Result<()> {
    let client = ControlClient::default();

    match command {
        Commands::Connect(args) => {
            println!("connecting to server");
            client
                .start_daemon(&args.phone, &args.channel.to_args())
                .await?;
        }
        Commands::Status => {
            println!("{}", client.status().await?);
        }
        Commands::Disconnect => {
            if client.disconnect().await? {
                println!("disconnected");
            } else {
                eprintln!("Daemon is not running");
            }
        }
        Commands::Daemon(_) => unreachable!("Daemon command handled separately"),
    }

    Ok(())
}
