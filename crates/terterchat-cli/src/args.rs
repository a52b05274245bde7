//! CLI argument parsing with clap derive macros.

use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};

use crate::daemon::channel::{host_of, ChannelConfig, DEFAULT_SERVER_ADDR, OUTBOUND_QUEUE_CAPACITY};
use crate::daemon::notify::{DesktopNotifier, LogNotifier, Notifier};
use crate::daemon::paths;
use crate::daemon::tls::TlsFiles;

/// Longest phone number accepted as an identity.
const MAX_PHONE_LEN: usize = 20;

/// Terminal client for terterchat.
///
/// Keeps one authenticated connection to the chat server open in a
/// background daemon and turns incoming events into desktop notifications.
#[derive(Debug, Parser)]
#[command(name = "terterchat", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Start the daemon in the background unless one is already running
    #[command(after_help = "\
Examples:
  terterchat connect +15550100                          # Default server and certificates
  terterchat connect +15550100 --server chat.example:8081
  terterchat connect +15550100 --cert-dir ~/.config/terterchat/certs")]
    Connect(ConnectArgs),

    /// Print whether the daemon is connected to the server
    Status,

    /// Close the connection and stop the daemon
    Disconnect,

    /// Run the daemon in the foreground (usually started by `connect`)
    Daemon(ConnectArgs),
}

#[derive(Debug, Clone, PartialEq, Eq, clap::Args)]
pub struct ConnectArgs {
    /// Phone number identifying this client to the server
    #[arg(value_parser = parse_phone)]
    pub phone: String,

    #[command(flatten)]
    pub channel: ChannelArgs,
}

#[derive(Debug, Clone, PartialEq, Eq, clap::Args)]
pub struct ChannelArgs {
    /// Chat server address
    #[arg(long, default_value = DEFAULT_SERVER_ADDR, value_name = "HOST:PORT")]
    pub server: String,

    /// Name to verify in the server certificate [default: host of --server]
    #[arg(long, value_name = "NAME")]
    pub server_name: Option<String>,

    /// Directory holding ca.crt, client.crt and client.key
    /// [default: $TERTERCHAT_CERT_DIR or ./certificates]
    #[arg(long, value_name = "DIR")]
    pub cert_dir: Option<PathBuf>,

    /// Trusted root certificate (PEM)
    #[arg(long, value_name = "FILE")]
    pub ca: Option<PathBuf>,

    /// Client certificate chain (PEM)
    #[arg(long, value_name = "FILE")]
    pub cert: Option<PathBuf>,

    /// Client private key (PEM)
    #[arg(long, value_name = "FILE")]
    pub key: Option<PathBuf>,

    /// Seconds between keep-alive pings
    #[arg(long, default_value_t = 240, value_parser = clap::value_parser!(u64).range(1..))]
    pub ping_interval_secs: u64,

    /// Seconds a single read may block before it is retried
    #[arg(long, default_value_t = 5, value_parser = clap::value_parser!(u64).range(1..))]
    pub read_timeout_secs: u64,

    /// Seconds a single write may take before it is abandoned
    #[arg(long, default_value_t = 5, value_parser = clap::value_parser!(u64).range(1..))]
    pub write_timeout_secs: u64,

    /// Where notifications are shown
    #[arg(long, value_enum, default_value_t = NotifierKind::Desktop)]
    pub notifier: NotifierKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum NotifierKind {
    /// Desktop notification service (notify-send / osascript)
    Desktop,
    /// Daemon log only
    Log,
}

impl NotifierKind {
    fn as_str(self) -> &'static str {
        match self {
            NotifierKind::Desktop => "desktop",
            NotifierKind::Log => "log",
        }
    }

    pub fn build(self) -> Arc<dyn Notifier> {
        match self {
            NotifierKind::Desktop => Arc::new(DesktopNotifier),
            NotifierKind::Log => Arc::new(LogNotifier),
        }
    }
}

impl ChannelArgs {
    pub fn to_config(&self) -> ChannelConfig {
        let dir = self.cert_dir.clone().unwrap_or_else(paths::get_cert_dir);
        let defaults = TlsFiles::in_dir(&dir);

        ChannelConfig {
            server_addr: self.server.clone(),
            server_name: self
                .server_name
                .clone()
                .unwrap_or_else(|| host_of(&self.server).to_string()),
            tls: TlsFiles {
                ca: self.ca.clone().unwrap_or(defaults.ca),
                cert: self.cert.clone().unwrap_or(defaults.cert),
                key: self.key.clone().unwrap_or(defaults.key),
            },
            ping_interval: Duration::from_secs(self.ping_interval_secs),
            read_timeout: Duration::from_secs(self.read_timeout_secs),
            write_timeout: Duration::from_secs(self.write_timeout_secs),
            queue_capacity: OUTBOUND_QUEUE_CAPACITY,
        }
    }

    /// Flags reproducing these settings for a spawned `daemon` process.
    pub fn to_args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec!["--server".into(), self.server.clone().into()];

        let optional = [
            ("--server-name", self.server_name.clone().map(OsString::from)),
            ("--cert-dir", self.cert_dir.clone().map(OsString::from)),
            ("--ca", self.ca.clone().map(OsString::from)),
            ("--cert", self.cert.clone().map(OsString::from)),
            ("--key", self.key.clone().map(OsString::from)),
        ];
        for (flag, value) in optional {
            if let Some(value) = value {
                args.push(flag.into());
                args.push(value);
            }
        }

        args.extend([
            "--ping-interval-secs".into(),
            self.ping_interval_secs.to_string().into(),
            "--read-timeout-secs".into(),
            self.read_timeout_secs.to_string().into(),
            "--write-timeout-secs".into(),
            self.write_timeout_secs.to_string().into(),
            "--notifier".into(),
            self.notifier.as_str().into(),
        ]);
        args
    }
}

/// Accept digits with an optional leading `+`.
fn parse_phone(s: &str) -> Result<String, String> {
    if s.is_empty() {
        return Err("phone number is empty".to_string());
    }
    if s.len() > MAX_PHONE_LEN {
        return Err(format!(
            "phone number is longer than {} characters",
            MAX_PHONE_LEN
        ));
    }

    let digits = s.strip_prefix('+').unwrap_or(s);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err("phone number must be digits with an optional leading '+'".to_string());
    }
    Ok(s.to_string())
}
