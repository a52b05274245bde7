//! Wire-level types shared by the daemon and the CLI.
//!
//! Two protocols live here:
//!
//! - the remote protocol spoken over the secure channel: newline-terminated
//!   frames that are either keep-alive tokens or event envelopes, and
//! - the local control protocol spoken over the daemon's Unix socket: one
//!   newline-terminated command, at most one newline-terminated reply.

use std::fmt;
use std::str::FromStr;

/// Keep-alive request token.
pub const PING: &str = "ping";

/// Keep-alive reply token.
pub const PONG: &str = "pong";

/// Frame terminator on both protocols.
pub const FRAME_DELIMITER: u8 = b'\n';

/// Separator between the event name and its JSON payload.
pub const ENVELOPE_SEPARATOR: u8 = b'|';

/// An inbound frame after keep-alive classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame<'a> {
    Ping,
    Pong,
    /// Anything else, handed to the event dispatcher untouched.
    Envelope(&'a [u8]),
}

impl<'a> Frame<'a> {
    /// Classify a raw frame. Surrounding whitespace (including the trailing
    /// newline and any `\r`) is ignored.
    pub fn classify(raw: &'a [u8]) -> Self {
        let trimmed = raw.trim_ascii();
        if trimmed == PING.as_bytes() {
            Frame::Ping
        } else if trimmed == PONG.as_bytes() {
            Frame::Pong
        } else {
            Frame::Envelope(trimmed)
        }
    }

    /// The keep-alive frame to send back, if any.
    ///
    /// Both tokens elicit the opposite token. Two peers applying this rule
    /// to each other will keep echoing; the server is expected to answer
    /// `ping` only.
    pub fn keepalive_reply(&self) -> Option<&'static [u8]> {
        match self {
            Frame::Ping => Some(b"pong\n"),
            Frame::Pong => Some(b"ping\n"),
            Frame::Envelope(_) => None,
        }
    }
}

/// Encode a keep-alive ping ready to be written to the wire.
pub fn ping_frame() -> &'static [u8] {
    b"ping\n"
}

/// Commands accepted on the local control socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    Status,
    Disconnect,
}

impl ControlCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlCommand::Status => "status",
            ControlCommand::Disconnect => "disconnect",
        }
    }

    /// The line written by a client to issue this command.
    pub fn to_line(&self) -> String {
        format!("{}\n", self.as_str())
    }
}

impl fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a control line is not a known command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownCommand(pub String);

impl fmt::Display for UnknownCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown control command '{}'", self.0)
    }
}

impl std::error::Error for UnknownCommand {}

impl FromStr for ControlCommand {
    type Err = UnknownCommand;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "status" => Ok(ControlCommand::Status),
            "disconnect" => Ok(ControlCommand::Disconnect),
            other => Err(UnknownCommand(other.to_string())),
        }
    }
}

/// State of the secure channel as seen by status queries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    #[default]
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
}

impl ConnectionState {
    /// Decode the representation stored in an atomic cell.
    ///
    /// Unknown values map to `Disconnected`.
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            _ => ConnectionState::Disconnected,
        }
    }

    /// The reply line for a `status` query. A handshake in progress still
    /// reports `disconnected`.
    pub fn status_line(&self) -> &'static str {
        match self {
            ConnectionState::Connected => "connected\n",
            ConnectionState::Connecting | ConnectionState::Disconnected => "disconnected\n",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
        }
    }
}
