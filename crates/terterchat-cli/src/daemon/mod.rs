//! Connection daemon: one secure channel to the chat server, a local control
//! socket, and the shutdown machinery tying them together.

pub mod channel;
pub mod client;
pub mod dispatch;
pub mod notify;
pub mod paths;
pub mod server;
pub mod shutdown;
pub mod state;
pub mod supervisor;
pub mod tls;

// Public API - used by main.rs
pub use client::ControlClient;
pub use supervisor::Daemon;
