//! Core types for the terterchat connection daemon.
//!
//! This crate has no I/O. It defines what travels over the two sockets the
//! daemon owns and how push events turn into notifications.
//!
//! # Modules
//!
//! - [`protocol`]: keep-alive frames, control commands, connection state
//! - [`event`]: event names, payload schemas, envelope parsing, notifications
//! - [`error`]: envelope decoding errors
//!
//! # Remote frames
//!
//! | Frame | Meaning |
//! |-------|---------|
//! | `ping` / `pong` | keep-alive, each answered with the other |
//! | `NAME\|{json}` | push event, see [`event::EventName`] |

pub mod error;
pub mod event;
pub mod protocol;
