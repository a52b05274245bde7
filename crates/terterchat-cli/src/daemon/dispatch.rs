//! Turns inbound event envelopes into notifications.

use std::sync::Arc;

use anyhow::{Context, Result};
use terterchat_core::event::{parse_envelope, Event};
use tracing::{debug, warn};

use crate::daemon::notify::Notifier;

/// How much of a rejected frame to include in the log line.
const LOG_PREVIEW_LEN: usize = 120;

/// Event dispatcher used by the secure channel's read loop.
#[derive(Clone)]
pub struct Dispatcher {
    notifier: Arc<dyn Notifier>,
}

impl Dispatcher {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self { notifier }
    }

    /// Decode one envelope and show its notification.
    ///
    /// Decoding failures carry a [`FrameError`](terterchat_core::error::FrameError).
    pub fn dispatch(&self, raw: &[u8]) -> Result<Event> {
        let event = parse_envelope(raw)?;
        debug!("Received {} event", event.name());

        self.notifier
            .notify(&event.notification())
            .with_context(|| format!("Failed to show {} notification", event.name()))?;

        Ok(event)
    }

    /// Dispatch and log any failure. Never fails: a bad frame is dropped and
    /// the caller moves on to the next one.
    pub fn handle(&self, raw: &[u8]) {
        if let Err(e) = self.dispatch(raw) {
            warn!("Dropping frame {:?}: {:#}", preview(raw), e);
        }
    }
}

fn preview(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    match text.char_indices().nth(LOG_PREVIEW_LEN) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.into_owned(),
    }
}
