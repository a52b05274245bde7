//! Errors raised while decoding event envelopes.

use crate::event::EventName;

/// Why an inbound envelope could not be turned into an event.
///
/// None of these are fatal to the connection: the frame is dropped and the
/// reader moves on to the next one.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("malformed frame: missing '|' separator")]
    MalformedFrame,

    #[error("unknown event '{0}'")]
    UnknownEvent(String),

    #[error("failed to decode {event} payload: {source}")]
    Decode {
        event: EventName,
        #[source]
        source: serde_json::Error,
    },
}

impl FrameError {
    /// The event name involved, when the frame got far enough to have one.
    pub fn event(&self) -> Option<EventName> {
        match self {
            FrameError::Decode { event, .. } => Some(*event),
            FrameError::MalformedFrame | FrameError::UnknownEvent(_) => None,
        }
    }
}
