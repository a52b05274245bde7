//! Connection state shared between the secure channel and status queries.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use terterchat_core::protocol::ConnectionState;

/// Cloneable handle to the current [`ConnectionState`].
///
/// Written only by the secure channel; read by any number of control
/// connections.
#[derive(Debug, Clone, Default)]
pub struct SharedConnectionState {
    inner: Arc<AtomicU8>,
}

impl SharedConnectionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.inner.load(Ordering::Acquire))
    }

    pub fn set(&self, state: ConnectionState) {
        let previous = ConnectionState::from_u8(self.inner.swap(state as u8, Ordering::AcqRel));
        if previous != state {
            tracing::debug!("Connection state {} -> {}", previous, state);
        }
    }
}
