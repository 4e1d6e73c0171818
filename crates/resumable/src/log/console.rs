//! Console sink backed by `tracing`.

use super::LogSink;

/// Sink that writes messages as `tracing` info events.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingSink;

impl TracingSink {
    pub fn new() -> Self {
        Self
    }
}

impl LogSink for TracingSink {
    fn write(&self, message: &str) {
        tracing::info!(target: "resumable::checkpoint", "{}", message);
    }
}
