//! Sink trait and composites.

use std::sync::Mutex;

/// Trait for message sinks.
///
/// Writes must never fail or block the caller's correctness.
pub trait LogSink: Send + Sync {
    fn write(&self, message: &str);
}

/// A sink that does nothing.
pub struct NoOpSink;

impl LogSink for NoOpSink {
    fn write(&self, _message: &str) {}
}

/// A composite sink that dispatches to multiple backends.
pub struct CompositeSink {
    sinks: Vec<Box<dyn LogSink>>,
}

impl CompositeSink {
    pub fn new(sinks: Vec<Box<dyn LogSink>>) -> Self {
        Self { sinks }
    }

    pub fn add(&mut self, sink: Box<dyn LogSink>) {
        self.sinks.push(sink);
    }
}

impl LogSink for CompositeSink {
    fn write(&self, message: &str) {
        for sink in &self.sinks {
            sink.write(message);
        }
    }
}

/// Sink that keeps every message.
#[derive(Debug, Default)]
pub struct MemorySink {
    messages: Mutex<Vec<String>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<String> {
        self.messages
            .lock()
            .map(|m| m.clone())
            .unwrap_or_default()
    }

    /// Whether any message contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        self.messages().iter().any(|m| m.contains(needle))
    }
}

impl LogSink for MemorySink {
    fn write(&self, message: &str) {
        if let Ok(mut messages) = self.messages.lock() {
            messages.push(message.to_string());
        }
    }
}

// Shared sinks, so callers can keep a handle to what they passed in
impl<T: LogSink + ?Sized> LogSink for std::sync::Arc<T> {
    fn write(&self, message: &str) {
        (**self).write(message);
    }
}
