//! Progress messages from the checkpoint lifecycle.
//!
//! Provides:
//! - `LogSink` trait for fire-and-forget message sinks
//! - `TracingSink` forwarding to `tracing`
//! - `CompositeSink` for multi-sink fan-out
//! - `MemorySink` collecting messages in memory

mod console;
mod logger;

pub use console::TracingSink;
pub use logger::{CompositeSink, LogSink, MemorySink, NoOpSink};
