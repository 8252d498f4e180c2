//! Log streaming for podwatch
//!
//! This crate follows pod log streams concurrently, keeps a bounded history
//! per pod, fans lines out to subscribers and searches the history.

mod buffer;
mod config;
mod error;
mod export;
mod multiplexer;
mod parser;
mod reader;
mod search;
mod service;

pub use buffer::{LogBuffer, PodRing};
pub use config::{
    BackoffConfig, DEFAULT_BUFFER_CAPACITY, DEFAULT_EVENT_CAPACITY, DEFAULT_TAIL_LINES,
    WatcherConfig,
};
pub use error::{Result, WatchError, validate_pod_name};
pub use export::export_buffers;
pub use multiplexer::{StreamMultiplexer, Subscription};
pub use parser::LineParser;
pub use reader::StreamReader;
pub use search::{CompiledQuery, SearchIndex};
pub use service::WatcherService;

// Re-export types used in our public API
pub use podwatch_types::{
    LogLine, PodLogMessage, SearchOptions, SearchResult, WatchStatus, WatchedPod,
};
