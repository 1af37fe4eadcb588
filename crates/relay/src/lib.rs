//! Per-account message relay: dedup window, content filters, reply-chain
//! resolution, transformation, and chunked dispatch to webhook sinks with
//! bounded-memory mapping persistence.

pub mod dedup;
pub mod error;
pub mod filter;
pub mod mapping;
pub mod pipeline;
pub mod reply;
pub mod sender;
pub mod transform;
pub mod translate;

pub use {
    dedup::DedupWindow,
    error::{Error, Result},
    mapping::{MappingStore, TargetLocation},
    pipeline::{PipelineSettings, RelayPipeline},
    reply::{HistoryMessage, HistoryReader, extract_marker, hidden_marker},
    sender::{DispatchItem, DispatchRecord, Sender, SenderConfig},
    translate::{TRANSLATION_SEPARATOR, Translator},
};
