//! Desired-state document, watcher, and status sink.
//!
//! The document (`accounts.json` in the data directory) is owned by the
//! external configuration API; courier reads it, watches it for changes,
//! and reports account state back through the status sink.

pub mod loader;
pub mod schema;
pub mod status;
pub mod watcher;

pub use {
    loader::{
        data_dir, document_path, load_document, load_document_with_retry, mappings_dir,
        save_document, signal_path, status_path,
    },
    schema::{
        AccountDesiredState, DesiredStateDoc, FilterConfig, ForwardConfig, Replacement,
        ReplyScanConfig, RouteRule, SessionKind, TranslationConfig, validate_document,
    },
    status::{AccountState, AccountStatus, StatusSink},
    watcher::{ConfigWatcher, ReloadEvent},
};
