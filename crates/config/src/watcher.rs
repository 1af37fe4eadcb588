//! Filesystem watcher for the desired-state document.
//!
//! Watches the data directory for document writes and for the reload
//! signal artifact, debounced. Document events are gated on a content
//! hash so editor temp files and no-op rewrites don't trigger spurious
//! reconciliation passes; signal events always fire.

use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use {
    anyhow::Result,
    notify_debouncer_full::{
        DebounceEventResult, Debouncer, RecommendedCache, new_debouncer, notify::RecursiveMode,
    },
    sha2::{Digest, Sha256},
    tokio::sync::mpsc,
    tracing::{debug, warn},
};

/// Why a reconciliation pass was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadEvent {
    /// The document content changed.
    Document,
    /// The out-of-band signal artifact was touched.
    Signal,
}

/// Content hash of the document, `None` when it does not exist.
pub fn document_hash(path: &Path) -> Option<[u8; 32]> {
    let bytes = std::fs::read(path).ok()?;
    Some(Sha256::digest(&bytes).into())
}

/// Watches the data directory for desired-state changes with debouncing.
pub struct ConfigWatcher {
    _debouncer: Debouncer<notify_debouncer_full::notify::RecommendedWatcher, RecommendedCache>,
}

impl ConfigWatcher {
    /// Start watching. Returns the watcher and a receiver for reload events.
    ///
    /// The watcher must be kept alive (not dropped) for events to continue.
    pub fn start(
        document_path: PathBuf,
        signal_path: PathBuf,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ReloadEvent>)> {
        let (tx, rx) = mpsc::unbounded_channel();

        let last_hash = Arc::new(Mutex::new(document_hash(&document_path)));
        let doc_path = document_path.clone();
        let sig_path = signal_path.clone();

        let debouncer = new_debouncer(
            std::time::Duration::from_millis(500),
            None,
            move |result: DebounceEventResult| match result {
                Ok(events) => {
                    let mut doc_touched = false;
                    let mut signalled = false;
                    for event in events {
                        for path in &event.paths {
                            if path == &sig_path {
                                signalled = true;
                            } else if path == &doc_path {
                                doc_touched = true;
                            }
                        }
                    }

                    if signalled {
                        debug!("reload signal received");
                        let _ = tx.send(ReloadEvent::Signal);
                    }
                    if doc_touched {
                        let current = document_hash(&doc_path);
                        let mut last = match last_hash.lock() {
                            Ok(guard) => guard,
                            Err(poisoned) => poisoned.into_inner(),
                        };
                        if *last != current {
                            *last = current;
                            debug!(path = %doc_path.display(), "document content changed");
                            let _ = tx.send(ReloadEvent::Document);
                        }
                    }
                },
                Err(errors) => {
                    for e in errors {
                        warn!(error = %e, "config watcher error");
                    }
                },
            },
        )?;

        let mut watcher = Self {
            _debouncer: debouncer,
        };

        // Watch the parent directory: atomic saves rename a temp file over
        // the document, which some platforms report against the directory
        // rather than the final path.
        let dir = document_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        if !dir.exists() {
            std::fs::create_dir_all(&dir)?;
        }
        watcher._debouncer.watch(&dir, RecursiveMode::NonRecursive)?;
        debug!(dir = %dir.display(), "config watcher: watching directory");

        Ok((watcher, rx))
    }
}
