//! Desired-state document I/O.
//!
//! The document is written atomically by the external configuration API
//! (write-to-temp then rename). Reads can race such a save, so
//! [`load_document_with_retry`] retries transient failures a bounded
//! number of times before giving up until the next watcher trigger.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use {
    anyhow::{Context, Result},
    tracing::{debug, warn},
};

use crate::schema::DesiredStateDoc;

/// Attempts made against a document read that races an atomic save.
const READ_RETRIES: u32 = 3;
/// Delay between read retries.
const READ_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Default data directory (`~/.courier/`).
pub fn data_dir() -> PathBuf {
    dirs_next::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".courier")
}

/// Path of the desired-state document inside `dir`.
pub fn document_path(dir: &Path) -> PathBuf {
    dir.join("accounts.json")
}

/// Path of the out-of-band reload signal artifact inside `dir`.
pub fn signal_path(dir: &Path) -> PathBuf {
    dir.join("reload.signal")
}

/// Path of the status sink inside `dir`.
pub fn status_path(dir: &Path) -> PathBuf {
    dir.join("status.json")
}

/// Directory holding per-account mapping stores inside `dir`.
pub fn mappings_dir(dir: &Path) -> PathBuf {
    dir.join("mappings")
}

/// Load and parse the document. A missing file is an empty document, not
/// an error — the config API may simply not have written one yet.
pub fn load_document(path: &Path) -> Result<DesiredStateDoc> {
    if !path.exists() {
        debug!(path = %path.display(), "no desired-state document, starting empty");
        return Ok(DesiredStateDoc::default());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let doc = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(doc)
}

/// Load the document, retrying transient failures.
///
/// A read that lands between the config API's temp-write and rename can
/// see a missing or half-renamed file; a short retry loop rides that out.
/// Returns the last error once retries are exhausted.
pub async fn load_document_with_retry(path: &Path) -> Result<DesiredStateDoc> {
    let mut last_err = None;
    for attempt in 1..=READ_RETRIES {
        match load_document(path) {
            Ok(doc) => return Ok(doc),
            Err(e) => {
                warn!(
                    path = %path.display(),
                    attempt,
                    error = %e,
                    "transient document read failure"
                );
                last_err = Some(e);
                tokio::time::sleep(READ_RETRY_DELAY).await;
            },
        }
    }
    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("document read failed")))
}

/// Atomic save: write to temp, rename over target, keep `.bak`.
pub fn save_document(path: &Path, doc: &DesiredStateDoc) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(doc)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json.as_bytes())?;

    if path.exists() {
        let bak = path.with_extension("json.bak");
        let _ = std::fs::rename(path, &bak);
    }

    std::fs::rename(&tmp, path)?;
    debug!(path = %path.display(), "saved desired-state document");
    Ok(())
}
