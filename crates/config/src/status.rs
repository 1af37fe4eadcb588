//! Account status sink.
//!
//! The supervisor writes one entry per account; the external configuration
//! API reads the file to render account state in the dashboard. Writes are
//! atomic so a concurrent reader never sees a torn document.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Mutex,
};

use {
    anyhow::Result,
    serde::{Deserialize, Serialize},
    tracing::warn,
};

/// Lifecycle state of one account.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AccountState {
    #[default]
    Idle,
    Pending,
    Online,
    Error,
    Stopped,
}

impl std::fmt::Display for AccountState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Pending => "pending",
            Self::Online => "online",
            Self::Error => "error",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// One status entry, keyed by account id in the sink file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountStatus {
    pub state: AccountState,
    pub message: String,
}

/// File-backed status sink shared by the supervisor tasks.
pub struct StatusSink {
    path: PathBuf,
    entries: Mutex<HashMap<String, AccountStatus>>,
}

impl StatusSink {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Record a status for `account_id` and persist the sink.
    ///
    /// Persistence failures are logged, never propagated — status is
    /// advisory and must not take an account down.
    pub fn set(&self, account_id: &str, state: AccountState, message: impl Into<String>) {
        let snapshot = {
            let mut entries = self.lock();
            entries.insert(
                account_id.to_string(),
                AccountStatus {
                    state,
                    message: message.into(),
                },
            );
            entries.clone()
        };
        if let Err(e) = persist(&self.path, &snapshot) {
            warn!(account_id, error = %e, "failed to persist status sink");
        }
    }

    /// Drop the entry for an account removed from the desired state.
    pub fn remove(&self, account_id: &str) {
        let snapshot = {
            let mut entries = self.lock();
            entries.remove(account_id);
            entries.clone()
        };
        if let Err(e) = persist(&self.path, &snapshot) {
            warn!(account_id, error = %e, "failed to persist status sink");
        }
    }

    /// Current in-memory status for an account.
    pub fn get(&self, account_id: &str) -> Option<AccountStatus> {
        self.lock().get(account_id).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, AccountStatus>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Read a status sink file, e.g. for `courier status`.
pub fn load(path: &Path) -> Result<HashMap<String, AccountStatus>> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

fn persist(path: &Path, entries: &HashMap<String, AccountStatus>) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(entries)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json.as_bytes())?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, tempfile::TempDir};

    #[test]
    fn set_and_reload() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("status.json");
        let sink = StatusSink::new(path.clone());

        sink.set("a1", AccountState::Online, "logged in");
        sink.set("a2", AccountState::Error, "invalid token");

        let loaded = load(&path).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded["a1"].state, AccountState::Online);
        assert_eq!(loaded["a2"].message, "invalid token");
    }

    #[test]
    fn remove_drops_entry() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("status.json");
        let sink = StatusSink::new(path.clone());

        sink.set("a1", AccountState::Pending, "connecting");
        sink.remove("a1");

        assert!(sink.get("a1").is_none());
        assert!(load(&path).unwrap().is_empty());
    }

    #[test]
    fn missing_sink_loads_empty() {
        let tmp = TempDir::new().unwrap();
        assert!(load(&tmp.path().join("status.json")).unwrap().is_empty());
    }
}
