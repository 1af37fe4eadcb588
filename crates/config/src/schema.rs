//! Desired-state document schema.
//!
//! The document is produced by the external configuration API and read
//! here; courier never invents accounts, it only converges running state
//! toward what the document describes.

use {
    secrecy::{ExposeSecret, Secret},
    serde::{Deserialize, Serialize},
};

/// Session profile requested for an account.
///
/// `Privileged` sessions subscribe to the full event intents; `Constrained`
/// sessions run with a reduced cache profile to bound memory.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    #[default]
    Privileged,
    Constrained,
}

/// One source-channel → destination-endpoint route.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RouteRule {
    /// Source channel id on the observed platform.
    pub source_channel: String,
    /// Destination webhook/API endpoint URL.
    pub endpoint: String,
}

/// Content filters applied before dispatch.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FilterConfig {
    /// At least one must match (case-insensitive substring) when non-empty.
    pub required_keywords: Vec<String>,
    /// Any match drops the message.
    pub excluded_keywords: Vec<String>,
    /// When non-empty, only these authors pass. Glob `*` supported.
    pub user_allowlist: Vec<String>,
    /// These authors never pass. Glob `*` supported.
    pub user_mutelist: Vec<String>,
    pub ignore_self: bool,
    pub ignore_bots: bool,
    pub ignore_images: bool,
    pub ignore_audio: bool,
    pub ignore_video: bool,
    pub ignore_documents: bool,
}

/// Translation feature toggle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TranslationConfig {
    pub enabled: bool,
    /// BCP-47 target language tag.
    pub target_lang: String,
}

impl Default for TranslationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            target_lang: "en".into(),
        }
    }
}

/// Secondary-platform forwarding toggle. The sink itself lives behind the
/// same dispatch interface as the primary one and is wired externally.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ForwardConfig {
    pub enabled: bool,
}

/// Reply-chain history-scan settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReplyScanConfig {
    /// Channels to scan. Empty = auto-discover from sender destinations.
    pub channels: Vec<String>,
    /// Messages to inspect per channel. `None` = unbounded.
    pub depth: Option<usize>,
}

/// One ordered string-replacement rule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Replacement {
    pub pattern: String,
    pub replace: String,
}

/// Everything one account should converge to.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountDesiredState {
    /// Stable account id, never reused across reconciliations.
    pub id: String,
    /// Gateway credential. May be empty while the user is still setting
    /// the account up — that is an error *status*, not a crash.
    #[serde(serialize_with = "serialize_secret")]
    pub token: Secret<String>,
    pub session_kind: SessionKind,
    /// Optional HTTP proxy for the session connection.
    pub proxy: Option<String>,
    pub routes: Vec<RouteRule>,
    pub filters: FilterConfig,
    pub translation: TranslationConfig,
    pub forward: ForwardConfig,
    pub reply_scan: ReplyScanConfig,
    pub replacements: Vec<Replacement>,
    /// Relay under the source author's name/avatar instead of the
    /// endpoint's own identity.
    pub impersonate: bool,
    /// Whether the account should be logged in at all.
    pub login_requested: bool,
    /// Change-detection token bumped by the config API on login requests.
    pub login_nonce: u64,
    /// Change-detection token bumped to force a full restart.
    pub restart_nonce: u64,
}

impl Default for AccountDesiredState {
    fn default() -> Self {
        Self {
            id: String::new(),
            token: Secret::new(String::new()),
            session_kind: SessionKind::default(),
            proxy: None,
            routes: Vec::new(),
            filters: FilterConfig::default(),
            translation: TranslationConfig::default(),
            forward: ForwardConfig::default(),
            reply_scan: ReplyScanConfig::default(),
            replacements: Vec::new(),
            impersonate: true,
            login_requested: false,
            login_nonce: 0,
            restart_nonce: 0,
        }
    }
}

impl std::fmt::Debug for AccountDesiredState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountDesiredState")
            .field("id", &self.id)
            .field("token", &"[REDACTED]")
            .field("session_kind", &self.session_kind)
            .field("routes", &self.routes.len())
            .field("login_requested", &self.login_requested)
            .finish_non_exhaustive()
    }
}

impl AccountDesiredState {
    /// True when no credential has been provided yet.
    #[must_use]
    pub fn token_is_empty(&self) -> bool {
        self.token.expose_secret().is_empty()
    }

    /// Credential equality without exposing either secret to callers.
    #[must_use]
    pub fn token_matches(&self, other: &Self) -> bool {
        self.token.expose_secret() == other.token.expose_secret()
    }
}

fn serialize_secret<S: serde::Serializer>(
    secret: &Secret<String>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(secret.expose_secret())
}

/// The full desired-state document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DesiredStateDoc {
    pub accounts: Vec<AccountDesiredState>,
    /// Account currently selected in the dashboard. Informational only.
    pub active_account: Option<String>,
}

/// Validate a document, returning one human-readable problem per issue.
///
/// Problems do not prevent reconciliation — accounts with problems are
/// individually skipped or surfaced via status — but `courier validate`
/// reports them up front.
pub fn validate_document(doc: &DesiredStateDoc) -> Vec<String> {
    let mut problems = Vec::new();
    let mut seen = std::collections::HashSet::new();

    for account in &doc.accounts {
        let id = &account.id;
        if id.is_empty() {
            problems.push("account with empty id".into());
            continue;
        }
        if !seen.insert(id.clone()) {
            problems.push(format!("duplicate account id: {id}"));
        }
        if account.login_requested && account.token_is_empty() {
            problems.push(format!("{id}: login requested but no token configured"));
        }
        if account.login_requested && account.routes.is_empty() {
            problems.push(format!("{id}: login requested but no routes configured"));
        }
        for route in &account.routes {
            if url::Url::parse(&route.endpoint).is_err() {
                problems.push(format!(
                    "{id}: malformed endpoint for channel {}: {}",
                    route.source_channel, route.endpoint
                ));
            }
        }
    }

    if let Some(active) = &doc.active_account
        && !doc.accounts.iter().any(|a| &a.id == active)
    {
        problems.push(format!("active_account points at unknown id: {active}"));
    }

    problems
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn account(id: &str) -> AccountDesiredState {
        AccountDesiredState {
            id: id.into(),
            token: Secret::new("tok".into()),
            login_requested: true,
            routes: vec![RouteRule {
                source_channel: "111".into(),
                endpoint: "https://sink.example/api/hooks/1/abc".into(),
            }],
            ..Default::default()
        }
    }

    #[test]
    fn deserialize_minimal_account() {
        let acc: AccountDesiredState = serde_json::from_str(
            r#"{"id": "a1", "token": "secret", "session_kind": "constrained"}"#,
        )
        .unwrap();
        assert_eq!(acc.id, "a1");
        assert_eq!(acc.session_kind, SessionKind::Constrained);
        assert!(!acc.login_requested);
        assert!(!acc.token_is_empty());
    }

    #[test]
    fn serialize_roundtrip_keeps_token() {
        let acc = account("a1");
        let json = serde_json::to_string(&acc).unwrap();
        let back: AccountDesiredState = serde_json::from_str(&json).unwrap();
        assert!(back.token_matches(&acc));
    }

    #[test]
    fn debug_redacts_token() {
        let formatted = format!("{:?}", account("a1"));
        assert!(formatted.contains("REDACTED"));
        assert!(!formatted.contains("tok"));
    }

    #[test]
    fn validate_flags_duplicates_and_missing_token() {
        let mut doc = DesiredStateDoc {
            accounts: vec![account("a1"), account("a1")],
            active_account: Some("ghost".into()),
        };
        doc.accounts[1].token = Secret::new(String::new());

        let problems = validate_document(&doc);
        assert!(problems.iter().any(|p| p.contains("duplicate")));
        assert!(problems.iter().any(|p| p.contains("no token")));
        assert!(problems.iter().any(|p| p.contains("unknown id")));
    }

    #[test]
    fn validate_clean_document() {
        let doc = DesiredStateDoc {
            accounts: vec![account("a1"), account("a2")],
            active_account: Some("a1".into()),
        };
        assert!(validate_document(&doc).is_empty());
    }

    #[test]
    fn validate_flags_empty_routes() {
        let mut acc = account("a1");
        acc.routes.clear();
        let doc = DesiredStateDoc {
            accounts: vec![acc],
            active_account: None,
        };
        assert!(
            validate_document(&doc)
                .iter()
                .any(|p| p.contains("no routes"))
        );
    }
}
