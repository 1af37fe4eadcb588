//! Reply-chain resolution.
//!
//! Every relayed first chunk carries an invisible marker (a masked link
//! whose label is a zero-width character) encoding the source message id.
//! When a reply arrives for a source message with no local mapping — the
//! table was evicted, or the relay restarted — the target channels' recent
//! history is scanned for that marker (or a literal id occurrence), and a
//! hit is persisted so the scan happens at most once per source id.

use std::sync::LazyLock;

use {regex::Regex, tracing::debug};

use crate::mapping::{MappingStore, TargetLocation};

/// Host used in marker links. Never resolvable on purpose.
const MARKER_HOST: &str = "courier.invalid";

static MARKER_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    let re = Regex::new(r"courier\.invalid/ref/([0-9A-Za-z_-]+)").unwrap();
    re
});

/// Invisible source-id marker appended to the first chunk of a dispatch.
///
/// Rendered as a masked link with a zero-width label, so readers see
/// nothing but the id survives in the raw content for later scans.
#[must_use]
pub fn hidden_marker(source_id: &str) -> String {
    format!("[\u{200c}](https://{MARKER_HOST}/ref/{source_id})")
}

/// Extract the source id from relayed message content, if present.
#[must_use]
pub fn extract_marker(content: &str) -> Option<String> {
    MARKER_RE
        .captures(content)
        .map(|caps| caps[1].to_string())
}

/// One message from a target channel's history.
#[derive(Debug, Clone)]
pub struct HistoryMessage {
    pub id: String,
    pub content: String,
}

/// Read access to target-channel history, provided by the session side.
#[async_trait::async_trait]
pub trait HistoryReader: Send + Sync {
    /// Most-recent-first page of messages, older than `before` when given.
    async fn recent(
        &self,
        channel_id: &str,
        limit: usize,
        before: Option<&str>,
    ) -> anyhow::Result<Vec<HistoryMessage>>;
}

/// Page size used while scanning.
const SCAN_PAGE: usize = 100;

/// Scan `channels` for a relayed copy of `source_id`, newest first, up to
/// `depth` messages per channel (`None` = until the channel is exhausted).
///
/// A hit is recorded in `mappings` so subsequent replies to the same
/// source message resolve without another scan.
pub async fn scan_for_source(
    reader: &dyn HistoryReader,
    mappings: &std::sync::Mutex<MappingStore>,
    channels: &[String],
    source_id: &str,
    depth: Option<usize>,
) -> Option<TargetLocation> {
    for channel_id in channels {
        let mut before: Option<String> = None;
        let mut inspected = 0usize;

        loop {
            let page_limit = match depth {
                Some(depth) => SCAN_PAGE.min(depth.saturating_sub(inspected)),
                None => SCAN_PAGE,
            };
            if page_limit == 0 {
                break;
            }

            let page = match reader.recent(channel_id, page_limit, before.as_deref()).await {
                Ok(page) => page,
                Err(e) => {
                    debug!(%channel_id, error = %e, "history scan failed");
                    break;
                },
            };
            if page.is_empty() {
                break;
            }

            for message in &page {
                let hit = extract_marker(&message.content)
                    .is_some_and(|id| id == source_id)
                    || message.content.contains(source_id);
                if hit {
                    let target = TargetLocation {
                        channel_id: channel_id.clone(),
                        message_id: message.id.clone(),
                    };
                    lock(mappings).record(source_id, target.clone());
                    debug!(source_id, %channel_id, message_id = %message.id, "reply mapping discovered by scan");
                    return Some(target);
                }
            }

            inspected += page.len();
            before = page.last().map(|m| m.id.clone());
        }
    }
    None
}

/// Call-to-action line pointing readers at the relayed original.
///
/// `jump_url` is absent when destination metadata could not be resolved;
/// the wording still tells readers a reply context exists.
#[must_use]
pub fn jump_line(jump_url: Option<&str>, original_has_media: bool) -> String {
    let noun = if original_has_media {
        "original (with attachment)"
    } else {
        "original message"
    };
    match jump_url {
        Some(url) => format!("-# ↪ [jump to {noun}]({url})"),
        None => format!("-# ↪ in reply to an earlier {noun}"),
    }
}

fn lock(mappings: &std::sync::Mutex<MappingStore>) -> std::sync::MutexGuard<'_, MappingStore> {
    match mappings.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        std::sync::{
            Mutex,
            atomic::{AtomicUsize, Ordering},
        },
        tempfile::TempDir,
    };

    #[test]
    fn marker_roundtrip() {
        let marker = hidden_marker("123456");
        assert_eq!(extract_marker(&marker).as_deref(), Some("123456"));
        assert_eq!(extract_marker("no marker here"), None);
    }

    #[test]
    fn marker_survives_surrounding_text() {
        let content = format!("relayed text {}", hidden_marker("m42"));
        assert_eq!(extract_marker(&content).as_deref(), Some("m42"));
    }

    struct FakeHistory {
        messages: Vec<HistoryMessage>,
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl HistoryReader for FakeHistory {
        async fn recent(
            &self,
            _channel_id: &str,
            limit: usize,
            before: Option<&str>,
        ) -> anyhow::Result<Vec<HistoryMessage>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let start = match before {
                Some(id) => {
                    self.messages
                        .iter()
                        .position(|m| m.id == id)
                        .map_or(self.messages.len(), |p| p + 1)
                },
                None => 0,
            };
            Ok(self
                .messages
                .iter()
                .skip(start)
                .take(limit)
                .cloned()
                .collect())
        }
    }

    fn mappings(dir: &TempDir) -> Mutex<MappingStore> {
        Mutex::new(MappingStore::new(dir.path().join("map.json"), 100))
    }

    #[tokio::test]
    async fn scan_finds_marker_and_records_mapping() {
        let tmp = TempDir::new().unwrap();
        let store = mappings(&tmp);
        let history = FakeHistory {
            messages: vec![
                HistoryMessage {
                    id: "t3".into(),
                    content: "unrelated".into(),
                },
                HistoryMessage {
                    id: "t2".into(),
                    content: format!("relayed {}", hidden_marker("src1")),
                },
            ],
            calls: AtomicUsize::new(0),
        };

        let hit = scan_for_source(&history, &store, &["900".into()], "src1", Some(50)).await;
        assert_eq!(
            hit,
            Some(TargetLocation {
                channel_id: "900".into(),
                message_id: "t2".into(),
            })
        );
        // Discovered once: the mapping now answers without another scan.
        assert_eq!(
            store.lock().unwrap().get("src1"),
            Some(TargetLocation {
                channel_id: "900".into(),
                message_id: "t2".into(),
            })
        );
    }

    #[tokio::test]
    async fn scan_respects_depth_cap() {
        let tmp = TempDir::new().unwrap();
        let store = mappings(&tmp);
        let messages: Vec<HistoryMessage> = (0..10)
            .map(|n| HistoryMessage {
                id: format!("t{n}"),
                content: "noise".into(),
            })
            .chain(std::iter::once(HistoryMessage {
                id: "t10".into(),
                content: hidden_marker("src1"),
            }))
            .collect();
        let history = FakeHistory {
            messages,
            calls: AtomicUsize::new(0),
        };

        // Depth 5 stops before the marker at position 10.
        let hit = scan_for_source(&history, &store, &["900".into()], "src1", Some(5)).await;
        assert!(hit.is_none());

        // Unbounded scan reaches it.
        let hit = scan_for_source(&history, &store, &["900".into()], "src1", None).await;
        assert!(hit.is_some());
    }

    #[tokio::test]
    async fn scan_matches_literal_id() {
        let tmp = TempDir::new().unwrap();
        let store = mappings(&tmp);
        let history = FakeHistory {
            messages: vec![HistoryMessage {
                id: "t1".into(),
                content: "forwarded from 987654 earlier".into(),
            }],
            calls: AtomicUsize::new(0),
        };

        let hit = scan_for_source(&history, &store, &["900".into()], "987654", Some(10)).await;
        assert_eq!(hit.map(|t| t.message_id), Some("t1".into()));
    }

    #[test]
    fn jump_line_wording() {
        let with_url = jump_line(Some("https://chat.example/ch/1/2"), false);
        assert!(with_url.contains("original message"));
        assert!(with_url.contains("https://chat.example/ch/1/2"));

        let media = jump_line(None, true);
        assert!(media.contains("with attachment"));
    }
}
