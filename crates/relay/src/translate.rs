//! Pluggable translation interface.
//!
//! The concrete provider lives outside this crate; senders only need a
//! text-in/text-out call. Translated dispatches carry the separator line
//! below the original text, which doubles as the "already translated"
//! marker so re-processed content is never translated twice.

use async_trait::async_trait;

/// Line inserted between the original text and its translation.
pub const TRANSLATION_SEPARATOR: &str = "──────────";

/// Text-in/text-out translation provider.
#[async_trait]
pub trait Translator: Send + Sync {
    async fn translate(&self, text: &str, target_lang: &str) -> anyhow::Result<String>;
}

/// True when the text already carries a translation block.
#[must_use]
pub fn is_translated(text: &str) -> bool {
    text.contains(TRANSLATION_SEPARATOR)
}
