//! Target-channel history access for reply-scan fallbacks.

use std::sync::Arc;

use {
    anyhow::Context as _,
    async_trait::async_trait,
    serenity::{
        all::{ChannelId, MessageId},
        builder::GetMessages,
        http::Http,
    },
};

use courier_relay::{HistoryMessage, HistoryReader};

/// Reads recent messages via the session's HTTP client.
pub(crate) struct ChannelHistory {
    pub http: Arc<Http>,
}

#[async_trait]
impl HistoryReader for ChannelHistory {
    async fn recent(
        &self,
        channel_id: &str,
        limit: usize,
        before: Option<&str>,
    ) -> anyhow::Result<Vec<HistoryMessage>> {
        let channel: u64 = channel_id.parse().context("invalid channel id")?;

        let mut builder = GetMessages::new().limit(limit.min(100) as u8);
        if let Some(before) = before {
            let before: u64 = before.parse().context("invalid pagination cursor")?;
            builder = builder.before(MessageId::new(before));
        }

        let messages = ChannelId::new(channel)
            .messages(&self.http, builder)
            .await
            .context("history fetch failed")?;

        Ok(messages
            .into_iter()
            .map(|m| HistoryMessage {
                id: m.id.to_string(),
                content: m.content,
            })
            .collect())
    }
}
