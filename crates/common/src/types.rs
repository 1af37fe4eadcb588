//! Message model shared between the session adapters and the relay pipeline.
//!
//! A [`RelayMessage`] is the gateway-agnostic view of one observed chat
//! message: enough structure for filtering, mention resolution, and
//! re-dispatch, without exposing any client-library types.

use serde::{Deserialize, Serialize};

/// Author of an observed message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageAuthor {
    pub id: String,
    /// Account-unique handle (e.g. `alice`).
    pub name: String,
    /// Server/display name, when it differs from the handle.
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
    pub is_bot: bool,
}

impl MessageAuthor {
    /// Name to show when impersonating the source author downstream.
    #[must_use]
    pub fn display(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.name)
    }
}

/// One file attached to a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    pub url: String,
    pub content_type: Option<String>,
    pub size: u64,
}

impl Attachment {
    /// Lowercased filename extension, if any.
    #[must_use]
    pub fn extension(&self) -> Option<String> {
        self.filename.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase())
    }
}

/// Rich embed, shaped like the destination wire format so it can be both
/// inspected (keyword surfaces) and re-posted verbatim.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Embed {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<EmbedAuthor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub footer: Option<EmbedFooter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<EmbedMedia>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<EmbedMedia>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<EmbedField>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbedAuthor {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbedFooter {
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbedMedia {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbedField {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub inline: bool,
}

impl Embed {
    /// All textual surfaces of the embed, in document order.
    pub fn text_surfaces(&self) -> Vec<&str> {
        let mut out = Vec::new();
        if let Some(t) = &self.title {
            out.push(t.as_str());
        }
        if let Some(d) = &self.description {
            out.push(d.as_str());
        }
        if let Some(a) = &self.author {
            out.push(a.name.as_str());
        }
        for f in &self.fields {
            out.push(f.name.as_str());
            out.push(f.value.as_str());
        }
        if let Some(f) = &self.footer {
            out.push(f.text.as_str());
        }
        out
    }
}

/// Reference to a prior message (the reply target).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRef {
    pub channel_id: String,
    pub message_id: String,
    /// Whether the referenced message carried attachments or embeds,
    /// when the gateway included it in the event.
    #[serde(default)]
    pub has_media: bool,
}

/// A mention token observed in the message body, with its resolved
/// display text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mention {
    pub kind: MentionKind,
    pub id: String,
    pub display: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MentionKind {
    User,
    Channel,
    Role,
}

/// Gateway-agnostic view of one observed message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayMessage {
    pub id: String,
    pub channel_id: String,
    pub guild_id: Option<String>,
    /// Absent for relay/webhook-originated messages, which have no
    /// identifiable author account.
    pub author: Option<MessageAuthor>,
    /// True when the message was produced by a webhook/relay rather
    /// than a user or bot account.
    pub webhook_origin: bool,
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub embeds: Vec<Embed>,
    pub reference: Option<MessageRef>,
    #[serde(default)]
    pub mentions: Vec<Mention>,
}

impl RelayMessage {
    /// True when the message carries anything beyond plain text.
    #[must_use]
    pub fn has_rich_content(&self) -> bool {
        !self.attachments.is_empty() || !self.embeds.is_empty()
    }

    /// Body plus every embed surface, for keyword matching.
    pub fn text_surfaces(&self) -> Vec<&str> {
        let mut out = vec![self.content.as_str()];
        for embed in &self.embeds {
            out.extend(embed.text_surfaces());
        }
        out
    }
}
