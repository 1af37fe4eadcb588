//! Per-destination dispatcher.
//!
//! A `Sender` owns one webhook/API endpoint: it applies replacement rules
//! and optional translation, splits oversized text into ordered chunks,
//! downloads attachments under size/time caps, and posts the chunks
//! strictly in order. Different logical items may dispatch concurrently;
//! ordering only matters within one item.

use std::{sync::Arc, time::Duration};

use {
    bytes::Bytes,
    courier_common::types::{Attachment, Embed},
    courier_config::{Replacement, TranslationConfig},
    futures::StreamExt,
    serde::{Deserialize, Serialize},
    tracing::{debug, warn},
};

use crate::{
    error::{Context as _, Error, Result},
    mapping::TargetLocation,
    reply::hidden_marker,
    transform,
    translate::{self, TRANSLATION_SEPARATOR, Translator},
};

/// Size budget per chunk in plain-text mode.
pub const PLAIN_CHUNK_LIMIT: usize = 2000;
/// Size budget per chunk when the item carries embeds.
pub const EMBED_CHUNK_LIMIT: usize = 4096;
/// Budget reserved on the first chunk for the invisible source-id marker.
const MARKER_RESERVE: usize = 96;

/// Hard cap on one attachment download.
const ATTACHMENT_MAX_BYTES: u64 = 8 * 1024 * 1024;
/// Time cap on one attachment download.
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(20);

/// Per-destination configuration, derived from the account's desired state.
#[derive(Debug, Clone)]
pub struct SenderConfig {
    pub endpoint: String,
    /// Relay under the source author's identity.
    pub impersonate: bool,
    pub replacements: Vec<Replacement>,
    pub translation: TranslationConfig,
}

/// One logical message to relay.
#[derive(Debug, Clone, Default)]
pub struct DispatchItem {
    pub source_id: String,
    pub content: String,
    pub reply_to: Option<TargetLocation>,
    pub username: Option<String>,
    pub avatar_url: Option<String>,
    pub attachments: Vec<Attachment>,
    pub embeds: Vec<Embed>,
}

/// One physical chunk that reached the destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchRecord {
    /// Set on the first chunk only — reply threads anchor there.
    pub source_id: Option<String>,
    pub channel_id: String,
    pub message_id: String,
}

/// Destination metadata resolved once by [`Sender::prepare`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DestinationMeta {
    pub name: Option<String>,
    pub channel_id: Option<String>,
    pub guild_id: Option<String>,
}

/// Deep link to a relayed message, for jump-to-original lines.
#[must_use]
pub fn jump_url(guild_id: &str, channel_id: &str, message_id: &str) -> String {
    format!("https://discord.com/channels/{guild_id}/{channel_id}/{message_id}")
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    content: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    username: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    avatar_url: Option<&'a str>,
    #[serde(skip_serializing_if = "embeds_empty")]
    embeds: &'a [Embed],
    #[serde(skip_serializing_if = "Option::is_none")]
    message_reference: Option<ReplyReference<'a>>,
}

fn embeds_empty(embeds: &&[Embed]) -> bool {
    embeds.is_empty()
}

#[derive(Serialize)]
struct ReplyReference<'a> {
    message_id: &'a str,
}

/// Created-message descriptor returned for `wait=true` posts.
#[derive(Debug, Deserialize)]
struct CreatedMessage {
    id: String,
    channel_id: String,
}

struct DownloadedPart {
    filename: String,
    content_type: Option<String>,
    data: Bytes,
}

/// Per-destination dispatcher. Cheap to share behind an `Arc`.
pub struct Sender {
    config: SenderConfig,
    http: reqwest::Client,
    translator: Option<Arc<dyn Translator>>,
    meta: tokio::sync::OnceCell<Option<DestinationMeta>>,
}

impl Sender {
    #[must_use]
    pub fn new(
        config: SenderConfig,
        http: reqwest::Client,
        translator: Option<Arc<dyn Translator>>,
    ) -> Self {
        Self {
            config,
            http,
            translator,
            meta: tokio::sync::OnceCell::new(),
        }
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.config.endpoint
    }

    /// Resolve destination metadata once. Non-fatal: a failure leaves the
    /// sender working, just without history-scan targets and jump links.
    pub async fn prepare(&self) -> Option<DestinationMeta> {
        self.meta
            .get_or_init(|| async {
                match self.fetch_meta().await {
                    Ok(meta) => Some(meta),
                    Err(e) => {
                        debug!(endpoint = %self.config.endpoint, error = %e, "destination metadata unavailable");
                        None
                    },
                }
            })
            .await
            .clone()
    }

    /// Metadata resolved by an earlier [`Self::prepare`] call, if any.
    #[must_use]
    pub fn destination(&self) -> Option<DestinationMeta> {
        self.meta.get().cloned().flatten()
    }

    async fn fetch_meta(&self) -> Result<DestinationMeta> {
        let resp = self
            .http
            .get(&self.config.endpoint)
            .send()
            .await?
            .error_for_status()
            .context("destination rejected metadata probe")?;
        resp.json().await.context("malformed destination metadata")
    }

    /// Relay one logical item as ordered chunks.
    pub async fn dispatch(&self, item: DispatchItem) -> Result<Vec<DispatchRecord>> {
        let mut text = transform::apply_replacements(&item.content, &self.config.replacements);
        text = self.maybe_translate(text).await;

        let limit = if item.embeds.is_empty() {
            PLAIN_CHUNK_LIMIT
        } else {
            EMBED_CHUNK_LIMIT
        };
        let chunks = chunk_text(&text, limit - MARKER_RESERVE);

        let mut parts = Vec::new();
        for attachment in &item.attachments {
            match self.download_attachment(attachment).await {
                Ok(part) => parts.push(part),
                Err(e) => {
                    // Oversized/slow/failed downloads drop that attachment,
                    // never the whole dispatch.
                    warn!(
                        filename = %attachment.filename,
                        error = %e,
                        "attachment dropped from relay"
                    );
                },
            }
        }

        let last = chunks.len() - 1;
        let mut records = Vec::new();
        for (i, chunk) in chunks.iter().enumerate() {
            let mut content = chunk.clone();
            if i == 0 {
                content.push_str(&hidden_marker(&item.source_id));
            }

            let payload = WebhookPayload {
                content: &content,
                username: self
                    .config
                    .impersonate
                    .then_some(item.username.as_deref())
                    .flatten(),
                avatar_url: self
                    .config
                    .impersonate
                    .then_some(item.avatar_url.as_deref())
                    .flatten(),
                embeds: if i == last { &item.embeds } else { &[] },
                message_reference: if i == 0 {
                    item.reply_to
                        .as_ref()
                        .map(|t| ReplyReference {
                            message_id: &t.message_id,
                        })
                } else {
                    None
                },
            };
            let chunk_parts = if i == 0 { parts.as_slice() } else { &[] };

            let created = match self.post_chunk(&payload, chunk_parts).await {
                Ok(created) => created,
                Err(Error::StaleReference) if payload.message_reference.is_some() => {
                    debug!(source_id = %item.source_id, "stale reply reference, retrying stripped");
                    let stripped = WebhookPayload {
                        message_reference: None,
                        ..payload
                    };
                    self.post_chunk(&stripped, chunk_parts).await?
                },
                Err(e) => return Err(e),
            };

            if let Some(created) = created {
                records.push(DispatchRecord {
                    source_id: (i == 0).then(|| item.source_id.clone()),
                    channel_id: created.channel_id,
                    message_id: created.id,
                });
            }
        }

        Ok(records)
    }

    async fn maybe_translate(&self, text: String) -> String {
        if !self.config.translation.enabled
            || translate::is_translated(&text)
            || text.trim().is_empty()
        {
            return text;
        }
        let Some(translator) = &self.translator else {
            return text;
        };
        match translator
            .translate(&text, &self.config.translation.target_lang)
            .await
        {
            Ok(translated) if !translated.trim().is_empty() && translated.trim() != text.trim() => {
                format!("{text}\n{TRANSLATION_SEPARATOR}\n{translated}")
            },
            Ok(_) => text,
            Err(e) => {
                // Swallowed: the original goes out untranslated.
                debug!(error = %e, "translation failed, relaying original text");
                text
            },
        }
    }

    async fn post_chunk(
        &self,
        payload: &WebhookPayload<'_>,
        parts: &[DownloadedPart],
    ) -> Result<Option<CreatedMessage>> {
        let builder = self
            .http
            .post(&self.config.endpoint)
            .query(&[("wait", "true")]);

        let builder = if parts.is_empty() {
            builder.json(payload)
        } else {
            let mut form = reqwest::multipart::Form::new()
                .text("payload_json", serde_json::to_string(payload)?);
            for (i, part) in parts.iter().enumerate() {
                let mut file =
                    reqwest::multipart::Part::bytes(part.data.to_vec()).file_name(part.filename.clone());
                if let Some(ct) = &part.content_type {
                    file = file.mime_str(ct)?;
                }
                form = form.part(format!("files[{i}]"), file);
            }
            builder.multipart(form)
        };

        let resp = builder.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            if status.as_u16() == 400 && looks_like_stale_reference(&body) {
                return Err(Error::StaleReference);
            }
            let mut body = body;
            if let Some((cut, _)) = body.char_indices().nth(200) {
                body.truncate(cut);
            }
            return Err(Error::Endpoint {
                status: status.as_u16(),
                body,
            });
        }

        // Endpoints that ignore `wait=true` return no descriptor; those
        // chunks simply go unrecorded.
        Ok(resp.json().await.ok())
    }

    async fn download_attachment(&self, attachment: &Attachment) -> Result<DownloadedPart> {
        if attachment.size > ATTACHMENT_MAX_BYTES {
            return Err(Error::AttachmentTooLarge {
                size: attachment.size,
                cap: ATTACHMENT_MAX_BYTES,
            });
        }

        let fetch = async {
            let resp = self
                .http
                .get(&attachment.url)
                .send()
                .await?
                .error_for_status()?;
            if let Some(len) = resp.content_length()
                && len > ATTACHMENT_MAX_BYTES
            {
                return Err(Error::AttachmentTooLarge {
                    size: len,
                    cap: ATTACHMENT_MAX_BYTES,
                });
            }

            let mut data: Vec<u8> = Vec::new();
            let mut stream = resp.bytes_stream();
            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                if (data.len() + chunk.len()) as u64 > ATTACHMENT_MAX_BYTES {
                    return Err(Error::AttachmentTooLarge {
                        size: (data.len() + chunk.len()) as u64,
                        cap: ATTACHMENT_MAX_BYTES,
                    });
                }
                data.extend_from_slice(&chunk);
            }

            Ok(DownloadedPart {
                filename: attachment.filename.clone(),
                content_type: attachment.content_type.clone(),
                data: Bytes::from(data),
            })
        };

        match tokio::time::timeout(DOWNLOAD_TIMEOUT, fetch).await {
            Ok(result) => result,
            Err(_) => Err(Error::DownloadTimeout),
        }
    }
}

fn looks_like_stale_reference(body: &str) -> bool {
    let lower = body.to_lowercase();
    lower.contains("message_reference") || lower.contains("unknown message")
}

/// Split text into ordered chunks of at most `limit` characters.
///
/// Cuts prefer the last newline, then the last space, inside the window;
/// chunks keep every original character so their concatenation
/// reconstructs the input exactly. Empty text yields one empty chunk so
/// attachment-/embed-only items still produce a dispatch unit.
#[must_use]
pub fn chunk_text(text: &str, limit: usize) -> Vec<String> {
    let limit = limit.max(1);
    if text.is_empty() {
        return vec![String::new()];
    }

    let mut chunks = Vec::new();
    let mut rest = text;
    loop {
        let hard = match rest.char_indices().nth(limit) {
            Some((idx, _)) => idx,
            None => {
                chunks.push(rest.to_string());
                break;
            },
        };
        let window = &rest[..hard];
        let cut = window
            .rfind('\n')
            .or_else(|| window.rfind(' '))
            .map_or(hard, |i| i + 1);
        chunks.push(rest[..cut].to_string());
        rest = &rest[cut..];
    }
    chunks
}
