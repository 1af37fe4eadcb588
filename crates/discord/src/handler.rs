//! Serenity event handler forwarding gateway events into the session
//! event stream.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use {
    serenity::{
        all::{Context, EventHandler, Message, Ready},
        async_trait,
        model::event::ResumedEvent,
    },
    tokio::sync::mpsc,
    tracing::debug,
};

use {
    courier_common::types::{
        Attachment, Embed, EmbedAuthor, EmbedField, EmbedFooter, EmbedMedia, Mention, MentionKind,
        MessageAuthor, MessageRef, RelayMessage,
    },
    courier_supervisor::SessionEvent,
};

/// Forwards serenity events into the supervisor's event channel.
pub(crate) struct EventForwarder {
    pub tx: mpsc::Sender<SessionEvent>,
    pub connected: Arc<AtomicBool>,
}

#[async_trait]
impl EventHandler for EventForwarder {
    async fn ready(&self, _ctx: Context, ready: Ready) {
        self.connected.store(true, Ordering::SeqCst);
        let _ = self
            .tx
            .send(SessionEvent::Ready {
                self_id: ready.user.id.to_string(),
            })
            .await;
    }

    async fn resume(&self, _ctx: Context, _resume: ResumedEvent) {
        debug!("gateway resumed");
        let _ = self.tx.send(SessionEvent::Resume).await;
    }

    async fn message(&self, ctx: Context, msg: Message) {
        let relay = map_message(&ctx, &msg);
        let _ = self.tx.send(SessionEvent::Message(relay)).await;
    }
}

/// Project a serenity message onto the gateway-agnostic relay model.
fn map_message(ctx: &Context, msg: &Message) -> RelayMessage {
    let author = MessageAuthor {
        id: msg.author.id.to_string(),
        name: msg.author.name.clone(),
        display_name: msg.author.global_name.clone(),
        avatar_url: msg.author.avatar_url(),
        is_bot: msg.author.bot,
    };

    let attachments = msg
        .attachments
        .iter()
        .map(|att| Attachment {
            filename: att.filename.clone(),
            url: att.url.clone(),
            content_type: att.content_type.clone(),
            size: u64::from(att.size),
        })
        .collect();

    let embeds = msg.embeds.iter().map(map_embed).collect();

    let reference = msg.message_reference.as_ref().and_then(|r| {
        let message_id = r.message_id?;
        let has_media = msg
            .referenced_message
            .as_ref()
            .is_some_and(|m| !m.attachments.is_empty() || !m.embeds.is_empty());
        Some(MessageRef {
            channel_id: r.channel_id.to_string(),
            message_id: message_id.to_string(),
            has_media,
        })
    });

    RelayMessage {
        id: msg.id.to_string(),
        channel_id: msg.channel_id.to_string(),
        guild_id: msg.guild_id.map(|g| g.to_string()),
        author: Some(author),
        webhook_origin: msg.webhook_id.is_some(),
        content: msg.content.clone(),
        attachments,
        embeds,
        reference,
        mentions: collect_mentions(ctx, msg),
    }
}

fn map_embed(embed: &serenity::all::Embed) -> Embed {
    Embed {
        title: embed.title.clone(),
        description: embed.description.clone(),
        url: embed.url.clone(),
        color: embed.colour.map(|c| c.0),
        author: embed.author.as_ref().map(|a| EmbedAuthor {
            name: a.name.clone(),
            icon_url: a.icon_url.clone(),
        }),
        footer: embed.footer.as_ref().map(|f| EmbedFooter {
            text: f.text.clone(),
        }),
        image: embed.image.as_ref().map(|i| EmbedMedia { url: i.url.clone() }),
        thumbnail: embed.thumbnail.as_ref().map(|t| EmbedMedia { url: t.url.clone() }),
        fields: embed
            .fields
            .iter()
            .map(|f| EmbedField {
                name: f.name.clone(),
                value: f.value.clone(),
                inline: f.inline,
            })
            .collect(),
    }
}

/// Resolve user mentions from the event payload and channel/role mentions
/// from the guild cache, best effort.
fn collect_mentions(ctx: &Context, msg: &Message) -> Vec<Mention> {
    let mut mentions: Vec<Mention> = msg
        .mentions
        .iter()
        .map(|user| Mention {
            kind: MentionKind::User,
            id: user.id.to_string(),
            display: user
                .global_name
                .clone()
                .unwrap_or_else(|| user.name.clone()),
        })
        .collect();

    if let Some(guild) = msg.guild_id.and_then(|g| ctx.cache.guild(g)) {
        for role_id in &msg.mention_roles {
            if let Some(role) = guild.roles.get(role_id) {
                mentions.push(Mention {
                    kind: MentionKind::Role,
                    id: role_id.to_string(),
                    display: role.name.clone(),
                });
            }
        }
        for (channel_id, channel) in &guild.channels {
            if msg.content.contains(&format!("<#{channel_id}>")) {
                mentions.push(Mention {
                    kind: MentionKind::Channel,
                    id: channel_id.to_string(),
                    display: channel.name.clone(),
                });
            }
        }
    }

    mentions
}
