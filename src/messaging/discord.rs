//! Concrete `PlatformClient` for Discord, via `serenity`. Grounded in the
//! teacher's `messaging/discord.rs` (gateway `EventHandler`, `Http`
//! send/edit, `GetMessages` fetch), trimmed per SPEC_FULL to the
//! message/edit/delete/reaction events and send/fetch calls `ReactiveEngine`
//! needs — the teacher's interaction-component and thread-management
//! surface is dropped since this spec has no slash-command UI.

use crate::messaging::traits::{InboundEvent, InboundStream, OutboundMessage, PlatformClient, ReactionEvent};
use crate::model::{Attachment, Message as CoreMessage, Reaction};
use crate::{ChannelId, MessageId, MillisUtc};
use async_trait::async_trait;
use serenity::all::{
    ChannelId as SerenityChannelId, Context, CreateMessage, EventHandler, GatewayIntents,
    GetMessages, Http, Message as SerenityMessage, MessageId as SerenityMessageId,
    MessageUpdateEvent, Ready, Reaction as SerenityReaction,
};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

/// Shared connection state, populated once the gateway handshake completes
/// in `Handler::ready` and read from both `DiscordClient` and the event
/// handler.
#[derive(Default)]
struct Shared {
    http: Option<Arc<Http>>,
    bot_user_id: String,
}

/// A connected Discord client.
pub struct DiscordClient {
    token: String,
    shared: Arc<RwLock<Shared>>,
}

impl DiscordClient {
    pub fn new(token: String) -> Self {
        Self {
            token,
            shared: Arc::new(RwLock::new(Shared::default())),
        }
    }

    async fn http(&self) -> crate::error::Result<Arc<Http>> {
        self.shared
            .read()
            .await
            .http
            .clone()
            .ok_or_else(|| crate::error::LlmError::Other(anyhow::anyhow!("discord gateway not connected")).into())
    }
}

#[async_trait]
impl PlatformClient for DiscordClient {
    async fn connect(&self) -> crate::error::Result<InboundStream> {
        let (tx, rx) = mpsc::channel(512);
        let handler = Handler { tx, shared: self.shared.clone() };

        let intents = GatewayIntents::GUILDS
            | GatewayIntents::GUILD_MESSAGES
            | GatewayIntents::MESSAGE_CONTENT
            | GatewayIntents::GUILD_MESSAGE_REACTIONS;

        let mut client = serenity::Client::builder(&self.token, intents)
            .event_handler(handler)
            .await
            .map_err(|e| crate::error::LlmError::Other(anyhow::anyhow!("failed to build discord client: {e}")))?;

        self.shared.write().await.http = Some(client.http.clone());

        tokio::spawn(async move {
            if let Err(error) = client.start().await {
                tracing::error!(%error, "discord gateway connection ended");
            }
        });

        Ok(Box::pin(tokio_stream::wrappers::ReceiverStream::new(rx)))
    }

    async fn send(&self, message: OutboundMessage) -> crate::error::Result<CoreMessage> {
        let http = self.http().await?;
        let channel = SerenityChannelId::new(message.channel_id.parse().unwrap_or(0));

        let mut builder = CreateMessage::new().content(message.text.clone());
        if let Some(reply_to) = &message.reply_to_message_id {
            if let Ok(id) = reply_to.parse::<u64>() {
                builder = builder.reference_message((channel, SerenityMessageId::new(id)));
            }
        }

        let sent = channel
            .send_message(&http, builder)
            .await
            .map_err(|e| crate::error::LlmError::Other(anyhow::anyhow!("discord send failed: {e}")))?;

        Ok(serenity_to_core(&sent))
    }

    async fn start_typing(&self, channel_id: &ChannelId) {
        if let Ok(http) = self.http().await {
            let channel = SerenityChannelId::new(channel_id.parse().unwrap_or(0));
            let _ = channel.broadcast_typing(&http).await;
        }
    }

    async fn fetch_around(&self, channel_id: &ChannelId, message_id: &MessageId, span: i64) -> crate::error::Result<Vec<CoreMessage>> {
        let http = self.http().await?;
        let channel = SerenityChannelId::new(channel_id.parse().unwrap_or(0));
        let anchor = SerenityMessageId::new(message_id.parse().unwrap_or(0));

        let builder = GetMessages::new().around(anchor).limit((span.max(1) * 2 + 1).min(100) as u8);
        let fetched = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            channel.messages(&http, builder),
        )
        .await
        .map_err(|_| crate::error::Error::Timeout("discord fetch_around".into()))?
        .map_err(|e| crate::error::LlmError::Other(anyhow::anyhow!("discord fetch failed: {e}")))?;

        let mut out: Vec<CoreMessage> = fetched.iter().map(serenity_to_core).collect();
        out.sort_by_key(|m| m.timestamp);
        Ok(out)
    }

    async fn bot_user_id(&self) -> String {
        self.shared.read().await.bot_user_id.clone()
    }

    async fn backfill(&self, channel_id: &ChannelId, since: MillisUtc) -> crate::error::Result<Vec<CoreMessage>> {
        let http = self.http().await?;
        let channel = SerenityChannelId::new(channel_id.parse().unwrap_or(0));

        let mut out = Vec::new();
        let mut before: Option<SerenityMessageId> = None;
        loop {
            let mut builder = GetMessages::new().limit(100);
            if let Some(before_id) = before {
                builder = builder.before(before_id);
            }
            let batch = channel
                .messages(&http, builder)
                .await
                .map_err(|e| crate::error::LlmError::Other(anyhow::anyhow!("discord backfill failed: {e}")))?;
            if batch.is_empty() {
                break;
            }
            before = batch.last().map(|m| m.id);
            let oldest_ts = batch.last().map(|m| m.timestamp.unix_timestamp() * 1000).unwrap_or(i64::MAX);
            out.extend(batch.iter().map(serenity_to_core));
            if oldest_ts < since || out.len() > 10_000 {
                break;
            }
        }
        out.retain(|m| m.timestamp >= since);
        Ok(out)
    }
}

fn serenity_to_core(message: &SerenityMessage) -> CoreMessage {
    CoreMessage {
        message_id: message.id.to_string().into(),
        channel_id: message.channel_id.to_string().into(),
        server_id: message.guild_id.map(|g| g.to_string()).unwrap_or_default().into(),
        author_id: message.author.id.to_string().into(),
        author_display_name: message
            .member
            .as_ref()
            .and_then(|m| m.nick.clone())
            .unwrap_or_else(|| message.author.name.clone()),
        text: message.content.clone(),
        timestamp: message.timestamp.unix_timestamp() * 1000,
        is_bot: message.author.bot,
        reply_to_message_id: message
            .referenced_message
            .as_ref()
            .map(|m| m.id.to_string().into()),
        attachments: message
            .attachments
            .iter()
            .map(|a| Attachment {
                url: a.url.clone(),
                filename: a.filename.clone(),
                content_type: a.content_type.clone().unwrap_or_default(),
                byte_size: Some(a.size as u64),
            })
            .collect(),
        reactions: message
            .reactions
            .iter()
            .map(|r| Reaction {
                emoji: r.reaction_type.to_string(),
                count: r.count as u32,
            })
            .collect(),
    }
}

/// Forwards gateway events onto the channel `connect` returned, translating
/// `serenity` types to this crate's domain types at the boundary.
struct Handler {
    tx: mpsc::Sender<InboundEvent>,
    shared: Arc<RwLock<Shared>>,
}

#[async_trait]
impl EventHandler for Handler {
    async fn ready(&self, ctx: Context, ready: Ready) {
        let mut shared = self.shared.write().await;
        shared.http = Some(ctx.http.clone());
        shared.bot_user_id = ready.user.id.to_string();
        tracing::info!(bot_user_id = %ready.user.id, "discord gateway ready");
    }

    async fn message(&self, _ctx: Context, message: SerenityMessage) {
        let _ = self.tx.send(InboundEvent::Created(serenity_to_core(&message))).await;
    }

    async fn message_update(
        &self,
        ctx: Context,
        _old: Option<SerenityMessage>,
        _new: Option<SerenityMessage>,
        event: MessageUpdateEvent,
    ) {
        if let Ok(message) = ctx.http.get_message(event.channel_id, event.id).await {
            let _ = self.tx.send(InboundEvent::Edited(serenity_to_core(&message))).await;
        }
    }

    async fn message_delete(
        &self,
        _ctx: Context,
        channel_id: SerenityChannelId,
        deleted_message_id: SerenityMessageId,
        _guild_id: Option<serenity::all::GuildId>,
    ) {
        let _ = self
            .tx
            .send(InboundEvent::Deleted {
                channel_id: channel_id.to_string().into(),
                message_id: deleted_message_id.to_string().into(),
            })
            .await;
    }

    async fn reaction_add(&self, _ctx: Context, reaction: SerenityReaction) {
        let _ = self
            .tx
            .send(InboundEvent::Reaction(ReactionEvent {
                channel_id: reaction.channel_id.to_string().into(),
                message_id: reaction.message_id.to_string().into(),
                emoji: reaction.emoji.to_string(),
                added: true,
            }))
            .await;
    }

    async fn reaction_remove(&self, _ctx: Context, reaction: SerenityReaction) {
        let _ = self
            .tx
            .send(InboundEvent::Reaction(ReactionEvent {
                channel_id: reaction.channel_id.to_string().into(),
                message_id: reaction.message_id.to_string().into(),
                emoji: reaction.emoji.to_string(),
                added: false,
            }))
            .await;
    }
}
