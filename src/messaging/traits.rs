//! `PlatformClient`: the interface the engines use to talk to the chat
//! platform, and the inbound event shapes they're fed. Grounded in the
//! teacher's `Messaging` trait (`messaging/traits.rs`) — static trait plus a
//! `Dyn` companion for storing the adapter behind `Arc<dyn ...>` — narrowed
//! to the connect/send/fetch/reaction-subscribe surface §6 names.

use crate::model::Message;
use crate::{ChannelId, MessageId};
use async_trait::async_trait;
use std::pin::Pin;
use tokio_stream::Stream;

/// One platform event delivered to the reader task.
#[derive(Debug, Clone)]
pub enum InboundEvent {
    Created(Message),
    Edited(Message),
    Deleted { channel_id: ChannelId, message_id: MessageId },
    Reaction(ReactionEvent),
}

/// A reaction add/remove observed on a message, used by the engagement
/// tracker's push path.
#[derive(Debug, Clone)]
pub struct ReactionEvent {
    pub channel_id: ChannelId,
    pub message_id: MessageId,
    pub emoji: String,
    pub added: bool,
}

/// A message the engine wants to send.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub channel_id: ChannelId,
    pub text: String,
    pub reply_to_message_id: Option<MessageId>,
}

pub type InboundStream = Pin<Box<dyn Stream<Item = InboundEvent> + Send>>;

/// The chat platform boundary. One concrete implementation
/// (`discord::DiscordClient`) ships with this crate; anything else (Slack,
/// a test double) implements the same trait.
#[async_trait]
pub trait PlatformClient: Send + Sync + 'static {
    /// Connects the gateway and returns a stream of inbound events. Called
    /// once at startup.
    async fn connect(&self) -> crate::error::Result<InboundStream>;

    /// Sends `message`, returning the platform-assigned message id.
    async fn send(&self, message: OutboundMessage) -> crate::error::Result<Message>;

    /// Shows (or refreshes) a typing indicator in `channel_id` for roughly
    /// `duration`. Best-effort; failures are not surfaced.
    async fn start_typing(&self, channel_id: &ChannelId);

    /// Fetches up to `span` messages on either side of `message_id`,
    /// chronological, bounded by the per-fetch timeout (§5, default 5s).
    /// Used by the engagement tracker to inspect replies/reactions and by
    /// context assembly to resolve reply chains the local store missed.
    async fn fetch_around(&self, channel_id: &ChannelId, message_id: &MessageId, span: i64) -> crate::error::Result<Vec<Message>>;

    /// The bot's own platform user id, resolved once at connect. Empty
    /// until `connect` has completed the gateway handshake.
    async fn bot_user_id(&self) -> String;

    /// Bulk-fetches recent history for backfill on connect.
    async fn backfill(&self, channel_id: &ChannelId, since: crate::MillisUtc) -> crate::error::Result<Vec<Message>>;
}
