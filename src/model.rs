//! Domain types shared across the store, context, rate-limiting, and engine
//! modules: messages, attachments, reactions, channel momentum, the user
//! cache, follow-ups, and per-channel engagement stats.

use crate::{ChannelId, MessageId, MillisUtc, ServerId, UserId};
use serde::{Deserialize, Serialize};

/// A single platform message, as stored in `MessageStore`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub message_id: MessageId,
    pub channel_id: ChannelId,
    pub server_id: ServerId,
    pub author_id: UserId,
    pub author_display_name: String,
    pub text: String,
    pub timestamp: MillisUtc,
    pub is_bot: bool,
    pub reply_to_message_id: Option<MessageId>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub reactions: Vec<Reaction>,
}

/// A file attachment on a message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Attachment {
    pub url: String,
    pub filename: String,
    pub content_type: String,
    pub byte_size: Option<u64>,
}

/// An aggregated reaction (one emoji, with its count).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Reaction {
    pub emoji: String,
    pub count: u32,
}

/// A reference to a message without its text, returned by `MessageStore::Search`.
/// The two-step contract (reference first, fetch text separately) bounds
/// token usage for downstream LLM calls.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageRef {
    pub message_id: MessageId,
    pub channel_id: ChannelId,
    pub author_id: UserId,
    pub author_display_name: String,
    pub timestamp: MillisUtc,
}

/// Search options for `MessageStore::Search`.
#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    pub query: String,
    pub channel_id: Option<ChannelId>,
    pub server_id: Option<ServerId>,
    pub author_id: Option<UserId>,
    pub since: Option<MillisUtc>,
    pub until: Option<MillisUtc>,
    pub limit: usize,
}

/// A chat channel. Not persisted as a row — momentum and other derived
/// fields are recomputed on demand from `MessageStore` contents.
#[derive(Debug, Clone)]
pub struct Channel {
    pub channel_id: ChannelId,
    pub server_id: ServerId,
    pub name: String,
    pub is_text: bool,
    pub last_activity: Option<MillisUtc>,
}

/// Conversational pace classification, used to modulate response probability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Momentum {
    Hot,
    Warm,
    Cold,
}

/// A cached user display name, refreshed on every ingest and used to resolve
/// raw platform mentions to readable names.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserCacheEntry {
    pub user_id: UserId,
    pub username: String,
    pub display_name: String,
    pub last_seen: MillisUtc,
}

/// Priority of a follow-up reminder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    #[default]
    Low,
    Medium,
    High,
}

/// Status of a follow-up reminder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FollowupStatus {
    Pending,
    Completed,
}

/// A persisted intent to check back with a user about a specific event at or
/// after a future time. Lives in `followups.json` alongside its siblings;
/// the `dispatched` state from the conceptual lifecycle is transient and
/// never serialized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Followup {
    pub id: String,
    pub user_id: UserId,
    pub user_name: String,
    pub channel_id: ChannelId,
    pub event: String,
    pub context: String,
    pub mentioned_date: chrono::DateTime<chrono::Utc>,
    pub follow_up_after: chrono::DateTime<chrono::Utc>,
    pub priority: Priority,
    pub status: FollowupStatus,
    #[serde(default)]
    pub completed_date: Option<chrono::DateTime<chrono::Utc>>,
}

/// The full contents of a bot's per-server `followups.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FollowupFile {
    #[serde(default)]
    pub pending: Vec<Followup>,
    #[serde(default)]
    pub completed: Vec<Followup>,
}

/// Rolling success-rate counters for a channel's proactive engagement
/// attempts, persisted at `<channel>_stats.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelStats {
    #[serde(default)]
    pub total_attempts: u64,
    #[serde(default)]
    pub successful_attempts: u64,
    pub last_updated: chrono::DateTime<chrono::Utc>,
}

impl Default for ChannelStats {
    fn default() -> Self {
        Self {
            total_attempts: 0,
            successful_attempts: 0,
            last_updated: chrono::Utc::now(),
        }
    }
}

impl ChannelStats {
    /// Success rate, defaulting to 0.5 (neutral) when there is no history.
    pub fn success_rate(&self) -> f64 {
        if self.total_attempts == 0 {
            0.5
        } else {
            self.successful_attempts as f64 / self.total_attempts as f64
        }
    }
}

/// Delivery mode for a proactive engagement decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Send immediately as a new message.
    Standalone,
    /// Send as a reply to the most recent eligible message.
    Woven,
    /// Skip this tick, re-evaluate next tick.
    Deferred,
}

/// A reason a response was withheld, surfaced in logs and `Stats`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SilencedReason {
    RateLimitShort,
    RateLimitLong,
    IgnoredThreshold,
}

impl SilencedReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SilencedReason::RateLimitShort => "rate_limit_short",
            SilencedReason::RateLimitLong => "rate_limit_long",
            SilencedReason::IgnoredThreshold => "ignored_threshold",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_stats_defaults_to_neutral_success_rate() {
        let stats = ChannelStats::default();
        assert_eq!(stats.success_rate(), 0.5);
    }

    #[test]
    fn channel_stats_computes_rate_once_attempted() {
        let stats = ChannelStats {
            total_attempts: 4,
            successful_attempts: 1,
            last_updated: chrono::Utc::now(),
        };
        assert_eq!(stats.success_rate(), 0.25);
    }

    #[test]
    fn priority_orders_low_to_high() {
        assert!(Priority::Low < Priority::Medium);
        assert!(Priority::Medium < Priority::High);
    }
}
