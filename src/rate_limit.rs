//! Per-channel rate limiting and engagement tracking.
//!
//! Two sliding windows (short/long), an ignore counter, and a delayed
//! engagement-check queue. Grounded in the `map<channel_id, mutex>` lazy
//! allocation idiom the teacher's `Scheduler` uses for `heartbeats`
//! (`heartbeat/scheduler.rs`), adapted to a `RwLock<HashMap<...>>` of
//! `RateState` rather than timer handles. The engagement queue follows §9's
//! "model as a priority queue keyed by deadline, single worker drains it"
//! re-architecture note.

use crate::config::RateLimitingConfig;
use crate::error::RateLimitedError;
use crate::{ChannelId, MessageId, MillisUtc, UserId};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use tokio::sync::RwLock;

/// In-memory per-channel rate-limiting state.
#[derive(Debug, Default)]
struct RateState {
    short_window: VecDeque<MillisUtc>,
    long_window: VecDeque<MillisUtc>,
    ignore_count: u32,
}

/// A scheduled engagement check: inspect the outgoing message at `deadline`
/// and decide engaged vs. ignored. `triggering_user_id` is the user the
/// response addressed, so "loose engagement" can require the later message
/// be authored by that same user rather than counting any later message.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingCheck {
    deadline: MillisUtc,
    channel_id: ChannelId,
    message_id: MessageId,
    triggering_user_id: UserId,
}

/// Current counts and silenced state for a channel, as returned by `stats`.
#[derive(Debug, Clone)]
pub struct RateStats {
    pub short_count: usize,
    pub long_count: usize,
    pub ignore_count: u32,
    pub silenced_reason: Option<RateLimitedError>,
}

pub struct RateLimiter {
    config: RateLimitingConfig,
    states: RwLock<HashMap<ChannelId, RateState>>,
    pending: RwLock<BinaryHeap<Reverse<(MillisUtc, u64)>>>,
    pending_lookup: RwLock<HashMap<u64, PendingCheck>>,
    next_token: std::sync::atomic::AtomicU64,
}

impl RateLimiter {
    pub fn new(config: RateLimitingConfig) -> Self {
        Self {
            config,
            states: RwLock::new(HashMap::new()),
            pending: RwLock::new(BinaryHeap::new()),
            pending_lookup: RwLock::new(HashMap::new()),
            next_token: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Trims both windows to `now`, then checks short cap, long cap, and the
    /// ignore threshold in that order.
    pub async fn can_respond(&self, channel_id: &ChannelId, now: MillisUtc) -> Result<(), RateLimitedError> {
        let mut states = self.states.write().await;
        let state = states.entry(channel_id.clone()).or_default();
        trim(&mut state.short_window, now, self.config.short.duration_minutes);
        trim(&mut state.long_window, now, self.config.long.duration_minutes);

        if state.short_window.len() as u32 >= self.config.short.max_responses {
            return Err(RateLimitedError::Short);
        }
        if state.long_window.len() as u32 >= self.config.long.max_responses {
            return Err(RateLimitedError::Long);
        }
        if state.ignore_count >= self.config.ignore_threshold {
            return Err(RateLimitedError::IgnoredThreshold);
        }
        Ok(())
    }

    /// Appends `now` to both windows and schedules an engagement check at
    /// `now + engagement_tracking_delay`. `triggering_user_id` is the author
    /// of the message this response addressed.
    pub async fn record_response(&self, channel_id: &ChannelId, message_id: &MessageId, triggering_user_id: &UserId, now: MillisUtc) {
        {
            let mut states = self.states.write().await;
            let state = states.entry(channel_id.clone()).or_default();
            state.short_window.push_back(now);
            state.long_window.push_back(now);
        }

        let deadline = now + self.config.engagement_tracking_delay as i64 * 1000;
        let token = self.next_token.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.pending.write().await.push(Reverse((deadline, token)));
        self.pending_lookup.write().await.insert(
            token,
            PendingCheck {
                deadline,
                channel_id: channel_id.clone(),
                message_id: message_id.clone(),
                triggering_user_id: triggering_user_id.clone(),
            },
        );
    }

    /// `ignore_count ← max(0, ignore_count − 1)`.
    pub async fn record_engagement(&self, channel_id: &ChannelId) {
        let mut states = self.states.write().await;
        let state = states.entry(channel_id.clone()).or_default();
        state.ignore_count = state.ignore_count.saturating_sub(1);
    }

    /// `ignore_count ← ignore_count + 1`.
    pub async fn record_ignored(&self, channel_id: &ChannelId) {
        let mut states = self.states.write().await;
        let state = states.entry(channel_id.clone()).or_default();
        state.ignore_count += 1;
    }

    pub async fn stats(&self, channel_id: &ChannelId, now: MillisUtc) -> RateStats {
        let silenced_reason = self.can_respond(channel_id, now).await.err();
        let states = self.states.read().await;
        let state = states.get(channel_id);
        RateStats {
            short_count: state.map(|s| s.short_window.len()).unwrap_or(0),
            long_count: state.map(|s| s.long_window.len()).unwrap_or(0),
            ignore_count: state.map(|s| s.ignore_count).unwrap_or(0),
            silenced_reason,
        }
    }

    /// Pops every check whose deadline has elapsed as of `now`, removing
    /// them from the queue. The caller performs the post-hoc inspection
    /// (reaction present, reply present, or "loose engagement" from the
    /// addressed user) and calls `record_engagement`/`record_ignored`.
    pub async fn due_checks(&self, now: MillisUtc) -> Vec<(ChannelId, MessageId, UserId)> {
        let mut pending = self.pending.write().await;
        let mut lookup = self.pending_lookup.write().await;
        let mut due = Vec::new();

        while let Some(Reverse((deadline, token))) = pending.peek().copied() {
            if deadline > now {
                break;
            }
            pending.pop();
            if let Some(check) = lookup.remove(&token) {
                due.push((check.channel_id, check.message_id, check.triggering_user_id));
            }
        }
        due
    }

    /// Whether `message_id` in `channel_id` is a bot-sent message still
    /// awaiting its engagement check — the gate `on_reaction` uses so a
    /// reaction on an unrelated message doesn't count as engagement.
    pub async fn has_pending_check(&self, channel_id: &ChannelId, message_id: &MessageId) -> bool {
        self.pending_lookup
            .read()
            .await
            .values()
            .any(|check| &check.channel_id == channel_id && &check.message_id == message_id)
    }

    /// Drops all scheduled engagement deadlines, best-effort, for shutdown.
    pub async fn cancel_all(&self) {
        self.pending.write().await.clear();
        self.pending_lookup.write().await.clear();
    }
}

/// Drops entries older than `window_minutes` from the front of a
/// monotonically-appended deque.
fn trim(window: &mut VecDeque<MillisUtc>, now: MillisUtc, window_minutes: u32) {
    let cutoff = now - window_minutes as i64 * 60_000;
    while window.front().is_some_and(|&ts| ts < cutoff) {
        window.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateWindowConfig;

    fn config() -> RateLimitingConfig {
        RateLimitingConfig {
            short: RateWindowConfig { duration_minutes: 5, max_responses: 2 },
            long: RateWindowConfig { duration_minutes: 60, max_responses: 200 },
            ignore_threshold: 5,
            engagement_tracking_delay: 30,
        }
    }

    #[tokio::test]
    async fn short_window_trips_after_cap_hit() {
        let limiter = RateLimiter::new(config());
        let channel: ChannelId = "c1".into();

        limiter.can_respond(&channel, 0).await.unwrap();
        limiter.record_response(&channel, &"m1".into(), &"u1".into(), 0).await;
        limiter.can_respond(&channel, 1000).await.unwrap();
        limiter.record_response(&channel, &"m2".into(), &"u1".into(), 1000).await;

        let err = limiter.can_respond(&channel, 2000).await.unwrap_err();
        assert_eq!(err, RateLimitedError::Short);
    }

    #[tokio::test]
    async fn window_trimming_is_monotonic() {
        let limiter = RateLimiter::new(config());
        let channel: ChannelId = "c1".into();
        limiter.record_response(&channel, &"m1".into(), &"u1".into(), 0).await;
        limiter.record_response(&channel, &"m2".into(), &"u1".into(), 1000).await;

        // Past the 5-minute window: both entries should be trimmed, freeing capacity.
        limiter.can_respond(&channel, 6 * 60_000).await.unwrap();
    }

    #[tokio::test]
    async fn ignore_threshold_silences_channel() {
        let limiter = RateLimiter::new(config());
        let channel: ChannelId = "c1".into();
        for _ in 0..5 {
            limiter.record_ignored(&channel).await;
        }
        let err = limiter.can_respond(&channel, 0).await.unwrap_err();
        assert_eq!(err, RateLimitedError::IgnoredThreshold);
    }

    #[tokio::test]
    async fn engagement_decrements_ignore_count() {
        let limiter = RateLimiter::new(config());
        let channel: ChannelId = "c1".into();
        limiter.record_ignored(&channel).await;
        limiter.record_ignored(&channel).await;
        limiter.record_engagement(&channel).await;

        let stats = limiter.stats(&channel, 0).await;
        assert_eq!(stats.ignore_count, 1);
    }

    #[tokio::test]
    async fn due_checks_returns_only_elapsed_deadlines() {
        let limiter = RateLimiter::new(config());
        let channel: ChannelId = "c1".into();
        limiter.record_response(&channel, &"m1".into(), &"u1".into(), 0).await;

        assert!(limiter.due_checks(10_000).await.is_empty());
        let due = limiter.due_checks(30_000).await;
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].1.as_ref(), "m1");
        assert_eq!(due[0].2.as_ref(), "u1");
        // Already drained; a second call at the same time finds nothing left.
        assert!(limiter.due_checks(30_000).await.is_empty());
    }

    #[tokio::test]
    async fn has_pending_check_is_true_only_for_a_message_awaiting_its_check() {
        let limiter = RateLimiter::new(config());
        let channel: ChannelId = "c1".into();
        limiter.record_response(&channel, &"m1".into(), &"u1".into(), 0).await;

        assert!(limiter.has_pending_check(&channel, &"m1".into()).await);
        assert!(!limiter.has_pending_check(&channel, &"unrelated".into()).await);

        limiter.due_checks(30_000).await;
        assert!(!limiter.has_pending_check(&channel, &"m1".into()).await);
    }
}
