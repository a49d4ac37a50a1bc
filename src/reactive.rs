//! `ReactiveEngine` (§4.6): the urgent @mention path and the periodic
//! per-channel scan, both funnelling into a shared `Respond` that builds
//! context, drives the tool-use loop, and sends the reply. Grounded in the
//! teacher's per-channel exclusive-lock idiom (lazily-allocated
//! `HashMap<ChannelId, Arc<Mutex<()>>>` behind a `RwLock`, the same shape the
//! teacher used for per-heartbeat scheduling) and its "ingest then decide"
//! event loop shape.

use crate::config::Config;
use crate::context::ContextBuilder;
use crate::conversation_log::ConversationLog;
use crate::llm::{ContentBlock, LlmClient, LlmMessage, LlmRequest, Role};
use crate::messaging::{InboundEvent, OutboundMessage, PlatformClient, ReactionEvent};
use crate::model::{Attachment, Message, Momentum, UserCacheEntry};
use crate::rate_limit::RateLimiter;
use crate::store::MessageStore;
use crate::tools::ToolRouter;
use crate::{now_millis, ChannelId, MessageId, MillisUtc, UserId};
use base64::Engine as _;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock, Semaphore};
use tokio::task::JoinSet;

/// Attachments are downloaded at most this many at a time per turn (§5's
/// suspension-point note), independent of the channel's exclusive lock.
const MAX_CONCURRENT_IMAGE_DOWNLOADS: usize = 2;

/// Bound on the response dedup set; prevents the urgent and scan paths from
/// both answering the same message under rapid bursts.
const DEDUP_CAPACITY: usize = 256;
const MAX_SEGMENT_CHARS: usize = 2000;

/// Consecutive provider failures in a channel's scan path before that
/// channel's scan cadence backs off, mirroring a `record_failure`/
/// `CircuitBroken` scheduler guard: a channel whose LLM calls keep erroring
/// shouldn't be retried every tick.
const CIRCUIT_FAILURE_THRESHOLD: u32 = 5;
/// Base backoff once the circuit opens; doubles per additional failure,
/// capped at `CIRCUIT_MAX_BACKOFF_SECS`.
const CIRCUIT_BASE_BACKOFF_SECS: i64 = 60;
const CIRCUIT_MAX_BACKOFF_SECS: i64 = 1800;

pub struct ReactiveEngine {
    config: Arc<Config>,
    store: Arc<MessageStore>,
    rate_limiter: Arc<RateLimiter>,
    tool_router: Arc<ToolRouter>,
    llm_client: Arc<dyn LlmClient>,
    platform: Arc<dyn PlatformClient>,
    conversation_log: Arc<ConversationLog>,

    user_names: RwLock<HashMap<UserId, String>>,
    channel_locks: RwLock<HashMap<ChannelId, Arc<Mutex<()>>>>,
    dedup: Mutex<VecDeque<MessageId>>,
    dedup_set: Mutex<HashSet<MessageId>>,
    /// Last activity timestamp observed per channel, used by the scan path
    /// to skip channels that haven't advanced since the previous tick.
    last_activity: RwLock<HashMap<ChannelId, MillisUtc>>,
    last_scanned: RwLock<HashMap<ChannelId, MillisUtc>>,
    /// Consecutive `decide()` failures per channel, reset on success.
    consecutive_failures: RwLock<HashMap<ChannelId, u32>>,
    /// Channels currently backed off, mapped to the deadline their circuit reopens.
    circuit_open_until: RwLock<HashMap<ChannelId, MillisUtc>>,
}

impl ReactiveEngine {
    pub fn new(
        config: Arc<Config>,
        store: Arc<MessageStore>,
        rate_limiter: Arc<RateLimiter>,
        tool_router: Arc<ToolRouter>,
        llm_client: Arc<dyn LlmClient>,
        platform: Arc<dyn PlatformClient>,
        conversation_log: Arc<ConversationLog>,
    ) -> Self {
        Self {
            config,
            store,
            rate_limiter,
            tool_router,
            llm_client,
            platform,
            conversation_log,
            user_names: RwLock::new(HashMap::new()),
            channel_locks: RwLock::new(HashMap::new()),
            dedup: Mutex::new(VecDeque::with_capacity(DEDUP_CAPACITY)),
            dedup_set: Mutex::new(HashSet::new()),
            last_activity: RwLock::new(HashMap::new()),
            last_scanned: RwLock::new(HashMap::new()),
            consecutive_failures: RwLock::new(HashMap::new()),
            circuit_open_until: RwLock::new(HashMap::new()),
        }
    }

    /// Whether `channel_id`'s circuit is currently open (backed off).
    async fn circuit_is_open(&self, channel_id: &ChannelId) -> bool {
        match self.circuit_open_until.read().await.get(channel_id) {
            Some(deadline) => now_millis() < *deadline,
            None => false,
        }
    }

    /// Records a `decide()` failure, opening the circuit once
    /// `CIRCUIT_FAILURE_THRESHOLD` consecutive failures accrue.
    async fn record_scan_failure(&self, channel_id: &ChannelId) {
        let mut failures = self.consecutive_failures.write().await;
        let count = failures.entry(channel_id.clone()).or_insert(0);
        *count += 1;
        if *count >= CIRCUIT_FAILURE_THRESHOLD {
            let backoff = (CIRCUIT_BASE_BACKOFF_SECS * 2i64.pow(*count - CIRCUIT_FAILURE_THRESHOLD)).min(CIRCUIT_MAX_BACKOFF_SECS);
            self.circuit_open_until.write().await.insert(channel_id.clone(), now_millis() + backoff * 1000);
            tracing::warn!(%channel_id, failures = *count, backoff_secs = backoff, "scan path circuit opened");
        }
    }

    /// Clears failure tracking for `channel_id` after a successful `decide()`.
    async fn record_scan_success(&self, channel_id: &ChannelId) {
        self.consecutive_failures.write().await.remove(channel_id);
        self.circuit_open_until.write().await.remove(channel_id);
    }

    async fn channel_lock(&self, channel_id: &ChannelId) -> Arc<Mutex<()>> {
        if let Some(lock) = self.channel_locks.read().await.get(channel_id) {
            return lock.clone();
        }
        let mut locks = self.channel_locks.write().await;
        locks.entry(channel_id.clone()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    async fn remember_user(&self, user_id: &UserId, display_name: &str) {
        let mut names = self.user_names.write().await;
        names.insert(user_id.clone(), display_name.to_string());
    }

    async fn user_names_snapshot(&self) -> HashMap<String, String> {
        self.user_names.read().await.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    async fn already_handled(&self, message_id: &MessageId) -> bool {
        self.dedup_set.lock().await.contains(message_id)
    }

    async fn mark_handled(&self, message_id: &MessageId) {
        let mut set = self.dedup_set.lock().await;
        if !set.insert(message_id.clone()) {
            return;
        }
        let mut queue = self.dedup.lock().await;
        queue.push_back(message_id.clone());
        if queue.len() > DEDUP_CAPACITY {
            if let Some(evicted) = queue.pop_front() {
                set.remove(&evicted);
            }
        }
    }

    /// Handles one inbound platform event: stores it, refreshes caches, and
    /// — for the urgent path — responds immediately when the bot is
    /// mentioned or replied to.
    pub async fn ingest(&self, event: InboundEvent) -> crate::error::Result<()> {
        match event {
            InboundEvent::Created(message) | InboundEvent::Edited(message) => {
                self.remember_user(&message.author_id, &message.author_display_name).await;
                self.last_activity.write().await.insert(message.channel_id.clone(), message.timestamp);

                if message.is_bot {
                    self.store.put(&message).await?;
                    return Ok(());
                }
                self.store.put(&message).await?;

                if self.is_urgent(&message).await? {
                    self.respond_urgent(message).await;
                }
            }
            InboundEvent::Deleted { message_id, .. } => {
                self.store.delete(&message_id).await?;
            }
            InboundEvent::Reaction(reaction) => {
                self.on_reaction(reaction).await;
            }
        }
        Ok(())
    }

    async fn is_urgent(&self, message: &Message) -> crate::error::Result<bool> {
        let bot_user_id = self.platform.bot_user_id().await;
        if bot_user_id.is_empty() {
            return Ok(false);
        }
        if message.text.contains(&format!("<@{bot_user_id}>")) {
            return Ok(true);
        }
        if let Some(reply_to) = &message.reply_to_message_id {
            let around = self.store.get_around(reply_to, 0).await?;
            if let Some(parent) = around.into_iter().find(|m| &m.message_id == reply_to) {
                return Ok(parent.is_bot);
            }
        }
        Ok(false)
    }

    async fn respond_urgent(&self, message: Message) {
        if self.already_handled(&message.message_id).await {
            return;
        }
        if !roll(self.config.personality.engagement.mention_rate) {
            tracing::debug!(channel_id = %message.channel_id, "mention below configured mention_rate, skipping");
            return;
        }
        let mut exclude = HashSet::new();
        exclude.insert(message.message_id.clone());
        if let Err(error) = self.respond(&message, exclude, "mention").await {
            tracing::warn!(%error, channel_id = %message.channel_id, "reactive respond failed");
        }
    }

    /// Loose-engagement push path: an immediate reaction marks the message
    /// engaged without waiting for the delayed check — but only when the
    /// reacted-to message is one of the bot's own outgoing messages with an
    /// outstanding engagement check, not any reaction on any message.
    async fn on_reaction(&self, reaction: ReactionEvent) {
        if !reaction.added {
            return;
        }
        if self.rate_limiter.has_pending_check(&reaction.channel_id, &reaction.message_id).await {
            self.rate_limiter.record_engagement(&reaction.channel_id).await;
        }
    }

    /// Background ticker driving the scan path, at `reactive.check_interval_seconds`.
    pub async fn run_scan_loop(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(self.config.reactive.check_interval_seconds));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(error) = self.scan_tick().await {
                        tracing::warn!(%error, "reactive scan tick failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn scan_tick(&self) -> crate::error::Result<()> {
        let advanced: Vec<ChannelId> = {
            let activity = self.last_activity.read().await;
            let mut scanned = self.last_scanned.write().await;
            activity
                .iter()
                .filter(|(channel, ts)| scanned.get(*channel).map(|s| s < *ts).unwrap_or(true))
                .map(|(channel, ts)| {
                    scanned.insert((*channel).clone(), **ts);
                    channel.clone()
                })
                .collect()
        };

        for channel_id in advanced {
            if self.in_quiet_hours() {
                continue;
            }
            if self.circuit_is_open(&channel_id).await {
                tracing::debug!(%channel_id, "scan path circuit open, skipping");
                continue;
            }
            match self.decide(&channel_id).await {
                Ok(should_respond) => {
                    self.record_scan_success(&channel_id).await;
                    if !should_respond {
                        continue;
                    }
                    let recent = self.store.get_recent(&channel_id, 1).await?;
                    if let Some(latest) = recent.into_iter().next() {
                        if !self.already_handled(&latest.message_id).await {
                            if let Err(error) = self.respond(&latest, HashSet::new(), "scan momentum").await {
                                tracing::warn!(%error, %channel_id, "scan-path respond failed");
                            }
                        }
                    }
                }
                Err(error) => {
                    tracing::warn!(%error, %channel_id, "decide failed");
                    self.record_scan_failure(&channel_id).await;
                }
            }
        }
        Ok(())
    }

    fn in_quiet_hours(&self) -> bool {
        use chrono::Timelike;
        let quiet = &self.config.agentic.proactive.quiet_hours;
        let hour = chrono::Local::now().hour();
        if quiet.start_hour == quiet.end_hour {
            return false;
        }
        if quiet.start_hour < quiet.end_hour {
            hour >= quiet.start_hour && hour < quiet.end_hour
        } else {
            hour >= quiet.start_hour || hour < quiet.end_hour
        }
    }

    /// Computes momentum from the last 20 messages' inter-arrival gaps and
    /// asks the LLM for a biased binary decision.
    async fn decide(&self, channel_id: &ChannelId) -> crate::error::Result<bool> {
        let recent = self.store.get_recent(channel_id, 20).await?;
        let momentum = compute_momentum(&recent);
        let rates = &self.config.personality.engagement;
        let rate = match momentum {
            Momentum::Hot => rates.hot_rate,
            Momentum::Warm => rates.warm_rate,
            Momentum::Cold => rates.cold_rate,
        };

        let Some(latest) = recent.first() else {
            return Ok(false);
        };

        let user_names = self.user_names_snapshot().await;
        let builder = ContextBuilder::new(&self.config, &self.store, &user_names);
        let context = builder.build(latest, &HashSet::new()).await?;

        let prompt = format!(
            "{}\n\nBased on the conversation above, would responding add value right now? \
             Answer with exactly one word: yes or no. Bias your answer so that you say yes \
             roughly {:.0}% of the time for a channel at this pace.",
            context.transcript,
            rate * 100.0
        );

        let request = LlmRequest {
            system: context.system,
            messages: vec![LlmMessage { role: Role::User, content: vec![ContentBlock::Text { text: prompt, citations: vec![] }] }],
            tools: vec![],
            max_tokens: 8,
            extended_thinking: false,
            thinking_budget_tokens: 0,
            enable_prompt_caching: true,
        };

        let response = self.llm_client.complete(request).await?;
        let answer: String = response
            .content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text, .. } => Some(text.to_lowercase()),
                _ => None,
            })
            .collect();

        Ok(answer.contains("yes"))
    }

    /// Downloads and compresses up to `images.max_per_message` image
    /// attachments via `ToolRouter::image_pipeline`, bounded to
    /// `MAX_CONCURRENT_IMAGE_DOWNLOADS` in flight at once. A failed download
    /// or an incompressible image is dropped (logged) rather than failing
    /// the whole turn — the reply still goes out with whatever attachments
    /// did compress.
    async fn process_attachments(&self, attachments: &[Attachment]) -> Vec<ContentBlock> {
        if !self.config.images.enabled {
            return Vec::new();
        }

        let candidates: Vec<Attachment> = attachments
            .iter()
            .filter(|a| a.content_type.starts_with("image/"))
            .take(self.config.images.max_per_message as usize)
            .cloned()
            .collect();
        if candidates.is_empty() {
            return Vec::new();
        }

        let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_IMAGE_DOWNLOADS));
        let mut tasks = JoinSet::new();
        for attachment in candidates {
            let pipeline = self.tool_router.image_pipeline.clone();
            let permit = semaphore.clone();
            tasks.spawn(async move {
                let _permit = permit.acquire_owned().await.ok()?;
                match pipeline.process(&attachment.url).await {
                    Ok(processed) => Some(ContentBlock::Image {
                        media_type: processed.media_type,
                        data_base64: base64::engine::general_purpose::STANDARD.encode(processed.bytes),
                    }),
                    Err(error) => {
                        tracing::warn!(%error, url = %attachment.url, "image pipeline failed, dropping attachment");
                        None
                    }
                }
            });
        }

        let mut blocks = Vec::new();
        while let Some(result) = tasks.join_next().await {
            if let Ok(Some(block)) = result {
                blocks.push(block);
            }
        }
        blocks
    }

    /// Runs one full response cycle under the channel's exclusive lock.
    /// `reason` documents why this turn was attempted (e.g. `"mention"` for
    /// the urgent path, `"scan momentum"` for the periodic scan) and is
    /// recorded verbatim in the conversation log's `[DECISION]` line.
    async fn respond(&self, message: &Message, exclude_message_ids: HashSet<MessageId>, reason: &str) -> crate::error::Result<()> {
        let lock = self.channel_lock(&message.channel_id).await;
        let _guard = lock.lock().await;

        let stats = self.rate_limiter.stats(&message.channel_id, now_millis()).await;
        if let Some(silenced) = stats.silenced_reason {
            self.conversation_log
                .record_decision(message, false, silenced.reason(), &stats, &self.config.rate_limiting)
                .await;
            tracing::info!(channel_id = %message.channel_id, reason = silenced.reason(), "response silenced");
            return Ok(());
        }
        self.conversation_log.record_decision(message, true, reason, &stats, &self.config.rate_limiting).await;

        let user_names = self.user_names_snapshot().await;
        let builder = ContextBuilder::new(&self.config, &self.store, &user_names);
        let context = builder.build(message, &exclude_message_ids).await?;

        let mut content = vec![ContentBlock::Text { text: context.transcript, citations: vec![] }];
        content.extend(self.process_attachments(&message.attachments).await);

        let request = LlmRequest {
            system: context.system,
            messages: vec![LlmMessage { role: Role::User, content }],
            tools: self.tool_router.definitions().await,
            max_tokens: self.config.api.max_tokens,
            extended_thinking: self.config.api.extended_thinking.enabled,
            thinking_budget_tokens: self.config.api.extended_thinking.budget_tokens,
            enable_prompt_caching: true,
        };

        let reply = self.tool_router.run_loop(self.llm_client.as_ref(), request).await?;
        if reply.trim().is_empty() {
            self.conversation_log.abandon(&message.message_id).await;
            self.mark_handled(&message.message_id).await;
            return Ok(());
        }

        let segments = split_into_segments(&reply, MAX_SEGMENT_CHARS);
        let mut reply_to = Some(message.message_id.clone());
        let mut first_segment_id: Option<MessageId> = None;

        for segment in segments {
            self.platform.start_typing(&message.channel_id).await;
            let sent = self
                .platform
                .send(OutboundMessage { channel_id: message.channel_id.clone(), text: segment, reply_to_message_id: reply_to.take() })
                .await?;
            self.store.put(&sent).await?;
            self.rate_limiter
                .record_response(&message.channel_id, &sent.message_id, &message.author_id, now_millis())
                .await;
            first_segment_id.get_or_insert_with(|| sent.message_id.clone());
        }

        if let Some(first_segment_id) = first_segment_id {
            self.conversation_log.record_outgoing(&message.message_id, &first_segment_id, reply.chars().count()).await;
        }

        self.mark_handled(&message.message_id).await;
        Ok(())
    }

    /// Drains elapsed engagement-check deadlines and attributes
    /// engagement/ignored based on what happened after the outgoing
    /// message: a reaction, a reply to it, or any later message from the
    /// addressed user ("loose engagement").
    pub async fn run_engagement_tracker(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(5));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let due = self.rate_limiter.due_checks(now_millis()).await;
                    for (channel_id, message_id, triggering_user_id) in due {
                        self.check_engagement(&channel_id, &message_id, &triggering_user_id).await;
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        self.rate_limiter.cancel_all().await;
                        break;
                    }
                }
            }
        }
    }

    async fn check_engagement(&self, channel_id: &ChannelId, message_id: &MessageId, triggering_user_id: &UserId) {
        let (engaged, method) = match self.platform.fetch_around(channel_id, message_id, 10).await {
            Ok(window) => {
                let sent = window.iter().find(|m| &m.message_id == message_id);
                let has_reaction = sent.map(|m| !m.reactions.is_empty()).unwrap_or(false);
                let replied = window.iter().any(|m| m.reply_to_message_id.as_ref() == Some(message_id));
                let sent_ts = sent.map(|s| s.timestamp).unwrap_or(i64::MAX);
                let followed = window
                    .iter()
                    .any(|m| m.timestamp > sent_ts && &m.author_id == triggering_user_id);

                if has_reaction {
                    (true, "reactions")
                } else if replied {
                    (true, "reply")
                } else if followed {
                    (true, "loose engagement")
                } else {
                    (false, "")
                }
            }
            Err(error) => {
                tracing::debug!(%error, %channel_id, "engagement fetch failed");
                (false, "")
            }
        };

        if engaged {
            self.rate_limiter.record_engagement(channel_id).await;
        } else {
            self.rate_limiter.record_ignored(channel_id).await;
        }
        self.conversation_log.record_engagement(message_id, engaged, method).await;
    }
}

/// Returns `true` with probability `probability`, short-circuiting the RNG
/// at the boundaries so `mention_rate = 1.0` (the default) always responds
/// and `0.0` never does.
fn roll(probability: f32) -> bool {
    if probability >= 1.0 {
        return true;
    }
    if probability <= 0.0 {
        return false;
    }
    rand::random::<f32>() < probability
}

/// HOT if the average inter-arrival gap over the last 20 messages is under
/// 15 minutes, WARM under 60 minutes, else COLD. `recent` may be given in
/// either chronological order, since only the magnitude of each gap matters.
fn compute_momentum(recent: &[Message]) -> Momentum {
    if recent.len() < 2 {
        return Momentum::Cold;
    }
    let mut gaps = Vec::with_capacity(recent.len() - 1);
    for pair in recent.windows(2) {
        gaps.push((pair[1].timestamp - pair[0].timestamp).abs());
    }
    let average_ms = gaps.iter().sum::<i64>() as f64 / gaps.len() as f64;
    let average_minutes = average_ms / 60_000.0;

    if average_minutes < 15.0 {
        Momentum::Hot
    } else if average_minutes < 60.0 {
        Momentum::Warm
    } else {
        Momentum::Cold
    }
}

/// Splits `text` into chunks of at most `max_chars`, preferring to break at
/// sentence boundaries (`. `, `! `, `? `, or a newline) rather than mid-word.
fn split_into_segments(text: &str, max_chars: usize) -> Vec<String> {
    if text.len() <= max_chars {
        return vec![text.to_string()];
    }

    let mut segments = Vec::new();
    let mut remaining = text;

    while remaining.len() > max_chars {
        let window = &remaining[..max_chars];
        let split_at = window
            .rfind(". ")
            .or_else(|| window.rfind("! "))
            .or_else(|| window.rfind("? "))
            .or_else(|| window.rfind('\n'))
            .map(|i| i + 1)
            .unwrap_or(max_chars);

        let (head, tail) = remaining.split_at(split_at);
        segments.push(head.trim().to_string());
        remaining = tail.trim_start();
    }
    if !remaining.is_empty() {
        segments.push(remaining.to_string());
    }
    segments
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(id: &str, ts: i64) -> Message {
        Message {
            message_id: id.into(),
            channel_id: "c1".into(),
            server_id: "s1".into(),
            author_id: "u1".into(),
            author_display_name: "Alice".into(),
            text: "hi".into(),
            timestamp: ts,
            is_bot: false,
            reply_to_message_id: None,
            attachments: vec![],
            reactions: vec![],
        }
    }

    #[test]
    fn momentum_is_hot_for_rapid_messages() {
        let messages: Vec<Message> = (0..5).map(|i| msg(&i.to_string(), i * 60_000)).collect();
        assert_eq!(compute_momentum(&messages), Momentum::Hot);
    }

    #[test]
    fn momentum_is_cold_for_sparse_messages() {
        let messages = vec![msg("a", 0), msg("b", 3 * 60 * 60_000)];
        assert_eq!(compute_momentum(&messages), Momentum::Cold);
    }

    #[test]
    fn momentum_defaults_cold_with_insufficient_history() {
        assert_eq!(compute_momentum(&[]), Momentum::Cold);
        assert_eq!(compute_momentum(&[msg("a", 0)]), Momentum::Cold);
    }

    #[test]
    fn split_into_segments_respects_char_cap() {
        let text = "a".repeat(50) + ". " + &"b".repeat(50);
        let segments = split_into_segments(&text, 60);
        assert!(segments.iter().all(|s| s.len() <= 60));
        assert_eq!(segments.len(), 2);
    }

    #[test]
    fn split_into_segments_is_noop_under_the_cap() {
        let segments = split_into_segments("short text", 2000);
        assert_eq!(segments, vec!["short text".to_string()]);
    }

    #[test]
    fn roll_is_deterministic_at_the_probability_boundaries() {
        assert!(roll(1.0));
        assert!(!roll(0.0));
    }
}
