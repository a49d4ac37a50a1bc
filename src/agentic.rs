//! `AgenticEngine` (§4.7): the hourly background loop that dispatches due
//! follow-ups, selects proactive engagements in idle channels, and performs
//! maintenance (pruning, counter persistence). Grounded in the same
//! `tokio::time::interval` ticker idiom `ReactiveEngine` uses for its scan
//! loop (itself drawn from the teacher's `Scheduler::start_timer` in
//! `heartbeat/scheduler.rs`), with per-server `FollowupStore`/`StatsStore`
//! instances lazily allocated the way `ReactiveEngine` lazily allocates
//! per-channel locks.

use crate::config::Config;
use crate::context::{base_system_prompt, ContextBuilder};
use crate::llm::{ContentBlock, LlmClient, LlmMessage, LlmRequest, Role};
use crate::memory::followup::FollowupStore;
use crate::memory::stats::StatsStore;
use crate::messaging::{OutboundMessage, PlatformClient};
use crate::model::{DeliveryMode, Followup, FollowupStatus};
use crate::store::MessageStore;
use crate::{now_millis, ChannelId, MessageId, MillisUtc, ServerId, UserId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Pending records older than this are discarded regardless of priority
/// during maintenance, per §4.7's "bounded horizon" (the spec names no
/// config key for this value, unlike `followups.max_age_days`).
const FOLLOWUP_PENDING_HORIZON_DAYS: i64 = 90;

/// Success-attribution window (§4.7): how long after a proactive send to
/// watch for user activity before deciding it landed.
const SUCCESS_ATTRIBUTION_MINUTES: i64 = 15;

/// A scheduled success-attribution check for one proactive send.
#[derive(Debug, Clone)]
struct PendingSuccessCheck {
    deadline: MillisUtc,
    server_id: ServerId,
    channel_id: ChannelId,
    message_id: MessageId,
}

/// Per-UTC-day counters gating proactive engagement volume. Spec names no
/// persisted location for these (unlike `ChannelStats.total_attempts`,
/// which accumulates forever); kept in memory and reset on day rollover,
/// the same pattern `WebQuotaStore` uses for its daily budget.
#[derive(Debug, Default)]
struct DailyCounts {
    day: Option<chrono::NaiveDate>,
    global: u32,
    per_channel: HashMap<ChannelId, u32>,
}

impl DailyCounts {
    fn roll_if_needed(&mut self, today: chrono::NaiveDate) {
        if self.day != Some(today) {
            self.day = Some(today);
            self.global = 0;
            self.per_channel.clear();
        }
    }
}

pub struct AgenticEngine {
    config: Arc<Config>,
    store: Arc<MessageStore>,
    llm_client: Arc<dyn LlmClient>,
    platform: Arc<dyn PlatformClient>,

    followup_stores: RwLock<HashMap<ServerId, Arc<FollowupStore>>>,
    stats_stores: RwLock<HashMap<(ServerId, ChannelId), Arc<StatsStore>>>,
    daily_counts: tokio::sync::Mutex<DailyCounts>,
    success_checks: tokio::sync::Mutex<Vec<PendingSuccessCheck>>,
}

impl AgenticEngine {
    pub fn new(config: Arc<Config>, store: Arc<MessageStore>, llm_client: Arc<dyn LlmClient>, platform: Arc<dyn PlatformClient>) -> Self {
        Self {
            config,
            store,
            llm_client,
            platform,
            followup_stores: RwLock::new(HashMap::new()),
            stats_stores: RwLock::new(HashMap::new()),
            daily_counts: tokio::sync::Mutex::new(DailyCounts::default()),
            success_checks: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    async fn followup_store(&self, server_id: &ServerId) -> Arc<FollowupStore> {
        if let Some(store) = self.followup_stores.read().await.get(server_id) {
            return store.clone();
        }
        let mut stores = self.followup_stores.write().await;
        stores
            .entry(server_id.clone())
            .or_insert_with(|| Arc::new(FollowupStore::new(self.config.followups_path(server_id))))
            .clone()
    }

    async fn stats_store(&self, server_id: &ServerId, channel_id: &ChannelId) -> Arc<StatsStore> {
        let key = (server_id.clone(), channel_id.clone());
        if let Some(store) = self.stats_stores.read().await.get(&key) {
            return store.clone();
        }
        let mut stores = self.stats_stores.write().await;
        stores
            .entry(key)
            .or_insert_with(|| Arc::new(StatsStore::new(self.config.channel_stats_path(server_id, channel_id))))
            .clone()
    }

    /// Background ticker driving the hourly loop, at `agentic.check_interval_hours`.
    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let seconds = (self.config.agentic.check_interval_hours * 3600.0).max(1.0) as u64;
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(seconds));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(error) = self.tick().await {
                        tracing::warn!(%error, "agentic tick failed");
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

    /// Drains due success-attribution checks. Runs on a finer cadence than
    /// the hourly tick since the attribution window (15 min default) is
    /// much shorter than `check_interval_hours`.
    pub async fn run_success_tracker(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(30));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.drain_success_checks().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        self.success_checks.lock().await.clear();
                        break;
                    }
                }
            }
        }
    }

    async fn tick(&self) -> crate::error::Result<()> {
        let servers: Vec<ServerId> = self.config.discord.servers.iter().map(|s| ServerId::from(s.as_str())).collect();

        if self.config.agentic.followups.enabled {
            for server_id in &servers {
                if let Err(error) = self.dispatch_followups(server_id).await {
                    tracing::warn!(%error, %server_id, "follow-up dispatch failed");
                }
            }
        }

        if self.config.agentic.proactive.enabled {
            if let Err(error) = self.proactive_engagement().await {
                tracing::warn!(%error, "proactive engagement failed");
            }
        }

        for server_id in &servers {
            if let Err(error) = self.maintenance(server_id).await {
                tracing::warn!(%error, %server_id, "agentic maintenance failed");
            }
        }

        Ok(())
    }

    /// §4.7 step 1: dispatch every `pending` follow-up whose time has come
    /// and whose gating predicate passes, moving it to `completed`.
    async fn dispatch_followups(&self, server_id: &ServerId) -> crate::error::Result<()> {
        let store = self.followup_store(server_id).await;
        let file = store.load().await?;
        let now = chrono::Utc::now();

        for followup in &file.pending {
            if followup.status != FollowupStatus::Pending {
                continue;
            }
            if followup.follow_up_after > now {
                continue;
            }
            if followup.priority < self.config.agentic.followups.priority_threshold {
                continue;
            }
            if !self.user_active_recently(&followup.channel_id, &followup.user_id, now).await? {
                continue;
            }

            match self.send_followup(followup).await {
                Ok(()) => {
                    store.complete(&followup.id, chrono::Utc::now()).await?;
                }
                Err(error) => {
                    tracing::warn!(%error, followup_id = %followup.id, "follow-up dispatch send failed");
                }
            }
        }
        Ok(())
    }

    /// Whether `user_id` has posted in `channel_id` within the last 24h,
    /// per §4.7's "(optionally) the user was active within the last 24h"
    /// gating clause.
    async fn user_active_recently(&self, channel_id: &ChannelId, user_id: &UserId, now: chrono::DateTime<chrono::Utc>) -> crate::error::Result<bool> {
        let cutoff = now.timestamp_millis() - 24 * 60 * 60 * 1000;
        let recent = self.store.get_recent(channel_id, 100).await?;
        Ok(recent.iter().any(|m| &m.author_id == user_id && m.timestamp >= cutoff))
    }

    /// Generates a natural check-in for `followup` via the LLM (extended
    /// thinking enabled, no tools) and sends it on the recorded channel.
    async fn send_followup(&self, followup: &Followup) -> crate::error::Result<()> {
        let prompt = format!(
            "It's time to follow up with {user} about something they mentioned on {mentioned}: {event}\n\
             Context: {context}\n\n\
             Write a brief, natural check-in message to send in the channel. Respond with only \
             the message text, nothing else.",
            user = followup.user_name,
            mentioned = followup.mentioned_date.format("%Y-%m-%d"),
            event = followup.event,
            context = followup.context,
        );

        let request = LlmRequest {
            system: base_system_prompt(&self.config),
            messages: vec![LlmMessage { role: Role::User, content: vec![ContentBlock::Text { text: prompt, citations: vec![] }] }],
            tools: vec![],
            max_tokens: self.config.api.max_tokens,
            extended_thinking: self.config.api.extended_thinking.enabled,
            thinking_budget_tokens: self.config.api.extended_thinking.budget_tokens,
            enable_prompt_caching: false,
        };

        let response = self.llm_client.complete(request).await?;
        let text = extract_text(&response.content);
        if text.trim().is_empty() {
            return Ok(());
        }

        let sent = self.platform.send(OutboundMessage { channel_id: followup.channel_id.clone(), text, reply_to_message_id: None }).await?;
        self.store.put(&sent).await?;
        Ok(())
    }

    /// §4.7 step 2: for each allowlisted channel that's idle in-window and
    /// under both daily caps and above the success-rate gate, ask the LLM
    /// whether and how to engage.
    async fn proactive_engagement(&self) -> crate::error::Result<()> {
        let proactive = &self.config.agentic.proactive;
        if self.in_quiet_hours() {
            return Ok(());
        }

        for channel_id_raw in &proactive.allowed_channels {
            let channel_id: ChannelId = channel_id_raw.as_str().into();
            let recent = self.store.get_recent(&channel_id, 1).await?;
            let Some(last) = recent.into_iter().next() else { continue };

            let idle_hours = (now_millis() - last.timestamp) as f64 / 3_600_000.0;
            if idle_hours < proactive.min_idle_hours || idle_hours > proactive.max_idle_hours {
                continue;
            }

            {
                let mut counts = self.daily_counts.lock().await;
                counts.roll_if_needed(chrono::Utc::now().date_naive());
                if counts.global >= proactive.max_per_day_global {
                    continue;
                }
                if counts.per_channel.get(&channel_id).copied().unwrap_or(0) >= proactive.max_per_day_per_channel {
                    continue;
                }
            }

            let stats = self.stats_store(&last.server_id, &channel_id).await;
            let current_stats = stats.load().await?;
            if current_stats.success_rate() <= proactive.engagement_threshold {
                continue;
            }

            let user_names = HashMap::new();
            let builder = ContextBuilder::new(&self.config, &self.store, &user_names);
            let context = builder.build(&last, &std::collections::HashSet::new()).await?;

            let prompt = format!(
                "{}\n\nThis channel has been quiet. Decide whether to proactively reach out. \
                 Respond with exactly one line: MODE: standalone, MODE: woven, or MODE: deferred. \
                 If standalone or woven, follow with the message text on the next line(s). \
                 Use woven to reply directly to the most recent message above; standalone to \
                 start a fresh message; deferred to do nothing this time.",
                context.transcript
            );

            let request = LlmRequest {
                system: context.system,
                messages: vec![LlmMessage { role: Role::User, content: vec![ContentBlock::Text { text: prompt, citations: vec![] }] }],
                tools: vec![],
                max_tokens: self.config.api.max_tokens,
                extended_thinking: false,
                thinking_budget_tokens: 0,
                enable_prompt_caching: true,
            };

            let response = self.llm_client.complete(request).await?;
            let raw = extract_text(&response.content);
            let (mode, message_text) = parse_decision(&raw);

            stats.record_attempt().await?;

            match mode {
                DeliveryMode::Deferred => continue,
                DeliveryMode::Standalone | DeliveryMode::Woven => {
                    if message_text.trim().is_empty() {
                        continue;
                    }
                    let reply_to = if mode == DeliveryMode::Woven { Some(last.message_id.clone()) } else { None };
                    let sent = self
                        .platform
                        .send(OutboundMessage { channel_id: channel_id.clone(), text: message_text, reply_to_message_id: reply_to })
                        .await?;
                    self.store.put(&sent).await?;

                    let mut counts = self.daily_counts.lock().await;
                    counts.global += 1;
                    *counts.per_channel.entry(channel_id.clone()).or_insert(0) += 1;
                    drop(counts);

                    self.schedule_success_check(last.server_id.clone(), channel_id.clone(), sent.message_id.clone()).await;
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

    async fn schedule_success_check(&self, server_id: ServerId, channel_id: ChannelId, message_id: MessageId) {
        let deadline = now_millis() + SUCCESS_ATTRIBUTION_MINUTES * 60_000;
        self.success_checks.lock().await.push(PendingSuccessCheck { deadline, server_id, channel_id, message_id });
    }

    async fn drain_success_checks(&self) {
        let now = now_millis();
        let due: Vec<PendingSuccessCheck> = {
            let mut checks = self.success_checks.lock().await;
            let (due, remaining): (Vec<_>, Vec<_>) = checks.drain(..).partition(|c| c.deadline <= now);
            *checks = remaining;
            due
        };

        for check in due {
            let succeeded = match self.platform.fetch_around(&check.channel_id, &check.message_id, 10).await {
                Ok(window) => {
                    let sent = window.iter().find(|m| m.message_id == check.message_id);
                    let sent_ts = sent.map(|m| m.timestamp).unwrap_or(i64::MAX);
                    window.iter().any(|m| {
                        m.message_id != check.message_id
                            && (m.reply_to_message_id.as_ref() == Some(&check.message_id) || m.timestamp > sent_ts)
                    }) || sent.map(|m| !m.reactions.is_empty()).unwrap_or(false)
                }
                Err(error) => {
                    tracing::debug!(%error, channel_id = %check.channel_id, "success-attribution fetch failed");
                    false
                }
            };

            if succeeded {
                let stats = self.stats_store(&check.server_id, &check.channel_id).await;
                if let Err(error) = stats.record_success().await {
                    tracing::warn!(%error, "failed to record proactive success");
                }
            }
        }
    }

    /// §4.7 step 3: prune aged-out `completed` follow-ups and stale
    /// `pending` ones.
    async fn maintenance(&self, server_id: &ServerId) -> crate::error::Result<()> {
        let store = self.followup_store(server_id).await;
        store
            .prune(self.config.agentic.followups.max_age_days as i64, FOLLOWUP_PENDING_HORIZON_DAYS, chrono::Utc::now())
            .await
    }
}

fn extract_text(blocks: &[ContentBlock]) -> String {
    blocks
        .iter()
        .filter_map(|b| match b {
            ContentBlock::Text { text, .. } => Some(text.clone()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Parses the `MODE: <standalone|woven|deferred>` first line and returns the
/// remaining lines as the message text.
fn parse_decision(text: &str) -> (DeliveryMode, String) {
    let mut lines = text.lines();
    let first = lines.next().unwrap_or_default().to_lowercase();

    let mode = if first.contains("standalone") {
        DeliveryMode::Standalone
    } else if first.contains("woven") {
        DeliveryMode::Woven
    } else {
        DeliveryMode::Deferred
    };

    let rest = lines.collect::<Vec<_>>().join("\n").trim().to_string();
    (mode, rest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_decision_reads_standalone_mode_and_body() {
        let (mode, text) = parse_decision("MODE: standalone\nHey, how's it going?");
        assert_eq!(mode, DeliveryMode::Standalone);
        assert_eq!(text, "Hey, how's it going?");
    }

    #[test]
    fn parse_decision_reads_woven_mode() {
        let (mode, _) = parse_decision("mode: woven\nreply text");
        assert_eq!(mode, DeliveryMode::Woven);
    }

    #[test]
    fn parse_decision_defaults_to_deferred_on_unrecognized_text() {
        let (mode, _) = parse_decision("not sure what to do here");
        assert_eq!(mode, DeliveryMode::Deferred);
    }

    #[test]
    fn daily_counts_reset_on_day_rollover() {
        let mut counts = DailyCounts::default();
        let day1 = chrono::NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
        let day2 = chrono::NaiveDate::from_ymd_opt(2026, 1, 2).unwrap();

        counts.roll_if_needed(day1);
        counts.global = 5;
        counts.per_channel.insert("c1".into(), 2);

        counts.roll_if_needed(day1);
        assert_eq!(counts.global, 5, "same day must not reset");

        counts.roll_if_needed(day2);
        assert_eq!(counts.global, 0);
        assert!(counts.per_channel.is_empty());
    }
}
