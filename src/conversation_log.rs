//! Machine-parseable conversation log (§6): a flat, append-only record of
//! every message the reactive engine considers responding to — decision,
//! rate-limit snapshot, outgoing length, and (once resolved) engagement
//! outcome. Complements the `tracing` sink `daemon.rs` wires up; this one is
//! a fixed textual format downstream tooling can grep rather than a
//! structured tracing event, grounded in the teacher's per-turn persistence
//! in `conversation/history.rs` (`HistoryStore::save_turn`), adapted here to
//! an append-only text file since §6 names the exact on-disk tag format
//! rather than a relational schema.

use crate::config::RateLimitingConfig;
use crate::error::{MemoryError, Result};
use crate::model::Message;
use crate::rate_limit::RateStats;
use crate::MessageId;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

const MAX_SNIPPET_CHARS: usize = 80;
const RECORD_SEPARATOR: &str = "---\n";

/// Appends decision/rate-limit/outgoing/engagement records to
/// `logs/<bot>_conversations.log`. A record spans several calls —
/// `record_decision` opens it, `record_outgoing` plus `record_engagement`
/// (or `abandon`) close it — so an in-progress record's text is held in
/// `pending` until the turn resolves, keyed by the triggering message.
pub struct ConversationLog {
    path: PathBuf,
    write_lock: Mutex<()>,
    pending: Mutex<HashMap<MessageId, String>>,
    /// Maps the first outgoing segment's id back to the triggering message,
    /// since the engagement tracker only knows the outgoing id.
    outgoing_index: Mutex<HashMap<MessageId, MessageId>>,
}

impl ConversationLog {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            write_lock: Mutex::new(()),
            pending: Mutex::new(HashMap::new()),
            outgoing_index: Mutex::new(HashMap::new()),
        }
    }

    async fn append(&self, text: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|source| MemoryError::Io { path: self.path.display().to_string(), source })?;
        file.write_all(text.as_bytes())
            .await
            .map_err(|source| MemoryError::Io { path: self.path.display().to_string(), source })?;
        Ok(())
    }

    /// Opens a record for `message`: header line, `[DECISION]`,
    /// `[RATE_LIMIT]`. When `respond` is `false` there is no outgoing reply
    /// or engagement to wait for, so the record is closed and flushed here.
    pub async fn record_decision(
        &self,
        message: &Message,
        respond: bool,
        reason: &str,
        stats: &RateStats,
        rate_config: &RateLimitingConfig,
    ) {
        let mut record = format!(
            "[{}] #{} <{}>: \"{}\"\n",
            chrono::Utc::now().to_rfc3339(),
            message.channel_id,
            message.author_display_name,
            snippet(&message.text),
        );
        record.push_str(&format!(
            "[DECISION] Respond: {} ({reason})\n",
            if respond { "YES" } else { "NO" },
        ));
        record.push_str(&format_rate_line(stats, rate_config));

        if !respond {
            record.push_str(RECORD_SEPARATOR);
            if let Err(error) = self.append(&record).await {
                tracing::warn!(%error, "conversation log append failed");
            }
            return;
        }

        self.pending.lock().await.insert(message.message_id.clone(), record);
    }

    /// Appends `[OUTGOING]` to the record opened for `trigger_id` and
    /// registers `first_segment_id` so a later `record_engagement` call can
    /// find it. A no-op if no record was opened for `trigger_id`.
    pub async fn record_outgoing(&self, trigger_id: &MessageId, first_segment_id: &MessageId, body_chars: usize) {
        let mut pending = self.pending.lock().await;
        if let Some(record) = pending.get_mut(trigger_id) {
            record.push_str(&format!("[OUTGOING] {body_chars} chars\n"));
            self.outgoing_index.lock().await.insert(first_segment_id.clone(), trigger_id.clone());
        }
    }

    /// Closes a record with no outgoing reply (an empty LLM turn): no
    /// `[OUTGOING]`/`[ENGAGEMENT]` fields, just the record separator.
    pub async fn abandon(&self, trigger_id: &MessageId) {
        if let Some(mut record) = self.pending.lock().await.remove(trigger_id) {
            record.push_str(RECORD_SEPARATOR);
            if let Err(error) = self.append(&record).await {
                tracing::warn!(%error, "conversation log append failed");
            }
        }
    }

    /// Closes the record for outgoing message `segment_id` with the
    /// resolved `[ENGAGEMENT]` outcome and flushes it to disk. A no-op if
    /// `segment_id` isn't tracked — a later segment of a multi-segment
    /// reply, or a reply this log never opened a record for.
    pub async fn record_engagement(&self, segment_id: &MessageId, engaged: bool, method: &str) {
        let Some(trigger_id) = self.outgoing_index.lock().await.remove(segment_id) else {
            return;
        };
        let Some(mut record) = self.pending.lock().await.remove(&trigger_id) else {
            return;
        };

        if engaged {
            record.push_str(&format!("[ENGAGEMENT] \u{2713} ENGAGED ({method})\n"));
        } else {
            record.push_str("[ENGAGEMENT] \u{2717} IGNORED\n");
        }
        record.push_str(RECORD_SEPARATOR);

        if let Err(error) = self.append(&record).await {
            tracing::warn!(%error, "conversation log append failed");
        }
    }
}

fn snippet(text: &str) -> String {
    match text.char_indices().nth(MAX_SNIPPET_CHARS) {
        Some((byte_index, _)) => format!("{}\u{2026}", &text[..byte_index]),
        None => text.to_string(),
    }
}

fn format_rate_line(stats: &RateStats, config: &RateLimitingConfig) -> String {
    format!(
        "[RATE_LIMIT] {}: {}/{}, {}: {}/{}, ignored: {}/{}\n",
        format_duration_label(config.short.duration_minutes),
        stats.short_count,
        config.short.max_responses,
        format_duration_label(config.long.duration_minutes),
        stats.long_count,
        config.long.max_responses,
        stats.ignore_count,
        config.ignore_threshold,
    )
}

fn format_duration_label(minutes: u32) -> String {
    if minutes >= 60 && minutes % 60 == 0 {
        format!("{}hr", minutes / 60)
    } else {
        format!("{minutes}min")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateWindowConfig;

    fn rate_config() -> RateLimitingConfig {
        RateLimitingConfig {
            short: RateWindowConfig { duration_minutes: 5, max_responses: 20 },
            long: RateWindowConfig { duration_minutes: 60, max_responses: 200 },
            ignore_threshold: 5,
            engagement_tracking_delay: 30,
        }
    }

    fn sample_message() -> Message {
        Message {
            message_id: "m1".into(),
            channel_id: "general".into(),
            server_id: "s1".into(),
            author_id: "u1".into(),
            author_display_name: "alice".into(),
            text: "hey what time is the standup tomorrow?".into(),
            timestamp: 0,
            is_bot: false,
            reply_to_message_id: None,
            attachments: Vec::new(),
            reactions: Vec::new(),
        }
    }

    #[test]
    fn format_rate_line_matches_the_documented_shape() {
        let stats = RateStats { short_count: 3, long_count: 41, ignore_count: 0, silenced_reason: None };
        let line = format_rate_line(&stats, &rate_config());
        assert_eq!(line, "[RATE_LIMIT] 5min: 3/20, 1hr: 41/200, ignored: 0/5\n");
    }

    #[test]
    fn snippet_truncates_long_messages() {
        let long = "a".repeat(200);
        let truncated = snippet(&long);
        assert!(truncated.ends_with('\u{2026}'));
        assert_eq!(truncated.chars().count(), MAX_SNIPPET_CHARS + 1);
    }

    #[test]
    fn snippet_is_noop_under_the_cap() {
        assert_eq!(snippet("short message"), "short message");
    }

    #[tokio::test]
    async fn negative_decision_is_flushed_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let log = ConversationLog::new(dir.path().join("bot_conversations.log"));
        let stats = RateStats { short_count: 1, long_count: 1, ignore_count: 0, silenced_reason: None };
        log.record_decision(&sample_message(), false, "momentum said no", &stats, &rate_config()).await;

        let written = tokio::fs::read_to_string(dir.path().join("bot_conversations.log")).await.unwrap();
        assert!(written.contains("[DECISION] Respond: NO (momentum said no)"));
        assert!(written.trim_end().ends_with("---"));
    }

    #[tokio::test]
    async fn full_turn_closes_on_engagement() {
        let dir = tempfile::tempdir().unwrap();
        let log = ConversationLog::new(dir.path().join("bot_conversations.log"));
        let stats = RateStats { short_count: 1, long_count: 1, ignore_count: 0, silenced_reason: None };
        let message = sample_message();

        log.record_decision(&message, true, "mention", &stats, &rate_config()).await;
        log.record_outgoing(&message.message_id, &"out1".into(), 128).await;
        log.record_engagement(&"out1".into(), true, "reactions").await;

        let written = tokio::fs::read_to_string(dir.path().join("bot_conversations.log")).await.unwrap();
        assert!(written.contains("[DECISION] Respond: YES (mention)"));
        assert!(written.contains("[OUTGOING] 128 chars"));
        assert!(written.contains("[ENGAGEMENT] \u{2713} ENGAGED (reactions)"));
    }

    #[tokio::test]
    async fn untracked_engagement_segment_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let log = ConversationLog::new(dir.path().join("bot_conversations.log"));
        log.record_engagement(&"unknown".into(), false, "").await;
        assert!(!dir.path().join("bot_conversations.log").exists());
    }
}
