//! Assembles the system prompt and message transcript passed to the LLM.
//!
//! Follows the block-composition idiom of the teacher's
//! `conversation/context.rs` (`build_channel_context` concatenating named
//! sections into one string), generalized here to the sections §4.4 names:
//! identity line, UTC timestamp, personality prompt, optional follow-up
//! instructions, and a rendered message transcript rather than memories.

use crate::config::Config;
use crate::model::{Message, Reaction};
use crate::store::MessageStore;
use crate::{ChannelId, MessageId};
use std::collections::{HashMap, HashSet};

const MAX_REPLY_CHAIN_DEPTH: usize = 5;

/// An LLM request payload: one system block and one user turn.
#[derive(Debug, Clone)]
pub struct LlmContext {
    pub system: String,
    /// Newline-joined transcript forming the single user turn.
    pub transcript: String,
}

/// Builds `LlmContext` values from the triggering message, bot identity,
/// and the message/user stores. Context assembly must happen after the
/// per-channel serialization lock is held (§4.4's critical concurrency
/// rule) — that invariant is enforced by the caller (`ReactiveEngine`), not
/// by this type.
pub struct ContextBuilder<'a> {
    config: &'a Config,
    store: &'a MessageStore,
    user_names: &'a HashMap<String, String>,
}

impl<'a> ContextBuilder<'a> {
    pub fn new(config: &'a Config, store: &'a MessageStore, user_names: &'a HashMap<String, String>) -> Self {
        Self { config, store, user_names }
    }

    /// `exclude_message_ids` holds messages already being processed in this
    /// batch, preventing duplicate responses under rapid bursts.
    pub async fn build(
        &self,
        triggering: &Message,
        exclude_message_ids: &HashSet<MessageId>,
    ) -> crate::error::Result<LlmContext> {
        let system = self.build_system();

        let recent = self
            .store
            .get_recent(&triggering.channel_id, self.config.reactive.context_window as i64)
            .await?;
        let mut recent: Vec<Message> = recent
            .into_iter()
            .rev()
            .filter(|m| !exclude_message_ids.contains(&m.message_id) || m.message_id == triggering.message_id)
            .collect();
        if recent.last().map(|m| &m.message_id) != Some(&triggering.message_id) {
            recent.push(triggering.clone());
        }

        let mut transcript = String::new();
        for message in &recent {
            transcript.push_str(&self.render_line(message));
            transcript.push('\n');
        }

        if let Some(reply_to) = &triggering.reply_to_message_id {
            let chain = self.resolve_reply_chain(reply_to).await?;
            if !chain.is_empty() {
                transcript.push_str("— reply chain —\n");
                for message in chain.iter().rev() {
                    transcript.push_str(&self.render_line(message));
                    transcript.push('\n');
                }
            }
        }

        Ok(LlmContext { system, transcript })
    }

    fn build_system(&self) -> String {
        base_system_prompt(self.config)
    }

    /// Resolves up to `MAX_REPLY_CHAIN_DEPTH` levels, deepest-first
    /// chronological in the returned vec's iteration order when reversed by
    /// the caller — i.e. index 0 is the immediate parent, last is the
    /// deepest ancestor resolved.
    async fn resolve_reply_chain(&self, root: &MessageId) -> crate::error::Result<Vec<Message>> {
        let mut chain = Vec::new();
        let mut current = Some(root.clone());

        while let Some(id) = current {
            if chain.len() >= MAX_REPLY_CHAIN_DEPTH {
                break;
            }
            match self.fetch_single(&id).await? {
                Some(message) => {
                    current = message.reply_to_message_id.clone();
                    chain.push(message);
                }
                None => {
                    chain.push(unresolvable_marker(&id));
                    break;
                }
            }
        }

        Ok(chain)
    }

    async fn fetch_single(&self, message_id: &MessageId) -> crate::error::Result<Option<Message>> {
        let around = self.store.get_around(message_id, 0).await?;
        Ok(around.into_iter().find(|m| &m.message_id == message_id))
    }

    fn render_line(&self, message: &Message) -> String {
        let time = chrono::DateTime::from_timestamp_millis(message.timestamp)
            .map(|dt| dt.format("%H:%M").to_string())
            .unwrap_or_else(|| "??:??".into());

        let author = if message.is_bot {
            "Assistant (you)".to_string()
        } else {
            message.author_display_name.clone()
        };

        let mut line = format!("[{time}] {author}: {}", rewrite_mentions(&message.text, self.user_names));

        if !message.reactions.is_empty() {
            line.push_str(&format!(" *(Reactions: {})*", format_reactions(&message.reactions)));
        }

        line
    }
}

/// The {identity line, UTC timestamp, personality prompt, optional follow-up
/// instructions} system block shared by `ContextBuilder` and `AgenticEngine`
/// (the latter has no per-channel transcript to attach it to, but wants the
/// same identity/personality framing for its follow-up and proactive calls).
pub fn base_system_prompt(config: &Config) -> String {
    let mut system = String::new();
    system.push_str(&format!("You are {}.\n", config.bot_id));
    system.push_str(&format!("Current UTC time: {}\n\n", chrono::Utc::now().to_rfc3339()));

    if !config.personality.base_prompt.is_empty() {
        system.push_str(&config.personality.base_prompt);
        system.push_str("\n\n");
    }

    if config.agentic.followups.enabled {
        system.push_str(
            "Call the create_followup tool when a user mentions something worth checking \
             back on later. Give it the channel, a short note of what to follow up on, and \
             when it should come due.\n",
        );
    }

    system
}

fn unresolvable_marker(message_id: &MessageId) -> Message {
    Message {
        message_id: message_id.clone(),
        channel_id: "".into(),
        server_id: "".into(),
        author_id: "".into(),
        author_display_name: "unknown".into(),
        text: "[forwarded message unavailable]".into(),
        timestamp: 0,
        is_bot: false,
        reply_to_message_id: None,
        attachments: Vec::new(),
        reactions: Vec::new(),
    }
}

static MENTION_PATTERN: std::sync::LazyLock<regex::Regex> =
    std::sync::LazyLock::new(|| regex::Regex::new(r"<@!?(\d{15,22})>").expect("hardcoded mention regex"));

/// Rewrites raw platform mentions `<@id>` (or `<@!id>`) to `@<display_name>`
/// using the user cache, leaving unresolved IDs as-is.
fn rewrite_mentions(text: &str, user_names: &HashMap<String, String>) -> String {
    MENTION_PATTERN
        .replace_all(text, |caps: &regex::Captures| match user_names.get(&caps[1]) {
            Some(name) => format!("@{name}"),
            None => caps[0].to_string(),
        })
        .into_owned()
}

fn format_reactions(reactions: &[Reaction]) -> String {
    reactions
        .iter()
        .map(|r| format!("{}×{}", r.emoji, r.count))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mentions_are_rewritten_to_display_names() {
        let mut names = HashMap::new();
        names.insert("123".to_string(), "Alice".to_string());
        let rewritten = rewrite_mentions("hey <@123> look at this", &names);
        assert_eq!(rewritten, "hey @Alice look at this");
    }

    #[test]
    fn unresolved_mentions_are_left_unmodified() {
        let names = HashMap::new();
        let rewritten = rewrite_mentions("hey <@999>", &names);
        assert_eq!(rewritten, "hey <@999>");
    }

    #[test]
    fn reactions_are_formatted_inline() {
        let reactions = vec![
            Reaction { emoji: "👍".into(), count: 2 },
            Reaction { emoji: "❤️".into(), count: 1 },
        ];
        assert_eq!(format_reactions(&reactions), "👍×2, ❤️×1");
    }
}
