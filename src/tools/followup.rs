//! The `create_followup` tool: the LLM's entry point into
//! `memory::followup::FollowupStore`, mirroring `MemoryTool`'s shape
//! (`NAME`/`Args: JsonSchema`/`Output: Serialize`) but one tagged command
//! instead of six. The LLM supplies a channel, not a server, so the store is
//! picked the same way `AgenticEngine::proactive_engagement` does — by
//! reading the server id off the channel's most recent stored message.

use crate::config::Config;
use crate::memory::followup::FollowupStore;
use crate::model::{Followup, FollowupStatus, Priority};
use crate::store::MessageStore;
use crate::{ChannelId, ServerId};
use rig::completion::ToolDefinition;
use rig::tool::Tool;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Deserialize, JsonSchema)]
pub struct FollowupArgs {
    pub channel_id: String,
    pub user_id: String,
    pub user_name: String,
    /// What the user mentioned.
    pub event: String,
    /// Why it's worth checking back on.
    pub context: String,
    /// ISO 8601 timestamp of when to check back; must not be in the past.
    pub follow_up_after: String,
    #[serde(default)]
    pub priority: Priority,
}

#[derive(Debug, Serialize)]
pub struct FollowupOutput {
    pub id: String,
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct FollowupToolError(pub String);

pub struct FollowupTool {
    config: Arc<Config>,
    message_store: Arc<MessageStore>,
    stores: RwLock<HashMap<ServerId, Arc<FollowupStore>>>,
}

impl FollowupTool {
    pub fn new(config: Arc<Config>, message_store: Arc<MessageStore>) -> Self {
        Self {
            config,
            message_store,
            stores: RwLock::new(HashMap::new()),
        }
    }

    async fn store_for(&self, server_id: &ServerId) -> Arc<FollowupStore> {
        if let Some(store) = self.stores.read().await.get(server_id) {
            return store.clone();
        }
        let mut stores = self.stores.write().await;
        stores
            .entry(server_id.clone())
            .or_insert_with(|| Arc::new(FollowupStore::new(self.config.followups_path(server_id))))
            .clone()
    }

    async fn server_for_channel(&self, channel_id: &ChannelId) -> Result<ServerId, FollowupToolError> {
        let recent = self
            .message_store
            .get_recent(channel_id, 1)
            .await
            .map_err(|e| FollowupToolError(e.to_string()))?;
        recent
            .into_iter()
            .next()
            .map(|m| m.server_id)
            .ok_or_else(|| FollowupToolError(format!("no known server for channel {channel_id}")))
    }
}

impl Tool for FollowupTool {
    const NAME: &'static str = "create_followup";

    type Error = FollowupToolError;
    type Args = FollowupArgs;
    type Output = FollowupOutput;

    async fn definition(&self, _prompt: String) -> ToolDefinition {
        ToolDefinition {
            name: Self::NAME.to_string(),
            description: "Schedule a follow-up reminder. The agentic loop checks back in the \
                           given channel once follow_up_after has passed and the user has been \
                           active recently. Use this when a user mentions something worth \
                           revisiting later, instead of the memory tool."
                .to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "channel_id": { "type": "string" },
                    "user_id": { "type": "string" },
                    "user_name": { "type": "string" },
                    "event": { "type": "string", "description": "What the user mentioned." },
                    "context": { "type": "string", "description": "Why it's worth following up." },
                    "follow_up_after": { "type": "string", "description": "ISO 8601 timestamp of when to check back." },
                    "priority": { "type": "string", "enum": ["low", "medium", "high"] }
                },
                "required": ["channel_id", "user_id", "user_name", "event", "context", "follow_up_after"]
            }),
        }
    }

    async fn call(&self, args: Self::Args) -> Result<Self::Output, Self::Error> {
        let follow_up_after = chrono::DateTime::parse_from_rfc3339(&args.follow_up_after)
            .map(|dt| dt.with_timezone(&chrono::Utc))
            .map_err(|e| FollowupToolError(format!("invalid follow_up_after: {e}")))?;
        let mentioned_date = chrono::Utc::now();
        if follow_up_after < mentioned_date {
            return Err(FollowupToolError("follow_up_after must not be in the past".to_string()));
        }

        let channel_id: ChannelId = args.channel_id.as_str().into();
        let server_id = self.server_for_channel(&channel_id).await?;
        let store = self.store_for(&server_id).await;

        let followup = Followup {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: args.user_id.as_str().into(),
            user_name: args.user_name,
            channel_id,
            event: args.event,
            context: args.context,
            mentioned_date,
            follow_up_after,
            priority: args.priority,
            status: FollowupStatus::Pending,
            completed_date: None,
        };

        let id = followup.id.clone();
        store.add(followup).await.map_err(|e| FollowupToolError(e.to_string()))?;
        Ok(FollowupOutput { id })
    }
}
