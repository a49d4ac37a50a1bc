//! The `search_messages` tool: conjunctive full-text search over a channel's
//! history, returning references only (no text), per §4.5. Grounded in the
//! same `rig::tool::Tool` shape as `memory.rs`, wrapping `MessageStore::search`.

use crate::store::MessageStore;
use crate::model::SearchOptions;
use rig::completion::ToolDefinition;
use rig::tool::Tool;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Deserialize, JsonSchema)]
pub struct SearchMessagesArgs {
    pub query: String,
    pub channel_id: Option<String>,
    pub author_id: Option<String>,
    pub since: Option<i64>,
    pub until: Option<i64>,
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_limit() -> u32 {
    20
}

#[derive(Debug, Serialize)]
pub struct SearchMessagesOutput {
    pub results: Vec<SearchHit>,
}

#[derive(Debug, Serialize)]
pub struct SearchHit {
    pub message_id: String,
    pub channel_id: String,
    pub author_id: String,
    pub timestamp: i64,
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct SearchToolError(pub String);

pub struct SearchMessagesTool {
    store: Arc<MessageStore>,
}

impl SearchMessagesTool {
    pub fn new(store: Arc<MessageStore>) -> Self {
        Self { store }
    }
}

impl Tool for SearchMessagesTool {
    const NAME: &'static str = "search_messages";

    type Error = SearchToolError;
    type Args = SearchMessagesArgs;
    type Output = SearchMessagesOutput;

    async fn definition(&self, _prompt: String) -> ToolDefinition {
        ToolDefinition {
            name: Self::NAME.to_string(),
            description: "Full-text search over message history. Returns references \
                           (message/channel/author ids and timestamps) but not message text — \
                           follow up with `view_messages` in `around` mode to read a hit in \
                           context."
                .to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string" },
                    "channel_id": { "type": "string" },
                    "author_id": { "type": "string" },
                    "since": { "type": "integer" },
                    "until": { "type": "integer" },
                    "limit": { "type": "integer", "default": 20 }
                },
                "required": ["query"]
            }),
        }
    }

    async fn call(&self, args: Self::Args) -> Result<Self::Output, Self::Error> {
        let options = SearchOptions {
            query: args.query,
            channel_id: args.channel_id.map(Into::into),
            server_id: None,
            author_id: args.author_id.map(Into::into),
            since: args.since,
            until: args.until,
            limit: (args.limit.clamp(1, 100)) as usize,
        };

        let hits = self
            .store
            .search(&options)
            .await
            .map_err(|e| SearchToolError(e.to_string()))?;

        Ok(SearchMessagesOutput {
            results: hits
                .into_iter()
                .map(|r| SearchHit {
                    message_id: r.message_id.to_string(),
                    channel_id: r.channel_id.to_string(),
                    author_id: r.author_id.to_string(),
                    timestamp: r.timestamp,
                })
                .collect(),
        })
    }
}
