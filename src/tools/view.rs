//! The `view_messages` tool: fetches full message text in one of four modes
//! (`recent`, `around`, `first`, `range`), per §4.5. The two-step
//! search-then-view contract keeps `search_messages` cheap on tokens.

use crate::store::MessageStore;
use crate::model::Message;
use rig::completion::ToolDefinition;
use rig::tool::Tool;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ViewMode {
    Recent,
    Around,
    First,
    Range,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ViewMessagesArgs {
    pub mode: ViewMode,
    pub channel_id: Option<String>,
    pub message_id: Option<String>,
    pub from_id: Option<String>,
    pub to_id: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    20
}

#[derive(Debug, Serialize)]
pub struct ViewMessagesOutput {
    pub messages: Vec<ViewedMessage>,
}

#[derive(Debug, Serialize)]
pub struct ViewedMessage {
    pub message_id: String,
    pub author_display_name: String,
    pub timestamp: i64,
    pub text: String,
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct ViewToolError(pub String);

pub struct ViewMessagesTool {
    store: Arc<MessageStore>,
}

impl ViewMessagesTool {
    pub fn new(store: Arc<MessageStore>) -> Self {
        Self { store }
    }
}

fn render(messages: Vec<Message>) -> ViewMessagesOutput {
    ViewMessagesOutput {
        messages: messages
            .into_iter()
            .map(|m| ViewedMessage {
                message_id: m.message_id.to_string(),
                author_display_name: m.author_display_name,
                timestamp: m.timestamp,
                text: m.text,
            })
            .collect(),
    }
}

impl Tool for ViewMessagesTool {
    const NAME: &'static str = "view_messages";

    type Error = ViewToolError;
    type Args = ViewMessagesArgs;
    type Output = ViewMessagesOutput;

    async fn definition(&self, _prompt: String) -> ToolDefinition {
        ToolDefinition {
            name: Self::NAME.to_string(),
            description: "Fetches message text. `recent` reads the newest messages in a \
                           channel; `around` reads a span either side of a given message id; \
                           `first` reads the oldest messages in a channel; `range` reads every \
                           message between two ids inclusive."
                .to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "mode": { "type": "string", "enum": ["recent", "around", "first", "range"] },
                    "channel_id": { "type": "string" },
                    "message_id": { "type": "string" },
                    "from_id": { "type": "string" },
                    "to_id": { "type": "string" },
                    "limit": { "type": "integer", "default": 20 }
                },
                "required": ["mode"]
            }),
        }
    }

    async fn call(&self, args: Self::Args) -> Result<Self::Output, Self::Error> {
        let limit = args.limit.clamp(1, 200);
        let result = match args.mode {
            ViewMode::Recent => {
                let channel_id = args
                    .channel_id
                    .ok_or_else(|| ViewToolError("channel_id is required for mode=recent".into()))?;
                self.store.get_recent(&channel_id.into(), limit).await
            }
            ViewMode::First => {
                let channel_id = args
                    .channel_id
                    .ok_or_else(|| ViewToolError("channel_id is required for mode=first".into()))?;
                self.store.get_first(&channel_id.into(), limit).await
            }
            ViewMode::Around => {
                let message_id = args
                    .message_id
                    .ok_or_else(|| ViewToolError("message_id is required for mode=around".into()))?;
                self.store.get_around(&message_id.into(), limit).await
            }
            ViewMode::Range => {
                let from_id = args
                    .from_id
                    .ok_or_else(|| ViewToolError("from_id is required for mode=range".into()))?;
                let to_id = args
                    .to_id
                    .ok_or_else(|| ViewToolError("to_id is required for mode=range".into()))?;
                self.store.get_range(&from_id.into(), &to_id.into()).await
            }
        };

        result.map(render).map_err(|e| ViewToolError(e.to_string()))
    }
}
