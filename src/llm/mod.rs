//! LLM provider boundary: the one external collaborator the tool-use loop
//! calls into. `LlmClient` is implemented concretely for Anthropic in
//! `anthropic.rs`, grounded in the teacher's `llm/anthropic/params.rs`
//! request-assembly idiom (system blocks, cache_control, tool schema,
//! adaptive thinking) and the API-key/cooldown bookkeeping style of its
//! (since-removed) `llm/manager.rs`.

pub mod anthropic;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One turn in the conversation sent to the provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmMessage {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// A tool definition advertised to the provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// Content block variants exchanged with the provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
        #[serde(default)]
        citations: Vec<Citation>,
    },
    Thinking {
        thinking: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default)]
        is_error: bool,
    },
    /// A provider-executed tool (`web_search`/`web_fetch`). Opaque to this
    /// crate beyond accounting against `WebQuotaStore`.
    ServerToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    /// A compressed attachment ready for vision, produced by
    /// `tools::image::ImagePipeline` and attached to the user turn alongside
    /// the rendered transcript (§4.5/§5's image pipeline).
    Image {
        media_type: String,
        #[serde(rename = "data")]
        data_base64: String,
    },
}

/// A citation attached to a `Text` block, emitted when `web_search` results
/// back a claim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Citation {
    pub title: String,
    pub url: String,
}

/// Shapes one Messages-API-equivalent call.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub system: String,
    pub messages: Vec<LlmMessage>,
    pub tools: Vec<ToolDefinition>,
    pub max_tokens: u32,
    pub extended_thinking: bool,
    pub thinking_budget_tokens: u32,
    /// Marks the system block and the last tool definition cacheable when
    /// prompt caching is active.
    pub enable_prompt_caching: bool,
}

/// Why the provider ended the turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    Other,
}

#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub content: Vec<ContentBlock>,
    pub stop_reason: StopReason,
}

/// The provider boundary the tool-use loop calls into. One concrete
/// implementation (`anthropic::AnthropicClient`) ships with this crate.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, request: LlmRequest) -> crate::error::Result<LlmResponse>;
}
