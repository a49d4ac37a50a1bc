//! `ToolRouter` (§4.5): advertises client-side and server-side tool
//! definitions to the LLM, dispatches client-side calls, accounts
//! server-side `web_search`/`web_fetch` usage, and drives the tool-use loop
//! that `ReactiveEngine`/`AgenticEngine` call into. Grounded in the
//! teacher's `ToolServerHandle` (a registry wrapping `rig::tool::Tool`
//! implementations), generalized here to also run the request/response loop
//! against this crate's own `LlmClient` rather than `rig`'s agent runtime.

pub mod followup;
pub mod image;
pub mod memory;
pub mod search;
pub mod view;
pub mod web_quota;

use crate::config::Config;
use crate::error::Result;
use crate::llm::{Citation, ContentBlock, LlmClient, LlmMessage, LlmRequest, Role, StopReason, ToolDefinition};
use crate::memory::MemoryStore;
use crate::store::MessageStore;
use followup::FollowupTool;
use image::ImagePipeline;
use memory::MemoryTool;
use rig::tool::Tool as RigTool;
use search::SearchMessagesTool;
use std::sync::Arc;
use view::ViewMessagesTool;
use web_quota::WebQuotaStore;

const DEFAULT_ITERATION_CAP: u32 = 10;

/// Everything the tool-use loop needs to execute one turn, bound once per
/// bot at startup.
pub struct ToolRouter {
    memory_tool: MemoryTool,
    search_tool: SearchMessagesTool,
    view_tool: ViewMessagesTool,
    followup_tool: Option<FollowupTool>,
    pub image_pipeline: ImagePipeline,
    web_quota: WebQuotaStore,
    web_search_enabled: bool,
    web_fetch_enabled: bool,
    iteration_cap: u32,
}

impl ToolRouter {
    pub fn new(config: Arc<Config>, message_store: Arc<MessageStore>, memory_store: Arc<MemoryStore>, http: reqwest::Client) -> Self {
        let web_search = &config.api.web_search;
        let followup_tool = config
            .agentic
            .followups
            .enabled
            .then(|| FollowupTool::new(config.clone(), message_store.clone()));
        Self {
            memory_tool: MemoryTool::new(memory_store),
            search_tool: SearchMessagesTool::new(message_store.clone()),
            view_tool: ViewMessagesTool::new(message_store),
            followup_tool,
            image_pipeline: ImagePipeline::new(http, web_search.allowed_domains.clone(), config.images.compression_target),
            web_quota: WebQuotaStore::new(config.web_search_stats_path(), web_search.max_daily),
            web_search_enabled: web_search.enabled,
            web_fetch_enabled: web_search.enabled,
            iteration_cap: DEFAULT_ITERATION_CAP,
        }
    }

    /// Tool definitions advertised to the provider this turn. Server-side
    /// tools are omitted once today's quota is spent.
    pub async fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs = vec![
            to_llm_definition(self.memory_tool.definition(String::new()).await),
            to_llm_definition(self.search_tool.definition(String::new()).await),
            to_llm_definition(self.view_tool.definition(String::new()).await),
        ];
        if let Some(followup_tool) = &self.followup_tool {
            defs.push(to_llm_definition(followup_tool.definition(String::new()).await));
        }

        let remaining = self.web_quota.remaining().await.unwrap_or(0);
        if remaining > 0 {
            if self.web_search_enabled {
                defs.push(ToolDefinition {
                    name: "web_search".to_string(),
                    description: "Server-executed web search.".to_string(),
                    input_schema: serde_json::json!({"type": "object", "properties": {"query": {"type": "string"}}, "required": ["query"]}),
                });
            }
            if self.web_fetch_enabled {
                defs.push(ToolDefinition {
                    name: "web_fetch".to_string(),
                    description: "Server-executed page fetch.".to_string(),
                    input_schema: serde_json::json!({"type": "object", "properties": {"url": {"type": "string"}}, "required": ["url"]}),
                });
            }
        }

        defs
    }

    /// Executes one client-side tool call, never returning a raw exception:
    /// failures come back as descriptive text the LLM can act on. The `bool`
    /// is whether the call genuinely failed (bad input or a tool error), so
    /// the caller can mark the resulting `ToolResult` block `is_error`
    /// instead of guessing from the text.
    async fn dispatch(&self, name: &str, input: serde_json::Value) -> (String, bool) {
        match name {
            "memory" => match serde_json::from_value(input) {
                Ok(args) => match self.memory_tool.call(args).await {
                    Ok(out) => (out.text, false),
                    Err(e) => (e.to_string(), true),
                },
                Err(e) => (format!("invalid memory tool input: {e}"), true),
            },
            "search_messages" => match serde_json::from_value(input) {
                Ok(args) => match self.search_tool.call(args).await {
                    Ok(out) => (serde_json::to_string_pretty(&out).unwrap_or_default(), false),
                    Err(e) => (e.to_string(), true),
                },
                Err(e) => (format!("invalid search_messages input: {e}"), true),
            },
            "view_messages" => match serde_json::from_value(input) {
                Ok(args) => match self.view_tool.call(args).await {
                    Ok(out) => (serde_json::to_string_pretty(&out).unwrap_or_default(), false),
                    Err(e) => (e.to_string(), true),
                },
                Err(e) => (format!("invalid view_messages input: {e}"), true),
            },
            "create_followup" => match &self.followup_tool {
                Some(tool) => match serde_json::from_value(input) {
                    Ok(args) => match tool.call(args).await {
                        Ok(out) => (format!("Scheduled follow-up {}", out.id), false),
                        Err(e) => (e.to_string(), true),
                    },
                    Err(e) => (format!("invalid create_followup input: {e}"), true),
                },
                None => ("create_followup is disabled".to_string(), true),
            },
            other => (format!("unknown tool: {other}"), true),
        }
    }

    /// Runs the tool-use loop: repeatedly calls the provider, executes any
    /// client-side tool calls it requests and accounts server-side ones,
    /// until `stop_reason == end_turn` or the iteration cap is hit. Returns
    /// the assembled reply text with any citations appended as a trailing
    /// `**Sources:**` block.
    pub async fn run_loop(&self, client: &dyn LlmClient, mut request: LlmRequest) -> Result<String> {
        let mut text_parts: Vec<String> = Vec::new();
        let mut citations: Vec<Citation> = Vec::new();
        let mut hit_cap = true;

        for iteration in 0..self.iteration_cap {
            let response = client.complete(request.clone()).await?;

            let mut tool_results = Vec::new();
            let mut assistant_blocks = Vec::new();

            for block in &response.content {
                match block {
                    ContentBlock::Text { text, citations: block_citations } => {
                        text_parts.push(text.clone());
                        citations.extend(block_citations.iter().cloned());
                        assistant_blocks.push(block.clone());
                    }
                    ContentBlock::Thinking { .. } => {
                        assistant_blocks.push(block.clone());
                    }
                    ContentBlock::ToolUse { id, name, input } => {
                        assistant_blocks.push(block.clone());
                        let (output, is_error) = self.dispatch(name, input.clone()).await;
                        tool_results.push(ContentBlock::ToolResult {
                            tool_use_id: id.clone(),
                            content: output,
                            is_error,
                        });
                    }
                    ContentBlock::ServerToolUse { id, name, .. } => {
                        assistant_blocks.push(block.clone());
                        let _ = self.web_quota.record_use().await;
                        tracing::debug!(tool = %name, id = %id, "server-side tool used");
                    }
                    ContentBlock::ToolResult { .. } => {
                        assistant_blocks.push(block.clone());
                    }
                }
            }

            if response.stop_reason != StopReason::ToolUse || tool_results.is_empty() {
                hit_cap = false;
                break;
            }

            if iteration + 1 == self.iteration_cap {
                break;
            }

            request.messages.push(LlmMessage { role: Role::Assistant, content: assistant_blocks });
            request.messages.push(LlmMessage { role: Role::User, content: tool_results });
        }

        if hit_cap {
            tracing::warn!(cap = self.iteration_cap, "tool-use loop hit iteration cap, sending partial response");
        }

        let mut reply = text_parts.join("\n").trim().to_string();
        if !citations.is_empty() {
            let mut seen = std::collections::HashSet::new();
            let mut bullets = Vec::new();
            for c in &citations {
                if seen.insert(c.url.clone()) {
                    bullets.push(format!("- [{}]({})", c.title, c.url));
                }
            }
            if !bullets.is_empty() {
                reply.push_str("\n\n**Sources:**\n");
                reply.push_str(&bullets.join("\n"));
            }
        }

        Ok(reply)
    }
}

fn to_llm_definition(def: rig::completion::ToolDefinition) -> ToolDefinition {
    ToolDefinition {
        name: def.name,
        description: def.description,
        input_schema: def.parameters,
    }
}
