//! Concrete `LlmClient` for Anthropic's Messages API. Grounded in the
//! teacher's (now-removed) `llm/anthropic/params.rs` request-assembly idiom
//! — system blocks with `cache_control`, tool schema passthrough, a
//! `thinking` block for extended reasoning — rebuilt against this crate's
//! own `LlmRequest`/`LlmResponse` shape rather than `rig`'s completion types,
//! since the tool-use loop here is driven by `ToolRouter`, not `rig::agent`.

use super::{Citation, ContentBlock, LlmClient, LlmMessage, LlmRequest, LlmResponse, Role, StopReason};
use async_trait::async_trait;
use serde::Deserialize;

const API_VERSION: &str = "2023-06-01";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";

pub struct AnthropicClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl AnthropicClient {
    pub fn new(http: reqwest::Client, api_key: String, model: String) -> Self {
        Self { http, api_key, base_url: DEFAULT_BASE_URL.to_string(), model }
    }

    fn messages_url(&self) -> String {
        format!("{}/v1/messages", self.base_url.trim_end_matches('/'))
    }
}

fn role_str(role: Role) -> &'static str {
    match role {
        Role::User => "user",
        Role::Assistant => "assistant",
    }
}

fn block_to_json(block: &ContentBlock) -> serde_json::Value {
    match block {
        ContentBlock::Text { text, .. } => serde_json::json!({ "type": "text", "text": text }),
        ContentBlock::Thinking { thinking } => serde_json::json!({ "type": "thinking", "thinking": thinking }),
        ContentBlock::ToolUse { id, name, input } => {
            serde_json::json!({ "type": "tool_use", "id": id, "name": name, "input": input })
        }
        ContentBlock::ToolResult { tool_use_id, content, is_error } => serde_json::json!({
            "type": "tool_result",
            "tool_use_id": tool_use_id,
            "content": content,
            "is_error": is_error,
        }),
        ContentBlock::ServerToolUse { id, name, input } => {
            serde_json::json!({ "type": "server_tool_use", "id": id, "name": name, "input": input })
        }
        ContentBlock::Image { media_type, data_base64 } => serde_json::json!({
            "type": "image",
            "source": {
                "type": "base64",
                "media_type": media_type,
                "data": data_base64,
            },
        }),
    }
}

fn build_body(request: &LlmRequest, model: &str) -> serde_json::Value {
    let cache_control = if request.enable_prompt_caching {
        Some(serde_json::json!({ "type": "ephemeral" }))
    } else {
        None
    };

    let mut system_block = serde_json::json!({ "type": "text", "text": request.system });
    if let Some(cc) = &cache_control {
        system_block["cache_control"] = cc.clone();
    }

    let messages: Vec<serde_json::Value> = request
        .messages
        .iter()
        .map(|m| {
            serde_json::json!({
                "role": role_str(m.role),
                "content": m.content.iter().map(block_to_json).collect::<Vec<_>>(),
            })
        })
        .collect();

    let mut body = serde_json::json!({
        "model": model,
        "max_tokens": request.max_tokens,
        "system": [system_block],
        "messages": messages,
    });

    if !request.tools.is_empty() {
        let tool_count = request.tools.len();
        let tool_values: Vec<serde_json::Value> = request
            .tools
            .iter()
            .enumerate()
            .map(|(index, t)| {
                let mut tool = serde_json::json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.input_schema,
                });
                if index == tool_count - 1 {
                    if let Some(cc) = &cache_control {
                        tool["cache_control"] = cc.clone();
                    }
                }
                tool
            })
            .collect();
        body["tools"] = serde_json::json!(tool_values);
    }

    if request.extended_thinking {
        body["thinking"] = serde_json::json!({
            "type": "enabled",
            "budget_tokens": request.thinking_budget_tokens,
        });
    }

    body
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    content: Vec<ApiContentBlock>,
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ApiContentBlock {
    Text {
        text: String,
        #[serde(default)]
        citations: Vec<ApiCitation>,
    },
    Thinking {
        thinking: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ServerToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct ApiCitation {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    url: Option<String>,
}

fn stop_reason_from(raw: Option<&str>) -> StopReason {
    match raw {
        Some("end_turn") | Some("stop_sequence") => StopReason::EndTurn,
        Some("tool_use") => StopReason::ToolUse,
        Some("max_tokens") => StopReason::MaxTokens,
        _ => StopReason::Other,
    }
}

#[async_trait]
impl LlmClient for AnthropicClient {
    async fn complete(&self, request: LlmRequest) -> crate::error::Result<LlmResponse> {
        let body = build_body(&request, &self.model);

        let response = self
            .http
            .post(self.messages_url())
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| crate::error::LlmError::ProviderRequest(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("anthropic returned {status}: {text}").into());
        }

        let parsed: ApiResponse = response
            .json()
            .await
            .map_err(|e| anyhow::anyhow!("failed to parse anthropic response: {e}"))?;

        let content = parsed
            .content
            .into_iter()
            .filter_map(|block| {
                Some(match block {
                    ApiContentBlock::Text { text, citations } => ContentBlock::Text {
                        text,
                        citations: citations
                            .into_iter()
                            .filter_map(|c| {
                                Some(Citation {
                                    title: c.title?,
                                    url: c.url?,
                                })
                            })
                            .collect(),
                    },
                    ApiContentBlock::Thinking { thinking } => ContentBlock::Thinking { thinking },
                    ApiContentBlock::ToolUse { id, name, input } => ContentBlock::ToolUse { id, name, input },
                    ApiContentBlock::ServerToolUse { id, name, input } => {
                        ContentBlock::ServerToolUse { id, name, input }
                    }
                    ApiContentBlock::Unknown => return None,
                })
            })
            .collect();

        Ok(LlmResponse {
            content,
            stop_reason: stop_reason_from(parsed.stop_reason.as_deref()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmMessage;

    #[test]
    fn build_body_includes_cache_control_on_system_when_enabled() {
        let request = LlmRequest {
            system: "be helpful".into(),
            messages: vec![LlmMessage { role: Role::User, content: vec![ContentBlock::Text { text: "hi".into(), citations: vec![] }] }],
            tools: vec![],
            max_tokens: 1024,
            extended_thinking: false,
            thinking_budget_tokens: 0,
            enable_prompt_caching: true,
        };
        let body = build_body(&request, "claude-sonnet-4-6");
        assert_eq!(body["system"][0]["cache_control"]["type"], "ephemeral");
    }

    #[test]
    fn build_body_omits_thinking_block_when_disabled() {
        let request = LlmRequest {
            system: "s".into(),
            messages: vec![],
            tools: vec![],
            max_tokens: 1024,
            extended_thinking: false,
            thinking_budget_tokens: 0,
            enable_prompt_caching: false,
        };
        let body = build_body(&request, "claude-sonnet-4-6");
        assert!(body.get("thinking").is_none());
    }

    #[test]
    fn stop_reason_maps_tool_use() {
        assert_eq!(stop_reason_from(Some("tool_use")), StopReason::ToolUse);
        assert_eq!(stop_reason_from(Some("end_turn")), StopReason::EndTurn);
        assert_eq!(stop_reason_from(None), StopReason::Other);
    }
}
