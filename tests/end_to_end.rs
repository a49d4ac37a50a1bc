//! End-to-end scenarios from §8: the urgent mention path, a rapid burst of
//! mentions, and duplicate-suppression, all driven against `ReactiveEngine`
//! with an in-memory `LlmClient` test double and a capturing `PlatformClient`
//! test double rather than real network calls.

use async_trait::async_trait;
use parlor::config::Config;
use parlor::conversation_log::ConversationLog;
use parlor::llm::{Citation, ContentBlock, LlmClient, LlmRequest, LlmResponse, StopReason};
use parlor::memory::MemoryStore;
use parlor::messaging::{InboundEvent, InboundStream, OutboundMessage, PlatformClient};
use parlor::model::Message;
use parlor::rate_limit::RateLimiter;
use parlor::reactive::ReactiveEngine;
use parlor::store::MessageStore;
use parlor::tools::ToolRouter;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

const BASE_YAML: &str = r#"
bot_id: testbot
discord:
  token_env_var: TESTBOT_DISCORD_TOKEN
api:
  model: claude-sonnet-4-6
"#;

fn test_config(data_dir: &std::path::Path) -> Config {
    let mut config: Config = serde_yaml::from_str(BASE_YAML).unwrap();
    config.data_dir = data_dir.to_path_buf();
    config
}

/// Replays a fixed queue of canned responses, one per `complete()` call.
struct ScriptedLlmClient {
    responses: Mutex<VecDeque<LlmResponse>>,
}

impl ScriptedLlmClient {
    fn new(responses: Vec<LlmResponse>) -> Self {
        Self { responses: Mutex::new(responses.into()) }
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn complete(&self, _request: LlmRequest) -> parlor::Result<LlmResponse> {
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| anyhow::anyhow!("scripted LLM client ran out of canned responses").into())
    }
}

fn text_response(text: &str) -> LlmResponse {
    LlmResponse {
        content: vec![ContentBlock::Text { text: text.to_string(), citations: vec![] }],
        stop_reason: StopReason::EndTurn,
    }
}

/// Captures every sent message; `fetch_around`/`backfill` are unused by
/// these scenarios and return empty results.
struct CapturingPlatform {
    bot_user_id: String,
    sent: Mutex<Vec<OutboundMessage>>,
    next_id: AtomicU64,
}

impl CapturingPlatform {
    fn new(bot_user_id: &str) -> Self {
        Self { bot_user_id: bot_user_id.to_string(), sent: Mutex::new(Vec::new()), next_id: AtomicU64::new(1) }
    }
}

#[async_trait]
impl PlatformClient for CapturingPlatform {
    async fn connect(&self) -> parlor::Result<InboundStream> {
        let (_tx, rx) = tokio::sync::mpsc::channel::<InboundEvent>(1);
        Ok(Box::pin(tokio_stream::wrappers::ReceiverStream::new(rx)))
    }

    async fn send(&self, message: OutboundMessage) -> parlor::Result<Message> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let sent = Message {
            message_id: format!("sent-{id}").into(),
            channel_id: message.channel_id.clone(),
            server_id: "server-1".into(),
            author_id: self.bot_user_id.clone().into(),
            author_display_name: "testbot".into(),
            text: message.text.clone(),
            timestamp: parlor::now_millis(),
            is_bot: true,
            reply_to_message_id: message.reply_to_message_id.clone(),
            attachments: Vec::new(),
            reactions: Vec::new(),
        };
        self.sent.lock().unwrap().push(message);
        Ok(sent)
    }

    async fn start_typing(&self, _channel_id: &parlor::ChannelId) {}

    async fn fetch_around(&self, _channel_id: &parlor::ChannelId, _message_id: &parlor::MessageId, _span: i64) -> parlor::Result<Vec<Message>> {
        Ok(Vec::new())
    }

    async fn bot_user_id(&self) -> String {
        self.bot_user_id.clone()
    }

    async fn backfill(&self, _channel_id: &parlor::ChannelId, _since: parlor::MillisUtc) -> parlor::Result<Vec<Message>> {
        Ok(Vec::new())
    }
}

fn incoming(channel: &str, author: &str, text: &str, message_id: &str) -> Message {
    Message {
        message_id: message_id.into(),
        channel_id: channel.into(),
        server_id: "server-1".into(),
        author_id: author.into(),
        author_display_name: author.to_string(),
        text: text.to_string(),
        timestamp: parlor::now_millis(),
        is_bot: false,
        reply_to_message_id: None,
        attachments: Vec::new(),
        reactions: Vec::new(),
    }
}

async fn build_engine(config: Config, llm: ScriptedLlmClient, platform: Arc<CapturingPlatform>) -> (Arc<ReactiveEngine>, Arc<CapturingPlatform>) {
    let config = Arc::new(config);
    let store = Arc::new(MessageStore::open(&config.messages_db_path()).await.unwrap());
    let memory = Arc::new(MemoryStore::new(config.bot_memory_root(), config.bot_id.clone()).await.unwrap());
    let rate_limiter = Arc::new(RateLimiter::new(config.rate_limiting.clone()));
    let tool_router = Arc::new(ToolRouter::new(config.clone(), store.clone(), memory, reqwest::Client::new()));
    let llm_client: Arc<dyn LlmClient> = Arc::new(llm);
    let conversation_log = Arc::new(ConversationLog::new(config.conversation_log_path()));

    let engine = Arc::new(ReactiveEngine::new(
        config,
        store,
        rate_limiter,
        tool_router,
        llm_client,
        platform.clone(),
        conversation_log,
    ));
    (engine, platform)
}

#[tokio::test]
async fn mention_with_web_citation_appends_sources_block() {
    let dir = tempfile::tempdir().unwrap();
    let response = LlmResponse {
        content: vec![
            ContentBlock::ServerToolUse { id: "srv-1".into(), name: "web_search".into(), input: serde_json::json!({"query": "largest country by area"}) },
            ContentBlock::Text {
                text: "The largest country by area is Russia.".into(),
                citations: vec![Citation { title: "Russia - Wikipedia".into(), url: "https://en.wikipedia.org/wiki/Russia".into() }],
            },
        ],
        stop_reason: StopReason::EndTurn,
    };
    let platform = Arc::new(CapturingPlatform::new("bot-1"));
    let mut config = test_config(dir.path());
    config.api.web_search.enabled = true;
    let (engine, platform) = build_engine(config, ScriptedLlmClient::new(vec![response]), platform).await;

    let message = incoming("chan-1", "user-1", "<@bot-1> what is the largest country by area?", "msg-1");
    engine.ingest(InboundEvent::Created(message)).await.unwrap();

    let sent = platform.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].text.contains("The largest country by area is Russia."));
    assert!(sent[0].text.ends_with("**Sources:**\n- [Russia - Wikipedia](https://en.wikipedia.org/wiki/Russia)"));
    assert_eq!(sent[0].reply_to_message_id.as_deref(), Some("msg-1"));
}

#[tokio::test]
async fn rapid_burst_sends_exactly_one_reply_per_message_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let responses = vec![text_response("reply to A"), text_response("reply to B"), text_response("reply to C")];
    let platform = Arc::new(CapturingPlatform::new("bot-1"));
    let (engine, platform) = build_engine(test_config(dir.path()), ScriptedLlmClient::new(responses), platform).await;

    for (id, label) in [("msg-a", "A"), ("msg-b", "B"), ("msg-c", "C")] {
        let message = incoming("chan-1", "user-1", &format!("<@bot-1> message {label}"), id);
        engine.ingest(InboundEvent::Created(message)).await.unwrap();
    }

    let sent = platform.sent.lock().unwrap();
    assert_eq!(sent.len(), 3);
    assert_eq!(sent[0].text, "reply to A");
    assert_eq!(sent[0].reply_to_message_id.as_deref(), Some("msg-a"));
    assert_eq!(sent[1].text, "reply to B");
    assert_eq!(sent[1].reply_to_message_id.as_deref(), Some("msg-b"));
    assert_eq!(sent[2].text, "reply to C");
    assert_eq!(sent[2].reply_to_message_id.as_deref(), Some("msg-c"));
}

#[tokio::test]
async fn duplicate_ingest_of_the_same_message_produces_one_reply() {
    let dir = tempfile::tempdir().unwrap();
    let responses = vec![text_response("only once")];
    let platform = Arc::new(CapturingPlatform::new("bot-1"));
    let (engine, platform) = build_engine(test_config(dir.path()), ScriptedLlmClient::new(responses), platform).await;

    let message = incoming("chan-1", "user-1", "<@bot-1> hello", "msg-dup");
    engine.ingest(InboundEvent::Created(message.clone())).await.unwrap();
    engine.ingest(InboundEvent::Created(message)).await.unwrap();

    let sent = platform.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].text, "only once");
}
