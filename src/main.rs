//! `parlor` CLI entry point: `spawn <bot_id>` loads that bot's YAML config,
//! wires the seven core components together, connects to the chat
//! platform, and runs until SIGTERM/SIGINT triggers cooperative shutdown.

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_stream::StreamExt as _;

#[derive(Parser)]
#[command(name = "parlor", version, about = "Multi-tenant chat bot framework core")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start one bot instance and run until shutdown.
    Spawn {
        /// Bot identity. Scopes storage paths; also used, absent --config,
        /// to locate the default config file at `configs/<bot_id>.yaml`.
        bot_id: String,

        /// Path to this bot's YAML config. Defaults to `configs/<bot_id>.yaml`.
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Override the data directory config resolves persistence/memories/logs under.
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Enable debug logging (overrides `logging.level`).
        #[arg(short, long)]
        debug: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let result = match cli.command {
        Command::Spawn { bot_id, config, data_dir, debug } => spawn(bot_id, config, data_dir, debug),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("parlor: {error:#}");
            ExitCode::FAILURE
        }
    }
}

/// Loads config, builds a Tokio runtime, and blocks on `run` until shutdown.
/// Any error here (bad config, missing env vars, failed runtime build) is an
/// unrecoverable init failure per §6's CLI contract.
fn spawn(bot_id: String, config_path: Option<PathBuf>, data_dir: Option<PathBuf>, debug: bool) -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    let path = config_path.unwrap_or_else(|| PathBuf::from(format!("configs/{bot_id}.yaml")));
    let mut config =
        parlor::config::Config::load_from_path(&path).with_context(|| format!("failed to load config from {}", path.display()))?;

    if config.bot_id != bot_id {
        anyhow::bail!("config at {} has bot_id `{}`, expected `{bot_id}`", path.display(), config.bot_id);
    }

    if let Some(dir) = data_dir {
        config.data_dir = dir;
        std::fs::create_dir_all(config.persistence_dir()).context("failed to create persistence directory")?;
        std::fs::create_dir_all(config.memories_dir()).context("failed to create memories directory")?;
        std::fs::create_dir_all(config.logs_dir()).context("failed to create logs directory")?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build().context("failed to build Tokio runtime")?;
    runtime.block_on(run(config, debug))
}

/// Wires `MessageStore`, `MemoryStore`, `RateLimiter`, `ToolRouter`, the LLM
/// client, and the platform adapter together, then drives the inbound event
/// loop alongside the engines' background tickers until shutdown.
async fn run(config: parlor::config::Config, debug: bool) -> anyhow::Result<()> {
    let config = Arc::new(config);
    let _log_guard = parlor::daemon::init_tracing(&config, debug);

    tracing::info!(bot_id = %config.bot_id, "starting parlor");
    tracing::info!(data_dir = %config.data_dir.display(), "configuration loaded");

    let message_store = Arc::new(
        parlor::store::MessageStore::open(&config.messages_db_path())
            .await
            .context("failed to open message store")?,
    );
    let memory_store = Arc::new(
        parlor::memory::MemoryStore::new(config.bot_memory_root(), config.bot_id.clone())
            .await
            .context("failed to open memory store")?,
    );
    let rate_limiter = Arc::new(parlor::rate_limit::RateLimiter::new(config.rate_limiting.clone()));

    let http = reqwest::Client::new();
    let tool_router = Arc::new(parlor::tools::ToolRouter::new(config.clone(), message_store.clone(), memory_store.clone(), http.clone()));

    let api_key = config.api_key().context("missing LLM provider API key")?;
    let llm_client: Arc<dyn parlor::llm::LlmClient> =
        Arc::new(parlor::llm::anthropic::AnthropicClient::new(http.clone(), api_key, config.api.model.clone()));

    let discord_token = config.discord_token().context("missing Discord gateway token")?;
    let platform: Arc<dyn parlor::messaging::PlatformClient> = Arc::new(parlor::messaging::discord::DiscordClient::new(discord_token));

    let conversation_log = Arc::new(parlor::conversation_log::ConversationLog::new(config.conversation_log_path()));

    let reactive = Arc::new(parlor::reactive::ReactiveEngine::new(
        config.clone(),
        message_store.clone(),
        rate_limiter.clone(),
        tool_router.clone(),
        llm_client.clone(),
        platform.clone(),
        conversation_log,
    ));
    let agentic = Arc::new(parlor::agentic::AgenticEngine::new(config.clone(), message_store.clone(), llm_client.clone(), platform.clone()));

    let mut shutdown_rx = parlor::daemon::shutdown_signal();

    let mut inbound = platform.connect().await.context("failed to connect to the chat platform")?;

    let scan_task = tokio::spawn(reactive.clone().run_scan_loop(shutdown_rx.clone()));
    let engagement_task = tokio::spawn(reactive.clone().run_engagement_tracker(shutdown_rx.clone()));
    let agentic_task = tokio::spawn(agentic.clone().run(shutdown_rx.clone()));
    let agentic_success_task = tokio::spawn(agentic.clone().run_success_tracker(shutdown_rx.clone()));

    // Lazily backfill each channel's history the first time an event from
    // it arrives, per `discord.backfill_{enabled,days,unlimited}` — the
    // config names no channel list up front, so seeding happens on first
    // sight rather than eagerly at connect.
    let mut backfilled: std::collections::HashSet<parlor::ChannelId> = std::collections::HashSet::new();

    loop {
        tokio::select! {
            event = inbound.next() => {
                match event {
                    Some(event) => {
                        if config.discord.backfill_enabled {
                            if let Some(channel_id) = channel_of(&event) {
                                if backfilled.insert(channel_id.clone()) {
                                    backfill_channel(&platform, &message_store, &config, &channel_id).await;
                                }
                            }
                        }
                        if let Err(error) = reactive.ingest(event).await {
                            tracing::warn!(%error, "ingest failed");
                        }
                    }
                    None => {
                        tracing::warn!("platform event stream ended");
                        break;
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    tracing::info!("shutdown signal received");
                    break;
                }
            }
        }
    }

    // Give in-flight turns a grace period to finish on their own — each
    // background loop observes the same shutdown signal and returns from
    // its own select! — before forcibly aborting stragglers.
    tokio::join!(
        drain_task("scan", scan_task),
        drain_task("engagement", engagement_task),
        drain_task("agentic", agentic_task),
        drain_task("agentic_success", agentic_success_task),
    );

    tracing::info!("parlor stopped");
    Ok(())
}

/// Default shutdown grace period (§5): in-flight turns complete within this
/// window or are cancelled.
const SHUTDOWN_GRACE_PERIOD: std::time::Duration = std::time::Duration::from_secs(2);

/// Waits up to `SHUTDOWN_GRACE_PERIOD` for `task` to finish on its own,
/// aborting it only if it's still running once the grace period elapses.
async fn drain_task(label: &str, task: tokio::task::JoinHandle<()>) {
    let abort_handle = task.abort_handle();
    if tokio::time::timeout(SHUTDOWN_GRACE_PERIOD, task).await.is_err() {
        tracing::warn!(task = label, "background task missed the shutdown grace period, aborting");
        abort_handle.abort();
    }
}

fn channel_of(event: &parlor::messaging::InboundEvent) -> Option<parlor::ChannelId> {
    use parlor::messaging::InboundEvent;
    match event {
        InboundEvent::Created(message) | InboundEvent::Edited(message) => Some(message.channel_id.clone()),
        InboundEvent::Deleted { channel_id, .. } => Some(channel_id.clone()),
        InboundEvent::Reaction(reaction) => Some(reaction.channel_id.clone()),
    }
}

async fn backfill_channel(
    platform: &Arc<dyn parlor::messaging::PlatformClient>,
    message_store: &Arc<parlor::store::MessageStore>,
    config: &parlor::config::Config,
    channel_id: &parlor::ChannelId,
) {
    let since = if config.discord.backfill_unlimited {
        0
    } else {
        parlor::now_millis() - config.discord.backfill_days as i64 * 86_400_000
    };

    match platform.backfill(channel_id, since).await {
        Ok(messages) => {
            for message in messages {
                if let Err(error) = message_store.put(&message).await {
                    tracing::warn!(%error, %channel_id, "backfill store failed");
                }
            }
        }
        Err(error) => tracing::warn!(%error, %channel_id, "backfill fetch failed"),
    }
}
