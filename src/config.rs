//! Configuration loading and validation.
//!
//! Per-bot YAML configuration, loaded once at startup. Every tunable named in
//! the config table has a `#[serde(default = ...)]` matching the documented
//! default so an absent key falls back to the documented behavior rather than
//! a deserialization error.

use crate::error::{ConfigError, Result};
use anyhow::Context as _;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Top-level bot configuration, loaded from a single YAML document.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Identity; scopes storage paths under `persistence/` and `memories/`.
    pub bot_id: String,

    pub discord: DiscordConfig,

    #[serde(default)]
    pub personality: PersonalityConfig,

    #[serde(default)]
    pub reactive: ReactiveConfig,

    #[serde(default)]
    pub agentic: AgenticConfig,

    pub api: ApiConfig,

    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    #[serde(default)]
    pub images: ImagesConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Root directory under which `persistence/`, `memories/`, and `logs/`
    /// are created. Not a YAML key; filled in by the loader from `--data-dir`
    /// or the OS data directory.
    #[serde(skip, default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("parlor"))
        .unwrap_or_else(|| PathBuf::from("./data"))
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscordConfig {
    pub token_env_var: String,
    #[serde(default)]
    pub servers: Vec<String>,
    #[serde(default)]
    pub backfill_enabled: bool,
    #[serde(default = "default_backfill_days")]
    pub backfill_days: u32,
    #[serde(default)]
    pub backfill_unlimited: bool,
    #[serde(default = "default_true")]
    pub backfill_in_background: bool,
}

fn default_backfill_days() -> u32 {
    7
}

#[derive(Debug, Clone, Deserialize)]
pub struct PersonalityConfig {
    #[serde(default)]
    pub base_prompt: String,
    #[serde(default)]
    pub engagement: EngagementRatesConfig,
}

impl Default for PersonalityConfig {
    fn default() -> Self {
        Self {
            base_prompt: String::new(),
            engagement: EngagementRatesConfig::default(),
        }
    }
}

/// Decide() response probabilities by channel momentum.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct EngagementRatesConfig {
    #[serde(default = "default_cold_rate")]
    pub cold_rate: f32,
    #[serde(default = "default_warm_rate")]
    pub warm_rate: f32,
    #[serde(default = "default_hot_rate")]
    pub hot_rate: f32,
    #[serde(default = "default_mention_rate")]
    pub mention_rate: f32,
}

fn default_cold_rate() -> f32 {
    0.10
}
fn default_warm_rate() -> f32 {
    0.25
}
fn default_hot_rate() -> f32 {
    0.40
}
fn default_mention_rate() -> f32 {
    1.00
}

impl Default for EngagementRatesConfig {
    fn default() -> Self {
        Self {
            cold_rate: default_cold_rate(),
            warm_rate: default_warm_rate(),
            hot_rate: default_hot_rate(),
            mention_rate: default_mention_rate(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReactiveConfig {
    #[serde(default = "default_check_interval_seconds")]
    pub check_interval_seconds: u64,
    #[serde(default = "default_context_window")]
    pub context_window: usize,
    #[serde(default)]
    pub cooldowns: CooldownsConfig,
}

fn default_check_interval_seconds() -> u64 {
    30
}
fn default_context_window() -> usize {
    20
}

impl Default for ReactiveConfig {
    fn default() -> Self {
        Self {
            check_interval_seconds: default_check_interval_seconds(),
            context_window: default_context_window(),
            cooldowns: CooldownsConfig::default(),
        }
    }
}

/// Channel cooldown ladder, in seconds, escalating with recent activity.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct CooldownsConfig {
    #[serde(default = "default_per_user")]
    pub per_user: u64,
    #[serde(default = "default_single_message")]
    pub single_message: u64,
    #[serde(default = "default_multi_message")]
    pub multi_message: u64,
    #[serde(default = "default_heavy_activity")]
    pub heavy_activity: u64,
}

fn default_per_user() -> u64 {
    5
}
fn default_single_message() -> u64 {
    0
}
fn default_multi_message() -> u64 {
    15
}
fn default_heavy_activity() -> u64 {
    60
}

impl Default for CooldownsConfig {
    fn default() -> Self {
        Self {
            per_user: default_per_user(),
            single_message: default_single_message(),
            multi_message: default_multi_message(),
            heavy_activity: default_heavy_activity(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgenticConfig {
    #[serde(default = "default_agentic_check_interval_hours")]
    pub check_interval_hours: f64,
    #[serde(default)]
    pub followups: FollowupsConfig,
    #[serde(default)]
    pub proactive: ProactiveConfig,
}

fn default_agentic_check_interval_hours() -> f64 {
    1.0
}

impl Default for AgenticConfig {
    fn default() -> Self {
        Self {
            check_interval_hours: default_agentic_check_interval_hours(),
            followups: FollowupsConfig::default(),
            proactive: ProactiveConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FollowupsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_age_days")]
    pub max_age_days: u32,
    #[serde(default)]
    pub priority_threshold: crate::model::Priority,
}

fn default_max_age_days() -> u32 {
    14
}

impl Default for FollowupsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_age_days: default_max_age_days(),
            priority_threshold: crate::model::Priority::Low,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProactiveConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_min_idle_hours")]
    pub min_idle_hours: f64,
    #[serde(default = "default_max_idle_hours")]
    pub max_idle_hours: f64,
    #[serde(default = "default_max_per_day_global")]
    pub max_per_day_global: u32,
    #[serde(default = "default_max_per_day_per_channel")]
    pub max_per_day_per_channel: u32,
    #[serde(default = "default_engagement_threshold")]
    pub engagement_threshold: f64,
    #[serde(default)]
    pub quiet_hours: QuietHoursConfig,
    #[serde(default)]
    pub allowed_channels: Vec<String>,
}

fn default_min_idle_hours() -> f64 {
    1.0
}
fn default_max_idle_hours() -> f64 {
    8.0
}
fn default_max_per_day_global() -> u32 {
    10
}
fn default_max_per_day_per_channel() -> u32 {
    3
}
fn default_engagement_threshold() -> f64 {
    0.30
}

impl Default for ProactiveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_idle_hours: default_min_idle_hours(),
            max_idle_hours: default_max_idle_hours(),
            max_per_day_global: default_max_per_day_global(),
            max_per_day_per_channel: default_max_per_day_per_channel(),
            engagement_threshold: default_engagement_threshold(),
            quiet_hours: QuietHoursConfig::default(),
            allowed_channels: Vec::new(),
        }
    }
}

/// Quiet hours in local-configured time, honored by the scan path only.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct QuietHoursConfig {
    #[serde(default = "default_quiet_start")]
    pub start_hour: u32,
    #[serde(default = "default_quiet_end")]
    pub end_hour: u32,
}

fn default_quiet_start() -> u32 {
    0
}
fn default_quiet_end() -> u32 {
    6
}

impl Default for QuietHoursConfig {
    fn default() -> Self {
        Self {
            start_hour: default_quiet_start(),
            end_hour: default_quiet_end(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Name of the env var holding the provider API key, same shape as
    /// `discord.token_env_var`.
    #[serde(default = "default_api_key_env_var")]
    pub api_key_env_var: String,
    #[serde(default)]
    pub extended_thinking: ExtendedThinkingConfig,
    #[serde(default)]
    pub context_editing: ContextEditingConfig,
    #[serde(default)]
    pub web_search: WebSearchConfig,
}

fn default_max_tokens() -> u32 {
    16_000
}

fn default_api_key_env_var() -> String {
    "ANTHROPIC_API_KEY".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExtendedThinkingConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_budget_tokens")]
    pub budget_tokens: u32,
}

fn default_budget_tokens() -> u32 {
    4_000
}

impl Default for ExtendedThinkingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            budget_tokens: default_budget_tokens(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContextEditingConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_trigger_tokens")]
    pub trigger_tokens: u32,
    #[serde(default = "default_keep_tool_uses")]
    pub keep_tool_uses: u32,
    #[serde(default)]
    pub exclude_tools: Vec<String>,
}

fn default_trigger_tokens() -> u32 {
    100_000
}
fn default_keep_tool_uses() -> u32 {
    3
}

impl Default for ContextEditingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            trigger_tokens: default_trigger_tokens(),
            keep_tool_uses: default_keep_tool_uses(),
            exclude_tools: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebSearchConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_max_daily")]
    pub max_daily: u32,
    #[serde(default = "default_max_per_request")]
    pub max_per_request: u32,
    #[serde(default = "default_true")]
    pub citations_enabled: bool,
    #[serde(default = "default_max_content_tokens")]
    pub max_content_tokens: u32,
    #[serde(default)]
    pub allowed_domains: Vec<String>,
    #[serde(default)]
    pub blocked_domains: Vec<String>,
}

fn default_max_daily() -> u32 {
    300
}
fn default_max_per_request() -> u32 {
    5
}
fn default_max_content_tokens() -> u32 {
    10_000
}

impl Default for WebSearchConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_daily: default_max_daily(),
            max_per_request: default_max_per_request(),
            citations_enabled: true,
            max_content_tokens: default_max_content_tokens(),
            allowed_domains: Vec::new(),
            blocked_domains: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitingConfig {
    #[serde(default)]
    pub short: RateWindowConfig,
    #[serde(default = "default_long_window")]
    pub long: RateWindowConfig,
    #[serde(default = "default_ignore_threshold")]
    pub ignore_threshold: u32,
    #[serde(default = "default_tracking_delay")]
    pub engagement_tracking_delay: u64,
}

fn default_ignore_threshold() -> u32 {
    5
}
fn default_tracking_delay() -> u64 {
    30
}
fn default_long_window() -> RateWindowConfig {
    RateWindowConfig {
        duration_minutes: 60,
        max_responses: 200,
    }
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            short: RateWindowConfig::default(),
            long: default_long_window(),
            ignore_threshold: default_ignore_threshold(),
            engagement_tracking_delay: default_tracking_delay(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RateWindowConfig {
    pub duration_minutes: u32,
    pub max_responses: u32,
}

impl Default for RateWindowConfig {
    fn default() -> Self {
        Self {
            duration_minutes: 5,
            max_responses: 20,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImagesConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_per_message")]
    pub max_per_message: u32,
    #[serde(default = "default_compression_target")]
    pub compression_target: f64,
}

fn default_max_per_message() -> u32 {
    5
}
fn default_compression_target() -> f64 {
    0.73
}

impl Default for ImagesConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_per_message: default_max_per_message(),
            compression_target: default_compression_target(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_file")]
    pub file: String,
    #[serde(default = "default_max_size_mb")]
    pub max_size_mb: u32,
    #[serde(default = "default_backup_count")]
    pub backup_count: u32,
}

fn default_log_level() -> String {
    "info".into()
}
fn default_log_file() -> String {
    "bot.log".into()
}
fn default_max_size_mb() -> u32 {
    10
}
fn default_backup_count() -> u32 {
    5
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: default_log_file(),
            max_size_mb: default_max_size_mb(),
            backup_count: default_backup_count(),
        }
    }
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load and validate configuration from a YAML file at `path`.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Load {
            path: path.display().to_string(),
            source,
        })?;

        let mut config: Config =
            serde_yaml::from_str(&raw).map_err(|e| ConfigError::Invalid(e.to_string()))?;

        config.data_dir = default_data_dir();

        if std::env::var(&config.discord.token_env_var).is_err() {
            return Err(ConfigError::MissingKey(config.discord.token_env_var.clone()).into());
        }
        if std::env::var(&config.api.api_key_env_var).is_err() {
            return Err(ConfigError::MissingKey(config.api.api_key_env_var.clone()).into());
        }

        std::fs::create_dir_all(self_persistence_dir(&config))
            .with_context(|| "failed to create persistence directory".to_string())?;
        std::fs::create_dir_all(self_memories_dir(&config))
            .with_context(|| "failed to create memories directory".to_string())?;
        std::fs::create_dir_all(self_logs_dir(&config))
            .with_context(|| "failed to create logs directory".to_string())?;

        Ok(config)
    }

    /// Gateway token read from the configured environment variable.
    pub fn discord_token(&self) -> Result<String> {
        std::env::var(&self.discord.token_env_var)
            .map_err(|_| ConfigError::MissingKey(self.discord.token_env_var.clone()).into())
    }

    /// LLM provider API key read from the configured environment variable.
    pub fn api_key(&self) -> Result<String> {
        std::env::var(&self.api.api_key_env_var)
            .map_err(|_| ConfigError::MissingKey(self.api.api_key_env_var.clone()).into())
    }

    pub fn persistence_dir(&self) -> PathBuf {
        self_persistence_dir(self)
    }

    pub fn memories_dir(&self) -> PathBuf {
        self_memories_dir(self)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self_logs_dir(self)
    }

    pub fn messages_db_path(&self) -> PathBuf {
        self.persistence_dir()
            .join(format!("{}_messages.db", self.bot_id))
    }

    pub fn web_search_stats_path(&self) -> PathBuf {
        self.persistence_dir()
            .join(format!("{}_web_search_stats.json", self.bot_id))
    }

    /// The root of this bot's scoped virtual filesystem: `memories/<bot>`.
    pub fn bot_memory_root(&self) -> PathBuf {
        self.memories_dir().join(self.bot_id.as_str())
    }

    /// `memories/<bot>/servers/<server>/`.
    pub fn server_memory_root(&self, server_id: &str) -> PathBuf {
        self.bot_memory_root().join("servers").join(server_id)
    }

    /// `memories/<bot>/servers/<server>/followups.json`.
    pub fn followups_path(&self, server_id: &str) -> PathBuf {
        self.server_memory_root(server_id).join("followups.json")
    }

    /// `memories/<bot>/servers/<server>/channels/<channel>_stats.json`.
    pub fn channel_stats_path(&self, server_id: &str, channel_id: &str) -> PathBuf {
        self.server_memory_root(server_id)
            .join("channels")
            .join(format!("{channel_id}_stats.json"))
    }

    pub fn log_file_path(&self) -> PathBuf {
        self.logs_dir().join(format!("{}.log", self.bot_id))
    }

    pub fn conversation_log_path(&self) -> PathBuf {
        self.logs_dir()
            .join(format!("{}_conversations.log", self.bot_id))
    }
}

fn self_persistence_dir(config: &Config) -> PathBuf {
    config.data_dir.join("persistence")
}

fn self_memories_dir(config: &Config) -> PathBuf {
    config.data_dir.join("memories")
}

fn self_logs_dir(config: &Config) -> PathBuf {
    config.data_dir.join("logs")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_in_when_keys_are_absent() {
        let yaml = r#"
bot_id: testbot
discord:
  token_env_var: TESTBOT_DISCORD_TOKEN
api:
  model: claude-sonnet-4-6
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.reactive.check_interval_seconds, 30);
        assert_eq!(config.reactive.context_window, 20);
        assert_eq!(config.rate_limiting.short.max_responses, 20);
        assert_eq!(config.rate_limiting.long.max_responses, 200);
        assert_eq!(config.rate_limiting.ignore_threshold, 5);
        assert_eq!(config.personality.engagement.hot_rate, 0.40);
        assert_eq!(config.agentic.proactive.engagement_threshold, 0.30);
        assert_eq!(config.images.max_per_message, 5);
    }
}
