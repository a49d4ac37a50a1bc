//! Core decision-and-execution loop for a multi-tenant chat bot framework.
//!
//! A bot instance observes channels on a chat platform, decides when to
//! respond, calls an LLM with tools, executes tool calls, and writes
//! replies, while also running autonomous background behaviors (proactive
//! check-ins, follow-up reminders). See `SPEC_FULL.md` for the full
//! component breakdown.

pub mod agentic;
pub mod config;
pub mod context;
pub mod conversation_log;
pub mod daemon;
pub mod error;
pub mod llm;
pub mod memory;
pub mod messaging;
pub mod model;
pub mod rate_limit;
pub mod reactive;
pub mod store;
pub mod tools;

pub use error::{Error, Result};

use std::sync::Arc;

/// Bot identifier. Scopes storage paths and all per-bot state.
pub type BotId = Arc<str>;

/// Chat server (guild) identifier.
pub type ServerId = Arc<str>;

/// Channel identifier.
pub type ChannelId = Arc<str>;

/// Platform user identifier.
pub type UserId = Arc<str>;

/// Message identifier. Opaque, globally unique per the platform.
pub type MessageId = Arc<str>;

/// Milliseconds since the Unix epoch, UTC. Used for message timestamps and
/// rate-limit window bookkeeping, where a plain integer is cheaper to
/// manipulate than a full `DateTime`.
pub type MillisUtc = i64;

/// Returns the current time in milliseconds since the Unix epoch.
pub fn now_millis() -> MillisUtc {
    chrono::Utc::now().timestamp_millis()
}
