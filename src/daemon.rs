//! Process wiring and lifecycle: tracing initialization and cooperative
//! shutdown. Reduced from the teacher's `daemon.rs` PID-file/Unix-socket
//! forking daemon (meant to host many independently-managed skill
//! processes) to in-process shutdown, since this crate is a library-first
//! core embedded in one `spawn <bot_id>` process rather than a supervisor
//! of its own children.

use crate::config::Config;
use tracing_subscriber::fmt::format;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

/// Caps how much of a single log line's `message` field is emitted, the
/// same guard the teacher's formatter applies so a runaway tool result
/// doesn't blow out the log file.
const MAX_MESSAGE_CHARS: usize = 280;

/// Initializes the global tracing subscriber: a daily-rolling file appender
/// under `config.logs_dir()` plus, in debug mode, a second layer to stdout.
/// Returns the appender guard — the caller must keep it alive for the
/// process lifetime or buffered log lines are dropped on exit.
pub fn init_tracing(config: &Config, debug: bool) -> tracing_appender::non_blocking::WorkerGuard {
    let file_appender = tracing_appender::rolling::daily(config.logs_dir(), format!("{}.log", config.bot_id));
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = build_env_filter(&config.logging.level, debug);
    let field_formatter = format::debug_fn(|writer, field, value| {
        let field_name = field.name();
        if field_name == "message" {
            let formatted = format!("{value:?}");
            let (truncated, was_truncated) = truncate_for_log(&formatted, MAX_MESSAGE_CHARS);
            if was_truncated {
                write!(writer, "{field_name}={truncated}...")
            } else {
                write!(writer, "{field_name}={formatted}")
            }
        } else {
            write!(writer, "{field_name}={value:?}")
        }
    });

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .fmt_fields(field_formatter)
        .compact();

    if debug {
        tracing_subscriber::registry()
            .with(filter)
            .with(file_layer)
            .with(tracing_subscriber::fmt::layer().compact())
            .init();
    } else {
        tracing_subscriber::registry().with(filter).with(file_layer).init();
    }

    guard
}

fn build_env_filter(level: &str, debug: bool) -> tracing_subscriber::EnvFilter {
    if debug {
        return tracing_subscriber::EnvFilter::new("debug");
    }
    tracing_subscriber::EnvFilter::try_new(level).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
}

fn truncate_for_log(message: &str, max_chars: usize) -> (&str, bool) {
    match message.char_indices().nth(max_chars) {
        Some((byte_index, _character)) => (&message[..byte_index], true),
        None => (message, false),
    }
}

/// Returns a `watch::Receiver` that flips to `true` once SIGTERM or SIGINT
/// (Ctrl-C) is observed; every background ticker (`ReactiveEngine`'s scan
/// loop and engagement tracker, `AgenticEngine`'s hourly loop and success
/// tracker) selects against it to unwind cooperatively rather than being
/// killed mid-turn.
pub fn shutdown_signal() -> tokio::sync::watch::Receiver<bool> {
    let (tx, rx) = tokio::sync::watch::channel(false);

    tokio::spawn(async move {
        #[cfg(unix)]
        {
            let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(s) => s,
                Err(error) => {
                    tracing::warn!(%error, "failed to install SIGTERM handler");
                    let _ = tokio::signal::ctrl_c().await;
                    let _ = tx.send(true);
                    return;
                }
            };
            tokio::select! {
                _ = sigterm.recv() => tracing::info!("received SIGTERM"),
                _ = tokio::signal::ctrl_c() => tracing::info!("received SIGINT"),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("received ctrl-c");
        }
        let _ = tx.send(true);
    });

    rx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_for_log_handles_multibyte_characters() {
        let message = "abc→def";
        let (truncated, was_truncated) = truncate_for_log(message, 4);
        assert!(was_truncated);
        assert_eq!(truncated, "abc→");
    }

    #[test]
    fn truncate_for_log_is_noop_under_the_cap() {
        let (truncated, was_truncated) = truncate_for_log("short", 280);
        assert_eq!(truncated, "short");
        assert!(!was_truncated);
    }
}
