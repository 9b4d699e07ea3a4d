//! Structured logging on stderr, as console text or JSON lines.
//!
//! stdout carries command payloads only.

pub mod config;
pub mod events;

pub use config::{LogConfig, LogFormat, LogLevel};
pub use events::{event_names, LogContext, Stage};

use std::io::IsTerminal;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::fmt;

/// Install the global subscriber. Later calls keep the first one.
pub fn init_logging(config: &LogConfig) {
    let human = config.format == LogFormat::Human;
    let ansi = std::io::stderr().is_terminal();
    let stamped = (human && config.timestamps).then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_ansi(ansi)
    });
    let bare = (human && !config.timestamps).then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_ansi(ansi)
            .without_time()
    });
    let jsonl = (!human).then(|| {
        fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_writer(std::io::stderr)
    });

    let installed = tracing_subscriber::registry()
        .with(LevelFilter::from(config.level))
        .with(stamped)
        .with(bare)
        .with(jsonl)
        .try_init();
    if let Err(e) = installed {
        eprintln!("gu-core: log subscriber not installed: {}", e);
    }
}

/// Generate a unique run ID for this invocation.
pub fn generate_run_id() -> String {
    let uuid = uuid::Uuid::new_v4().simple().to_string();
    format!("run-{}", &uuid[..12])
}

/// Host identifier stamped into diagnostics and failure records.
///
/// Uses machine-id on Linux, falling back to a hostname digest.
pub fn get_host_id() -> String {
    if let Ok(id) = std::fs::read_to_string("/etc/machine-id") {
        let id = id.trim();
        if id.len() >= 8 {
            return format!("host-{}", &id[..8]);
        }
    }

    let hostname = std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .ok();
    if let Some(hostname) = hostname {
        use sha2::{Digest, Sha256};
        let digest = hex::encode(Sha256::digest(hostname.as_bytes()));
        return format!("host-{}", &digest[..8]);
    }

    format!("host-{}", &uuid::Uuid::new_v4().simple().to_string()[..8])
}

/// Emit a tracing event whose target is a stable event name, tagged with
/// the correlation fields of a [`LogContext`].
///
/// ```ignore
/// log_event!(ctx, INFO, event_names::BACKUP_COMMITTED, Stage::Backup, "backup committed",
///     batch = 1, operations = 12);
/// ```
#[macro_export]
macro_rules! log_event {
    ($ctx:expr, $level:ident, $event:expr, $stage:expr, $msg:expr $(, $key:ident = $val:expr)*) => {
        tracing::event!(
            target: $event,
            tracing::Level::$level,
            run_id = %$ctx.run_id,
            session_id = ?$ctx.session_id,
            target_id = ?$ctx.target_id,
            stage = %$stage,
            $($key = $val,)*
            "{}", $msg
        )
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_run_id() {
        let id1 = generate_run_id();
        let id2 = generate_run_id();
        assert!(id1.starts_with("run-"));
        assert_eq!(id1.len(), 16);
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_get_host_id() {
        let host_id = get_host_id();
        assert!(host_id.starts_with("host-"));
        assert!(host_id.len() >= 13);
    }

    #[test]
    fn test_log_event_macro_compiles() {
        let ctx = LogContext::new("run-test", "host-test").with_session_id("gu-x");
        log_event!(ctx, DEBUG, event_names::JOURNAL_PUSHED, Stage::Backup, "pushed", batch = 1u64);
        log_event!(ctx, WARN, event_names::FETCH_RETRY, Stage::Fetch, "retrying", attempt = 2u32);
    }
}
