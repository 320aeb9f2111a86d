use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessKind {
    Api,
    Cli,
}

impl ProcessKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessKind::Api => "api",
            ProcessKind::Cli => "cli",
        }
    }
}

/// Structured event emitted alongside free-form tracing lines. Fields are
/// optional so call sites only fill what they know.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ObservabilityEvent<'a> {
    pub event: &'a str,
    pub component: &'a str,
    pub flow_id: Option<&'a str>,
    pub thread_id: Option<&'a str>,
    pub run_id: Option<&'a str>,
    pub provider_id: Option<&'a str>,
    pub method: Option<&'a str>,
    pub status: Option<&'a str>,
    pub error_code: Option<&'a str>,
    pub latency_ms: Option<u64>,
    pub detail: Option<&'a str>,
}

pub fn emit_event(level: Level, process: ProcessKind, event: ObservabilityEvent<'_>) {
    macro_rules! log_at {
        ($mac:ident) => {
            tracing::$mac!(
                target: "flowloom.obs",
                process = process.as_str(),
                component = event.component,
                event = event.event,
                flow_id = event.flow_id.unwrap_or(""),
                thread_id = event.thread_id.unwrap_or(""),
                run_id = event.run_id.unwrap_or(""),
                provider_id = event.provider_id.unwrap_or(""),
                method = event.method.unwrap_or(""),
                status = event.status.unwrap_or(""),
                error_code = event.error_code.unwrap_or(""),
                latency_ms = event.latency_ms.unwrap_or(0),
                detail = event.detail.unwrap_or(""),
                "observability_event"
            )
        };
    }
    match level {
        Level::ERROR => log_at!(error),
        Level::WARN => log_at!(warn),
        _ => log_at!(info),
    }
}

/// Record a latency observation for a named operation.
pub fn observe_latency(event: &str, component: &str, millis: u64) {
    tracing::info!(
        target: "flowloom.obs",
        component,
        event,
        latency_ms = millis,
        "latency_observation"
    );
}

/// Logging setup for one process: a compact console layer plus a daily
/// rolling JSONL file. Retention and destination come from the service
/// configuration via the builder.
#[derive(Debug, Clone)]
pub struct LogOptions {
    process: ProcessKind,
    dir: PathBuf,
    retention_days: u64,
}

/// Keeps the background writer alive and reports what init did.
pub struct LogHandle {
    pub guard: WorkerGuard,
    pub dir: PathBuf,
    pub file_prefix: String,
    pub swept_files: usize,
    pub started_at: DateTime<Utc>,
}

impl LogOptions {
    pub fn new(process: ProcessKind, dir: impl Into<PathBuf>) -> Self {
        Self {
            process,
            dir: dir.into(),
            retention_days: 14,
        }
    }

    /// 0 disables the retention sweep entirely.
    pub fn retention_days(mut self, days: u64) -> Self {
        self.retention_days = days;
        self
    }

    pub fn init(self) -> anyhow::Result<LogHandle> {
        fs::create_dir_all(&self.dir)?;
        let file_prefix = format!("flowloom.{}", self.process.as_str());
        let swept_files = sweep_expired(&self.dir, &file_prefix, self.retention_days);

        let appender = tracing_appender::rolling::Builder::new()
            .rotation(tracing_appender::rolling::Rotation::DAILY)
            .filename_prefix(file_prefix.clone())
            .filename_suffix("jsonl")
            .build(&self.dir)?;
        let (writer, guard) = tracing_appender::non_blocking(appender);

        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .compact()
                    .with_target(true)
                    .with_ansi(true),
            )
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_current_span(false)
                    .with_span_list(false),
            )
            .try_init()
            .ok();

        Ok(LogHandle {
            guard,
            dir: self.dir,
            file_prefix,
            swept_files,
            started_at: Utc::now(),
        })
    }
}

/// Removes rolled log files older than the retention window, judged by file
/// modification time. Files that do not match this process's prefix are left
/// alone. Returns how many files were removed.
fn sweep_expired(dir: &Path, prefix: &str, retention_days: u64) -> usize {
    if retention_days == 0 {
        return 0;
    }
    let Some(cutoff) =
        SystemTime::now().checked_sub(Duration::from_secs(retention_days.saturating_mul(86_400)))
    else {
        return 0;
    };
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };

    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        let matches = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with(prefix) && n.ends_with(".jsonl"))
            .unwrap_or(false);
        if !matches || !path.is_file() {
            continue;
        }
        let expired = entry
            .metadata()
            .and_then(|m| m.modified())
            .map(|modified| modified < cutoff)
            .unwrap_or(false);
        if expired && fs::remove_file(&path).is_ok() {
            removed += 1;
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_kind_names() {
        assert_eq!(ProcessKind::Api.as_str(), "api");
        assert_eq!(ProcessKind::Cli.as_str(), "cli");
    }

    #[test]
    fn sweep_is_disabled_at_zero_retention() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("flowloom.api.2020-01-01.jsonl"), "{}").unwrap();
        assert_eq!(sweep_expired(dir.path(), "flowloom.api", 0), 0);
        assert!(dir.path().join("flowloom.api.2020-01-01.jsonl").exists());
    }

    #[test]
    fn sweep_keeps_fresh_and_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("flowloom.api.2026-08-01.jsonl"), "{}").unwrap();
        fs::write(dir.path().join("other.jsonl"), "{}").unwrap();
        // both files were just written, so nothing is past the cutoff
        assert_eq!(sweep_expired(dir.path(), "flowloom.api", 14), 0);
        assert!(dir.path().join("flowloom.api.2026-08-01.jsonl").exists());
        assert!(dir.path().join("other.jsonl").exists());
    }

    #[test]
    fn sweep_of_a_missing_dir_is_a_no_op() {
        assert_eq!(sweep_expired(Path::new("/nonexistent/logs"), "flowloom.api", 14), 0);
    }

    #[test]
    fn builder_carries_retention_override() {
        let options = LogOptions::new(ProcessKind::Cli, "/tmp/logs").retention_days(3);
        assert_eq!(options.retention_days, 3);
        assert_eq!(options.dir, PathBuf::from("/tmp/logs"));
    }
}
