//! Structured event logging.
//!
//! One JSON record per line into a date-partitioned file under
//! `<state-root>/logs/`, plus a coloured human rendering on stderr.
//! File emission is best-effort: a full disk must never take the build
//! down with it.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::{DateTime, NaiveDate, Utc};
use console::style;
use serde::{Deserialize, Serialize};

use crate::guardrails;

/// Directory under the state root receiving log files.
pub const LOGS_DIR: &str = "logs";
const RUN_LOG_FILE: &str = "run.log";
/// Compress files older than this many days during rotation.
const COMPRESS_AFTER_DAYS: i64 = 7;
/// Delete partitions older than this many days during rotation.
const DELETE_AFTER_DAYS: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

impl LogLevel {
    /// Map the CLI's verbose/quiet pair onto a level.
    pub fn from_flags(verbose: bool, quiet: bool) -> Self {
        if quiet {
            LogLevel::Error
        } else if verbose {
            LogLevel::Debug
        } else {
            LogLevel::Info
        }
    }

    pub fn from_env_or(default: Self) -> Self {
        match std::env::var("SHIPWRIGHT_LOG_LEVEL").as_deref() {
            Ok("error") => LogLevel::Error,
            Ok("warn") => LogLevel::Warn,
            Ok("info") => LogLevel::Info,
            Ok("debug") => LogLevel::Debug,
            _ => default,
        }
    }

    fn tag(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }
}

/// One emitted log record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub ts: DateTime<Utc>,
    pub run_id: String,
    pub level: LogLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subsystem: Option<String>,
    pub msg: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, serde_json::Value>,
}

/// Cheaply cloneable logger handle. Clones share the same destination;
/// `scoped` derives a child carrying command context.
#[derive(Debug, Clone)]
pub struct Logger {
    level: LogLevel,
    log_root: PathBuf,
    run_id: String,
    tool: Option<String>,
    host: Option<String>,
    subsystem: Option<String>,
    color: bool,
}

impl Logger {
    pub fn new(state_root: &Path, run_id: &str, level: LogLevel) -> Self {
        Self {
            level,
            log_root: state_root.join(LOGS_DIR),
            run_id: run_id.to_string(),
            tool: None,
            host: None,
            subsystem: None,
            color: guardrails::color_enabled(),
        }
    }

    /// A logger that only renders to stderr; used before the state root is
    /// known and in tests.
    pub fn stderr_only(level: LogLevel) -> Self {
        Self {
            level,
            log_root: PathBuf::new(),
            run_id: String::new(),
            tool: None,
            host: None,
            subsystem: None,
            color: guardrails::color_enabled(),
        }
    }

    pub fn with_run_id(mut self, run_id: &str) -> Self {
        self.run_id = run_id.to_string();
        self
    }

    /// Derive a child logger with command context attached to every record.
    pub fn scoped(&self, tool: Option<&str>, host: Option<&str>, subsystem: Option<&str>) -> Self {
        let mut child = self.clone();
        if tool.is_some() {
            child.tool = tool.map(str::to_string);
        }
        if host.is_some() {
            child.host = host.map(str::to_string);
        }
        if subsystem.is_some() {
            child.subsystem = subsystem.map(str::to_string);
        }
        child
    }

    pub fn error(&self, msg: &str) {
        self.log(LogLevel::Error, msg, BTreeMap::new());
    }

    pub fn warn(&self, msg: &str) {
        self.log(LogLevel::Warn, msg, BTreeMap::new());
    }

    pub fn info(&self, msg: &str) {
        self.log(LogLevel::Info, msg, BTreeMap::new());
    }

    pub fn debug(&self, msg: &str) {
        self.log(LogLevel::Debug, msg, BTreeMap::new());
    }

    pub fn log(&self, level: LogLevel, msg: &str, fields: BTreeMap<String, serde_json::Value>) {
        if level > self.level {
            return;
        }
        let record = LogRecord {
            ts: Utc::now(),
            run_id: self.run_id.clone(),
            level,
            tool: self.tool.clone(),
            host: self.host.clone(),
            subsystem: self.subsystem.clone(),
            msg: msg.to_string(),
            fields,
        };
        self.render_human(&record);
        self.append_jsonl(&record);
    }

    /// Run `f`, measuring wall milliseconds, and log the outcome with
    /// `{duration_ms, exit_code}` attached. Errors pass through unchanged.
    pub fn log_timed<T>(
        &self,
        subsystem: &str,
        msg: &str,
        f: impl FnOnce() -> anyhow::Result<T>,
    ) -> anyhow::Result<T> {
        let start = Instant::now();
        let result = f();
        let duration_ms = start.elapsed().as_millis() as u64;
        let exit_code = if result.is_ok() { 0 } else { 1 };
        let mut fields = BTreeMap::new();
        fields.insert("duration_ms".to_string(), duration_ms.into());
        fields.insert("exit_code".to_string(), exit_code.into());
        let scoped = self.scoped(None, None, Some(subsystem));
        match &result {
            Ok(_) => scoped.log(LogLevel::Info, msg, fields),
            Err(e) => scoped.log(LogLevel::Error, &format!("{msg}: {e:#}"), fields),
        }
        result
    }

    fn render_human(&self, record: &LogRecord) {
        let tag = record.level.tag();
        let tag = if self.color {
            match record.level {
                LogLevel::Error => style(tag).red().bold().to_string(),
                LogLevel::Warn => style(tag).yellow().to_string(),
                LogLevel::Info => style(tag).green().to_string(),
                LogLevel::Debug => style(tag).dim().to_string(),
            }
        } else {
            tag.to_string()
        };
        let mut context = String::new();
        if let Some(tool) = &record.tool {
            context.push_str(tool);
        }
        if let Some(host) = &record.host {
            if !context.is_empty() {
                context.push('/');
            }
            context.push_str(host);
        }
        if context.is_empty() {
            eprintln!("[{tag}] {}", record.msg);
        } else {
            eprintln!("[{tag}] {context}: {}", record.msg);
        }
    }

    fn append_jsonl(&self, record: &LogRecord) {
        if self.log_root.as_os_str().is_empty() {
            return;
        }
        // Best-effort by contract: any failure below is swallowed.
        let _ = self.try_append(record);
    }

    fn try_append(&self, record: &LogRecord) -> std::io::Result<()> {
        let day_dir = self.log_root.join(Utc::now().format("%Y-%m-%d").to_string());
        fs::create_dir_all(&day_dir)?;
        let line = match serde_json::to_string(record) {
            Ok(l) => l,
            Err(_) => return Ok(()),
        };
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(day_dir.join(RUN_LOG_FILE))?;
        writeln!(file, "{line}")
    }

}

/// Rotate the log tree at most once per day: gzip partitions older than
/// 7 days, delete partitions older than 30. Guarded by a dated marker
/// file so repeated invocations are free.
pub fn rotate_logs(state_root: &Path) -> anyhow::Result<()> {
    let log_root = state_root.join(LOGS_DIR);
    if !log_root.is_dir() {
        return Ok(());
    }
    let today = Utc::now().date_naive();
    let marker = log_root.join(format!(".rotated-{today}"));
    if marker.exists() {
        return Ok(());
    }

    for entry in fs::read_dir(&log_root)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Ok(date) = name.parse::<NaiveDate>() else {
            // Stale markers from previous days are cleaned up here too.
            if name.starts_with(".rotated-") && entry.path() != marker {
                let _ = fs::remove_file(entry.path());
            }
            continue;
        };
        let age_days = (today - date).num_days();
        if age_days > DELETE_AFTER_DAYS {
            let _ = fs::remove_dir_all(entry.path());
        } else if age_days > COMPRESS_AFTER_DAYS {
            compress_partition(&entry.path())?;
        }
    }

    fs::write(&marker, b"")?;
    Ok(())
}

fn compress_partition(dir: &Path) -> anyhow::Result<()> {
    for entry in walk_files(dir)? {
        if entry.extension().is_some_and(|e| e == "gz") {
            continue;
        }
        let data = fs::read(&entry)?;
        let gz_path = {
            let mut name = entry.as_os_str().to_owned();
            name.push(".gz");
            PathBuf::from(name)
        };
        let file = fs::File::create(&gz_path)?;
        let mut encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        encoder.write_all(&data)?;
        encoder.finish()?;
        fs::remove_file(&entry)?;
    }
    Ok(())
}

fn walk_files(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.is_dir() {
                stack.push(path);
            } else {
                out.push(path);
            }
        }
    }
    Ok(out)
}
