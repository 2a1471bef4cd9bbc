// Leveled JSON-line logging to stderr and an optional append-only file.
use chrono::Local;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(format!("unknown log level {other:?}")),
        }
    }
}

#[derive(Serialize)]
struct LogEntry<'a> {
    timestamp: String, // ISO-8601 with timezone
    level: &'static str,
    component: &'a str,
    message: &'a str,
}

/// Structured logger shared by every component. Logging never fails the
/// caller: write errors are swallowed and the daemon carries on.
pub struct Logger {
    level: LogLevel,
    file: Option<Mutex<File>>,
}

impl Logger {
    /// `level` falls back to Info when unparseable; an unopenable `log_file`
    /// downgrades to stderr-only with a note on stderr.
    pub fn new(level: &str, log_file: Option<&Path>) -> Self {
        let level = LogLevel::from_str(level).unwrap_or(LogLevel::Info);
        let file = log_file.and_then(|path| {
            if let Some(parent) = path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            match OpenOptions::new().create(true).append(true).open(path) {
                Ok(file) => Some(Mutex::new(file)),
                Err(e) => {
                    eprintln!("kamal-napper: cannot open log file {}: {e}", path.display());
                    None
                }
            }
        });
        Self { level, file }
    }

    pub fn debug(&self, component: &str, message: &str) {
        self.log(LogLevel::Debug, component, message);
    }

    pub fn info(&self, component: &str, message: &str) {
        self.log(LogLevel::Info, component, message);
    }

    pub fn warn(&self, component: &str, message: &str) {
        self.log(LogLevel::Warn, component, message);
    }

    pub fn error(&self, component: &str, message: &str) {
        self.log(LogLevel::Error, component, message);
    }

    fn log(&self, level: LogLevel, component: &str, message: &str) {
        if level < self.level {
            return;
        }

        let entry = LogEntry {
            timestamp: Local::now().to_rfc3339(),
            level: level.as_str(),
            component,
            message,
        };
        let line = match serde_json::to_string(&entry) {
            Ok(line) => line,
            Err(_) => return,
        };

        eprintln!("{line}");
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = writeln!(file, "{line}");
            }
        }
    }
}
