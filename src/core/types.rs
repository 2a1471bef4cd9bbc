// Core types shared across the supervisor subsystem.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Lifecycle states an app moves through. Closed set; persisted snake_case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Stopped,
    Starting,
    Running,
    Idle,
    Stopping,
}

impl LifecycleState {
    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleState::Stopped => "stopped",
            LifecycleState::Starting => "starting",
            LifecycleState::Running => "running",
            LifecycleState::Idle => "idle",
            LifecycleState::Stopping => "stopping",
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry in an app's transition history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: LifecycleState,
    pub to: LifecycleState,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default)]
    pub forced: bool,
}

/// Guarded transition was rejected. Indicates a caller bug; the per-host
/// handler resets the offending app.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("invalid transition for {hostname}: {from} -> {to}")]
    InvalidTransition {
        hostname: String,
        from: LifecycleState,
        to: LifecycleState,
    },
}

/// An external command ran out of retry attempts.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("command `{command}` failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        command: String,
        attempts: u32,
        last_error: String,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("state io error on {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        source: std::io::Error,
    },
    #[error("state serialization error: {0}")]
    Serialize(#[from] serde_yaml::Error),
}

/// Per-app slice of the status snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct AppSummary {
    pub state: LifecycleState,
    pub state_changed_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub startup_started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_request_at: Option<DateTime<Utc>>,
}

/// Deep-copied view of the supervisor returned by `status()`; safe to hold
/// after the lock is released.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub running: bool,
    pub app_count: usize,
    pub poll_interval: u64,
    pub apps: BTreeMap<String, AppSummary>,
}

/// A hostname is managed iff it survives this predicate: plausible public DNS
/// name, not an address literal, and not the daemon itself.
pub fn valid_hostname(host: &str, own_hostname: Option<&str>) -> bool {
    if host.is_empty() || !host.contains('.') {
        return false;
    }
    if host.len() < 4 || host.len() > 99 {
        return false;
    }
    if host == "localhost" || host.contains(':') {
        return false;
    }
    if starts_with_ipv4(host) {
        return false;
    }
    !is_self_host(host, own_hostname)
}

/// The daemon must never manage itself: exact match on the configured own
/// hostname, plus a substring net for conventional deployment names.
pub fn is_self_host(host: &str, own_hostname: Option<&str>) -> bool {
    if let Some(own) = own_hostname {
        if host == own {
            return true;
        }
    }
    host.contains("kamal-napper") || host.contains("naptime")
}

/// Hostname form used for per-host timestamp files. Dots and dashes are kept
/// so the name reads back as the original hostname.
pub fn sanitize_hostname(host: &str) -> String {
    host.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn starts_with_ipv4(host: &str) -> bool {
    let mut octets = 0;
    for part in host.split('.').take(4) {
        if part.is_empty() || part.len() > 3 || !part.bytes().all(|b| b.is_ascii_digit()) {
            return false;
        }
        octets += 1;
    }
    octets == 4
}
