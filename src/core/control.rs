// Command surface consumed by the dashboard/CLI collaborators.
use crate::core::clock::Clock;
use crate::core::supervisor::Supervisor;
use crate::core::types::StatusSnapshot;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlAction {
    Wake,
    Sleep,
}

impl std::fmt::Display for ControlAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControlAction::Wake => f.write_str("wake"),
            ControlAction::Sleep => f.write_str("sleep"),
        }
    }
}

impl FromStr for ControlAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "wake" => Ok(ControlAction::Wake),
            "sleep" => Ok(ControlAction::Sleep),
            other => Err(format!("unknown action {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ControlResponse {
    pub success: bool,
    pub hostname: String,
    pub action: ControlAction,
    pub message: String,
}

/// Thin facade over the live supervisor for external readers and the two
/// mutations they may issue. Reads come from the in-memory map, not from a
/// reconstructed on-disk view.
pub struct ControlApi {
    supervisor: Arc<Supervisor>,
    clock: Arc<dyn Clock>,
}

impl ControlApi {
    pub fn new(supervisor: Arc<Supervisor>, clock: Arc<dyn Clock>) -> Self {
        Self { supervisor, clock }
    }

    pub async fn status(&self) -> StatusSnapshot {
        self.supervisor.status().await
    }

    pub async fn control(&self, host: &str, action: ControlAction) -> ControlResponse {
        let success = match action {
            ControlAction::Wake => self.supervisor.wake_app(host).await,
            ControlAction::Sleep => self.supervisor.sleep_app(host).await,
        };
        let message = match (action, success) {
            (ControlAction::Wake, true) => format!("{host} is starting"),
            (ControlAction::Wake, false) => format!("{host} is not stopped or not managed"),
            (ControlAction::Sleep, true) => format!("{host} is stopping"),
            (ControlAction::Sleep, false) => format!("{host} is not active or not managed"),
        };
        ControlResponse {
            success,
            hostname: host.to_string(),
            action,
            message,
        }
    }

    /// Payload for the host runtime's `GET /health` probe of the daemon.
    pub fn health_payload(&self) -> serde_json::Value {
        serde_json::json!({
            "status": "ok",
            "service": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "timestamp": self.clock.now().to_rfc3339(),
        })
    }

    /// Body for the host runtime's `GET /up` probe.
    pub fn up(&self) -> &'static str {
        "OK"
    }
}
