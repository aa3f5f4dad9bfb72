use std::fmt;

use serde::Serialize;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Started,
    Finished,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Started => write!(f, "started"),
            Status::Finished => write!(f, "finished"),
        }
    }
}

/// A stage-level (`label` absent) or sample-level progress transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressEvent {
    pub action: String,
    pub status: Status,
    #[serde(rename = "sample", skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl ProgressEvent {
    pub fn stage(action: &str, status: Status) -> Self {
        Self {
            action: action.to_string(),
            status,
            label: None,
        }
    }

    pub fn sample(action: &str, status: Status, label: &str) -> Self {
        Self {
            action: action.to_string(),
            status,
            label: Some(label.to_string()),
        }
    }
}

pub trait ProgressSink: Send + Sync {
    fn event(&self, event: ProgressEvent);
}

pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn event(&self, _event: ProgressEvent) {}
}

/// Reports finished sample-level events through `tracing`.
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn event(&self, event: ProgressEvent) {
        if let (Status::Finished, Some(label)) = (event.status, &event.label) {
            info!("Finished {} for {label}", event.action);
        }
    }
}
