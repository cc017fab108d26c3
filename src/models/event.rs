use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

/// Append-only audit record scoped to a cluster and, optionally, one
/// of its hosts. Events are for humans; no state-machine precondition
/// ever reads them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub cluster_id: Uuid,
    pub host_id: Option<Uuid>,
    pub severity: EventSeverity,
    pub message: String,
    pub event_time: DateTime<Utc>,
}

impl Event {
    pub fn new(
        cluster_id: Uuid,
        host_id: Option<Uuid>,
        severity: EventSeverity,
        message: impl Into<String>,
    ) -> Self {
        Event {
            cluster_id,
            host_id,
            severity,
            message: message.into(),
            event_time: Utc::now(),
        }
    }
}
