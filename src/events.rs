//! The worker→supervisor event protocol.
//!
//! Workers emit one JSON object per line on stdout with a common envelope
//! (`type`, `timestamp`, `job_id`) plus type-specific fields. Anything that
//! does not parse as such an object is plain log text. Unknown event kinds
//! are preserved as `WorkerEvent::Unknown`, never dropped, and still count
//! as heartbeats.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::delta::DepartmentCount;

/// Envelope fields common to every structured event. Both are optional on
/// the wire; a worker that omits them still gets its event delivered.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub job_id: Option<String>,
}

/// Closed tagged union of event kinds the supervisor consumes.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    Start {
        portal: String,
    },
    Portal {
        portal: String,
        url: Option<String>,
    },
    DepartmentsLoaded {
        departments: Vec<DepartmentCount>,
    },
    Progress {
        extracted: u64,
        skipped: u64,
        expected: Option<u64>,
        department: Option<String>,
    },
    Status {
        message: String,
    },
    Completed {
        extracted: u64,
        skipped: u64,
    },
    Error {
        message: String,
    },
    Cancelled {
        reason: Option<String>,
    },
    /// An event kind this version does not know. Preserved opaquely.
    Unknown {
        kind: String,
        payload: Value,
    },
}

impl WorkerEvent {
    /// The wire name of this event's kind.
    pub fn kind(&self) -> &str {
        match self {
            Self::Start { .. } => "start",
            Self::Portal { .. } => "portal",
            Self::DepartmentsLoaded { .. } => "departments_loaded",
            Self::Progress { .. } => "progress",
            Self::Status { .. } => "status",
            Self::Completed { .. } => "completed",
            Self::Error { .. } => "error",
            Self::Cancelled { .. } => "cancelled",
            Self::Unknown { kind, .. } => kind,
        }
    }

    /// Kinds that announce the worker's own terminal outcome.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed { .. } | Self::Error { .. } | Self::Cancelled { .. }
        )
    }
}

/// One structured event together with its envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct StampedEvent {
    pub envelope: Envelope,
    pub event: WorkerEvent,
}

/// A classified line of worker output.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputLine {
    Event(StampedEvent),
    Log(String),
}

#[derive(Debug, Deserialize)]
struct StartPayload {
    #[serde(default)]
    portal: String,
}

#[derive(Debug, Deserialize)]
struct PortalPayload {
    #[serde(default)]
    portal: String,
    #[serde(default)]
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DepartmentsPayload {
    #[serde(default)]
    departments: Vec<DepartmentCount>,
}

#[derive(Debug, Deserialize)]
struct ProgressPayload {
    #[serde(default)]
    extracted: u64,
    #[serde(default)]
    skipped: u64,
    #[serde(default)]
    expected: Option<u64>,
    #[serde(default)]
    department: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatusPayload {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct CompletedPayload {
    #[serde(default)]
    extracted: u64,
    #[serde(default)]
    skipped: u64,
}

#[derive(Debug, Deserialize)]
struct ErrorPayload {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct CancelledPayload {
    #[serde(default)]
    reason: Option<String>,
}

/// Classify one line of worker stdout.
///
/// A line that parses as a single JSON object with a string `type` field is
/// a structured event; any other non-empty line is a log line. Empty lines
/// yield `None`.
pub fn classify_line(line: &str) -> Option<OutputLine> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.starts_with('{')
        && let Ok(value) = serde_json::from_str::<Value>(trimmed)
        && value.get("type").and_then(|t| t.as_str()).is_some()
    {
        return Some(OutputLine::Event(parse_event(value)));
    }
    Some(OutputLine::Log(trimmed.to_string()))
}

fn parse_event(value: Value) -> StampedEvent {
    let kind = value
        .get("type")
        .and_then(|t| t.as_str())
        .unwrap_or_default()
        .to_string();
    let envelope: Envelope = serde_json::from_value(value.clone()).unwrap_or_default();

    // A payload that fails to deserialize for a known kind degrades to
    // Unknown rather than being dropped.
    let event = match kind.as_str() {
        "start" => serde_json::from_value(value.clone())
            .map(|p: StartPayload| WorkerEvent::Start { portal: p.portal })
            .ok(),
        "portal" => serde_json::from_value(value.clone())
            .map(|p: PortalPayload| WorkerEvent::Portal {
                portal: p.portal,
                url: p.url,
            })
            .ok(),
        "departments_loaded" => serde_json::from_value(value.clone())
            .map(|p: DepartmentsPayload| WorkerEvent::DepartmentsLoaded {
                departments: p.departments,
            })
            .ok(),
        "progress" => serde_json::from_value(value.clone())
            .map(|p: ProgressPayload| WorkerEvent::Progress {
                extracted: p.extracted,
                skipped: p.skipped,
                expected: p.expected,
                department: p.department,
            })
            .ok(),
        "status" => serde_json::from_value(value.clone())
            .map(|p: StatusPayload| WorkerEvent::Status { message: p.message })
            .ok(),
        "completed" => serde_json::from_value(value.clone())
            .map(|p: CompletedPayload| WorkerEvent::Completed {
                extracted: p.extracted,
                skipped: p.skipped,
            })
            .ok(),
        "error" => serde_json::from_value(value.clone())
            .map(|p: ErrorPayload| WorkerEvent::Error { message: p.message })
            .ok(),
        "cancelled" => serde_json::from_value(value.clone())
            .map(|p: CancelledPayload| WorkerEvent::Cancelled { reason: p.reason })
            .ok(),
        _ => None,
    }
    .unwrap_or(WorkerEvent::Unknown {
        kind,
        payload: value,
    });

    StampedEvent { envelope, event }
}
