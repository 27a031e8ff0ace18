//! Task lifecycle states and the transitions allowed between them

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle status of a QA unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Assigned,
    Annotated,
    Approved,
    Rejected,
    Cancelled,
    KbIngested,
    KbFailed,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 8] = [
        TaskStatus::Pending,
        TaskStatus::Assigned,
        TaskStatus::Annotated,
        TaskStatus::Approved,
        TaskStatus::Rejected,
        TaskStatus::Cancelled,
        TaskStatus::KbIngested,
        TaskStatus::KbFailed,
    ];

    /// Statuses from which an annotation may be submitted
    pub const ANNOTATABLE: [TaskStatus; 2] = [TaskStatus::Pending, TaskStatus::Assigned];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Assigned => "assigned",
            TaskStatus::Annotated => "annotated",
            TaskStatus::Approved => "approved",
            TaskStatus::Rejected => "rejected",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::KbIngested => "kb_ingested",
            TaskStatus::KbFailed => "kb_failed",
        }
    }

    /// Whether the state machine allows moving from `self` to `next`
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Assigned)
                | (Pending, Annotated)
                | (Assigned, Annotated)
                | (Assigned, Pending)
                | (Annotated, Approved)
                | (Annotated, Rejected)
                | (Rejected, Pending)
                | (Rejected, Cancelled)
                | (Approved, KbIngested)
                | (Approved, KbFailed)
                | (KbFailed, KbIngested)
        )
    }

    /// No transition leaves a terminal status
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Cancelled | TaskStatus::KbIngested)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .iter()
            .find(|status| status.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown task status: {s}"))
    }
}
