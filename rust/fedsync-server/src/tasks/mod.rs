//! Background tasks and their lifecycle.
//!
//! Every long running operation (model download, adapter training, adapter synchronization) is
//! tracked as a [`Task`]. A task is created `queued`, becomes `running` when its worker starts
//! and ends in exactly one of the terminal states `completed` or `failed`:
//!
//! ```text
//! queued ──▶ running ──▶ completed
//!   │           │
//!   └───────────┴──────▶ failed
//! ```
//!
//! While running, a task reports a progress between `0` and `100` which never decreases.
//! Completing a task forces its progress to `100`, failing a task freezes it. Terminal tasks are
//! immutable and stay queryable for the lifetime of the [`TaskTracker`].

mod tracker;

pub use self::tracker::{TaskHandle, TaskListener, TaskTracker};

use std::str::FromStr;

use chrono::{DateTime, Utc};
use derive_more::{Display, From, Into};
use displaydoc::Display as DisplayDoc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// The unique identifier of a task.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq, Hash, From, Into, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Generates a new random task id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// The kind of work a task performs.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    #[display(fmt = "download")]
    Download,
    #[display(fmt = "training")]
    Training,
    #[display(fmt = "sync")]
    Sync,
}

/// The lifecycle state of a task.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[display(fmt = "queued")]
    Queued,
    #[display(fmt = "running")]
    Running,
    #[display(fmt = "completed")]
    Completed,
    #[display(fmt = "failed")]
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

#[derive(Debug, DisplayDoc, Error, Clone, PartialEq, Eq)]
/// Errors of the task state machine.
pub enum TaskError {
    /// task {0} not found
    NotFound(TaskId),
    /// task {id} can't transition from {from} to {to}
    InvalidTransition {
        id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },
    /// task {id} can't report progress {value} while at {current}
    InvalidProgress { id: TaskId, current: u8, value: u8 },
}

/// A snapshot of a task.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    fn new(kind: TaskKind) -> Self {
        Self {
            id: TaskId::new(),
            kind,
            status: TaskStatus::Queued,
            progress: 0,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    fn invalid_transition(&self, to: TaskStatus) -> TaskError {
        TaskError::InvalidTransition {
            id: self.id,
            from: self.status,
            to,
        }
    }

    // The transitions below return whether the task was modified.

    fn begin(&mut self) -> Result<bool, TaskError> {
        if self.status != TaskStatus::Queued {
            return Err(self.invalid_transition(TaskStatus::Running));
        }
        self.status = TaskStatus::Running;
        self.started_at = Some(Utc::now());
        Ok(true)
    }

    fn report_progress(&mut self, value: u8) -> Result<bool, TaskError> {
        if self.status != TaskStatus::Running {
            return Err(self.invalid_transition(TaskStatus::Running));
        }
        if value < self.progress || value > 100 {
            return Err(TaskError::InvalidProgress {
                id: self.id,
                current: self.progress,
                value,
            });
        }
        let modified = value != self.progress;
        self.progress = value;
        Ok(modified)
    }

    fn complete(&mut self) -> Result<bool, TaskError> {
        match self.status {
            TaskStatus::Completed => Ok(false),
            TaskStatus::Running => {
                self.status = TaskStatus::Completed;
                self.progress = 100;
                self.completed_at = Some(Utc::now());
                Ok(true)
            }
            TaskStatus::Queued | TaskStatus::Failed => {
                Err(self.invalid_transition(TaskStatus::Completed))
            }
        }
    }

    fn fail(&mut self, error: String) -> Result<bool, TaskError> {
        match self.status {
            TaskStatus::Failed => Ok(false),
            TaskStatus::Queued | TaskStatus::Running => {
                self.status = TaskStatus::Failed;
                self.error = Some(error);
                self.completed_at = Some(Utc::now());
                Ok(true)
            }
            TaskStatus::Completed => Err(self.invalid_transition(TaskStatus::Failed)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_id_from_str() {
        let id = TaskId::new();
        assert_eq!(id.to_string().parse::<TaskId>().unwrap(), id);
        assert!("not-a-task".parse::<TaskId>().is_err());
    }

    #[test]
    fn test_task_serialization() {
        let mut task = Task::new(TaskKind::Sync);
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["kind"], "sync");
        assert_eq!(json["status"], "queued");
        assert_eq!(json["progress"], 0);
        assert!(json.get("error").is_none());

        task.fail("boom".into()).unwrap();
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["error"], "boom");
    }

    #[test]
    fn test_error_display() {
        let id = TaskId::new();
        let error = TaskError::InvalidTransition {
            id,
            from: TaskStatus::Failed,
            to: TaskStatus::Completed,
        };
        assert_eq!(
            error.to_string(),
            format!("task {} can't transition from failed to completed", id)
        );
    }
}
