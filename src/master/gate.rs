//! Single-flight slot for agent runs.

use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use super::models::{ModelId, TaskSpec};
use crate::errors::GateError;

struct ActiveTask {
    info: ActiveTaskInfo,
    cancel: CancellationToken,
}

/// Public view of the in-flight task.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActiveTaskInfo {
    pub task_id: String,
    pub repo: String,
    pub model: ModelId,
    pub plan_path: String,
    pub started_at: DateTime<Utc>,
}

type Slot = Arc<Mutex<Option<ActiveTask>>>;

#[derive(Clone, Default)]
pub struct TaskGate {
    slot: Slot,
}

/// Ownership of the slot. Dropping it frees the slot, but only if the slot
/// still belongs to this lease's task.
pub struct TaskLease {
    slot: Slot,
    task_id: String,
    cancel: CancellationToken,
}

impl TaskGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve the slot for `spec`, or report the task currently holding it.
    pub fn try_acquire(&self, spec: &TaskSpec) -> Result<TaskLease, GateError> {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(active) = slot.as_ref() {
            return Err(GateError::AlreadyRunning {
                task_id: active.info.task_id.clone(),
            });
        }
        let cancel = CancellationToken::new();
        *slot = Some(ActiveTask {
            info: ActiveTaskInfo {
                task_id: spec.id.clone(),
                repo: spec.repo.clone(),
                model: spec.model,
                plan_path: spec.plan_path.clone(),
                started_at: Utc::now(),
            },
            cancel: cancel.clone(),
        });
        Ok(TaskLease {
            slot: self.slot.clone(),
            task_id: spec.id.clone(),
            cancel,
        })
    }

    /// Signal termination of the in-flight task. Repeat calls while the task
    /// is still winding down are accepted.
    pub fn cancel(&self, task_id: &str) -> Result<(), GateError> {
        let slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        match slot.as_ref() {
            Some(active) if active.info.task_id == task_id => {
                active.cancel.cancel();
                Ok(())
            }
            _ => Err(GateError::NotFound {
                task_id: task_id.to_string(),
            }),
        }
    }

    pub fn current(&self) -> Option<ActiveTaskInfo> {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|active| active.info.clone())
    }
}

impl TaskLease {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Drop for TaskLease {
    fn drop(&mut self) {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if slot
            .as_ref()
            .is_some_and(|active| active.info.task_id == self.task_id)
        {
            *slot = None;
        }
    }
}
