//! Task persistence port
//!
//! The engine reports accepted tasks and their terminal outcomes to an
//! optional [`TaskStore`]. Payloads are not persisted; the store sees task
//! metadata only. Completion writes that fail are logged and do not change
//! the task's outcome.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use taskgate_common::collections::Priority;
use taskgate_common::error::{CommonError, CommonResult};

use crate::hooks::OutcomeKind;
use crate::task::TaskId;

/// Metadata recorded when a task is accepted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub target_key: String,
    pub priority: Priority,
    pub max_attempts: u32,
    pub enqueued_at: DateTime<Utc>,
}

/// Record plus terminal outcome, once known
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredTask {
    pub record: TaskRecord,
    pub outcome: Option<OutcomeKind>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Durable record of task lifecycle
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Persist an accepted task; an error refuses the submission
    async fn persist_enqueue(&self, record: &TaskRecord) -> CommonResult<()>;

    /// Persist a task's terminal outcome
    async fn persist_complete(&self, id: TaskId, outcome: OutcomeKind) -> CommonResult<()>;
}

/// In-process [`TaskStore`] backed by a concurrent map
#[derive(Debug, Default)]
pub struct InMemoryTaskStore {
    tasks: DashMap<TaskId, StoredTask>,
    reject_enqueues: AtomicBool,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent enqueue writes fail, simulating an unavailable store
    pub fn set_reject_enqueues(&self, reject: bool) {
        self.reject_enqueues.store(reject, Ordering::SeqCst);
    }

    pub fn get(&self, id: TaskId) -> Option<StoredTask> {
        self.tasks.get(&id).map(|entry| entry.value().clone())
    }

    /// Tasks without a recorded outcome
    pub fn pending(&self) -> Vec<TaskRecord> {
        self.tasks
            .iter()
            .filter(|entry| entry.outcome.is_none())
            .map(|entry| entry.record.clone())
            .collect()
    }

    /// Number of tasks that ended with `outcome`
    pub fn count_outcome(&self, outcome: OutcomeKind) -> usize {
        self.tasks.iter().filter(|entry| entry.outcome == Some(outcome)).count()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn persist_enqueue(&self, record: &TaskRecord) -> CommonResult<()> {
        if self.reject_enqueues.load(Ordering::SeqCst) {
            return Err(CommonError::persistence_op("persist_enqueue", "store is rejecting writes"));
        }
        self.tasks.insert(
            record.id,
            StoredTask { record: record.clone(), outcome: None, completed_at: None },
        );
        Ok(())
    }

    async fn persist_complete(&self, id: TaskId, outcome: OutcomeKind) -> CommonResult<()> {
        let mut entry = self
            .tasks
            .get_mut(&id)
            .ok_or_else(|| {
                CommonError::persistence_op("persist_complete", format!("unknown task {id}"))
            })?;
        entry.outcome = Some(outcome);
        entry.completed_at = Some(Utc::now());
        Ok(())
    }
}
