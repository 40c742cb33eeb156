//! Task lifecycle tracking
//!
//! Every dispatched request gets a task record. Records are created by the
//! dispatcher, mutated only by the dispatch call that created them (or by an
//! explicit cancel), and kept for the lifetime of the process.

use crate::request::{InferenceRequest, InferenceResponse};
use chrono::{DateTime, Utc};
use nodemesh_common::error::{MeshError, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::debug;
use uuid::Uuid;

/// Task lifecycle state
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Error,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Error | TaskStatus::Cancelled)
    }

    /// PENDING -> RUNNING -> {COMPLETED, ERROR}; PENDING|RUNNING -> CANCELLED
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        match (self, next) {
            (TaskStatus::Pending, TaskStatus::Running) => true,
            (TaskStatus::Running, TaskStatus::Completed | TaskStatus::Error) => true,
            (TaskStatus::Pending | TaskStatus::Running, TaskStatus::Cancelled) => true,
            _ => false,
        }
    }
}

/// One dispatched unit of work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributedTask {
    pub id: String,
    pub request: InferenceRequest,
    pub assigned_node: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result: Option<InferenceResponse>,
    pub error: Option<String>,
}

struct TaskEntry {
    seq: u64,
    task: DistributedTask,
    cancel: Arc<Notify>,
}

/// Store of every task created by this process
#[derive(Default)]
pub struct TaskStore {
    tasks: RwLock<HashMap<String, TaskEntry>>,
    next_seq: AtomicU64,
}

impl TaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a PENDING task assigned to `node_id`
    ///
    /// Returns the task id and the signal fired when the task is cancelled.
    pub fn create(&self, request: InferenceRequest, node_id: &str) -> (String, Arc<Notify>) {
        let id = Uuid::new_v4().to_string();
        let cancel = Arc::new(Notify::new());

        let entry = TaskEntry {
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            task: DistributedTask {
                id: id.clone(),
                request,
                assigned_node: node_id.to_string(),
                status: TaskStatus::Pending,
                created_at: Utc::now(),
                started_at: None,
                finished_at: None,
                result: None,
                error: None,
            },
            cancel: cancel.clone(),
        };

        self.tasks.write().insert(id.clone(), entry);
        debug!(task_id = %id, node_id = %node_id, "Created task");
        (id, cancel)
    }

    pub fn mark_running(&self, task_id: &str) -> Result<()> {
        self.transition(task_id, TaskStatus::Running, |task| {
            task.started_at = Some(Utc::now());
        })
    }

    pub fn complete(&self, task_id: &str, response: InferenceResponse) -> Result<()> {
        self.transition(task_id, TaskStatus::Completed, move |task| {
            task.finished_at = Some(Utc::now());
            task.result = Some(response);
        })
    }

    pub fn fail(&self, task_id: &str, error: &MeshError) -> Result<()> {
        let message = error.to_string();
        self.transition(task_id, TaskStatus::Error, move |task| {
            task.finished_at = Some(Utc::now());
            task.error = Some(message);
        })
    }

    /// Cancel a pending or running task
    ///
    /// Running work is signalled to stop; a remote node may still finish it.
    pub fn cancel(&self, task_id: &str) -> Result<()> {
        let mut tasks = self.tasks.write();
        let entry = tasks
            .get_mut(task_id)
            .ok_or_else(|| MeshError::not_found(format!("task {}", task_id)))?;

        if !entry.task.status.can_transition_to(TaskStatus::Cancelled) {
            return Err(MeshError::NotCancellable(format!(
                "task {} is {:?}",
                task_id, entry.task.status
            )));
        }

        entry.task.status = TaskStatus::Cancelled;
        entry.task.finished_at = Some(Utc::now());
        // notify_one stores a permit, so a dispatcher that has not started
        // waiting yet still observes the cancel.
        entry.cancel.notify_one();
        debug!(task_id = %task_id, "Cancelled task");
        Ok(())
    }

    pub fn get(&self, task_id: &str) -> Option<DistributedTask> {
        self.tasks.read().get(task_id).map(|entry| entry.task.clone())
    }

    pub fn status(&self, task_id: &str) -> Option<TaskStatus> {
        self.tasks.read().get(task_id).map(|entry| entry.task.status)
    }

    /// Tasks in creation order, optionally filtered by status and node
    pub fn list(&self, status: Option<TaskStatus>, node_id: Option<&str>) -> Vec<DistributedTask> {
        let tasks = self.tasks.read();
        let mut entries: Vec<&TaskEntry> = tasks
            .values()
            .filter(|entry| status.map_or(true, |s| entry.task.status == s))
            .filter(|entry| node_id.map_or(true, |n| entry.task.assigned_node == n))
            .collect();
        entries.sort_by_key(|entry| entry.seq);
        entries.into_iter().map(|entry| entry.task.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.read().is_empty()
    }

    fn transition<F>(&self, task_id: &str, next: TaskStatus, f: F) -> Result<()>
    where
        F: FnOnce(&mut DistributedTask),
    {
        let mut tasks = self.tasks.write();
        let entry = tasks
            .get_mut(task_id)
            .ok_or_else(|| MeshError::not_found(format!("task {}", task_id)))?;

        let current = entry.task.status;
        if !current.can_transition_to(next) {
            return Err(MeshError::internal(format!(
                "task {} cannot move from {:?} to {:?}",
                task_id, current, next
            )));
        }

        entry.task.status = next;
        f(&mut entry.task);
        Ok(())
    }
}
