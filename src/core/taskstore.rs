// src/core/taskstore.rs

//! Durable task records.
//!
//! Each task is persisted as one JSON document under the configured task
//! directory, written temp-then-rename so a crash never leaves a torn
//! record. An in-memory index serialises concurrent status transitions: a
//! task moves to a terminal state exactly once.

use crate::core::errors::AceError;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use strum_macros::{Display, EnumString};
use tracing::warn;
use uuid::Uuid;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum TaskType {
    TableDiff,
    TableRepair,
    TableRerun,
    RepsetDiff,
    SchemaDiff,
    SpockDiff,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskStatus {
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// One unit of admitted work. Immutable once a terminal status is recorded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub task_type: TaskType,
    pub task_status: TaskStatus,
    /// JSON snapshot of the submitted parameters. Never contains credentials.
    pub task_context: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_result: Option<Value>,
    pub submitted_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    /// Subject CN of the client certificate that admitted the task.
    pub client_role: String,
}

impl TaskRecord {
    pub fn new(task_type: TaskType, context: Value, client_role: &str) -> Self {
        Self {
            task_id: generate_task_id(),
            task_type,
            task_status: TaskStatus::Running,
            task_context: context,
            task_result: None,
            submitted_at: Utc::now(),
            started_at: None,
            finished_at: None,
            client_role: client_role.to_string(),
        }
    }
}

/// Task ids are generated at admission time, independent of the durable
/// store's availability.
pub fn generate_task_id() -> String {
    Uuid::new_v4().simple().to_string()
}

pub struct TaskStore {
    dir: PathBuf,
    tasks: DashMap<String, TaskRecord>,
}

impl TaskStore {
    /// Opens the store, creating the directory if needed and loading every
    /// record persisted by earlier runs.
    pub async fn open(dir: &str) -> Result<Self, AceError> {
        tokio::fs::create_dir_all(dir).await?;

        let tasks = DashMap::new();
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match tokio::fs::read_to_string(&path).await {
                Ok(contents) => match serde_json::from_str::<TaskRecord>(&contents) {
                    Ok(record) => {
                        tasks.insert(record.task_id.clone(), record);
                    }
                    Err(e) => warn!("Skipping unreadable task record {:?}: {}", path, e),
                },
                Err(e) => warn!("Skipping unreadable task record {:?}: {}", path, e),
            }
        }

        Ok(Self {
            dir: Path::new(dir).to_path_buf(),
            tasks,
        })
    }

    /// Enrols a new task. The record must be in RUNNING state.
    pub async fn create(&self, record: TaskRecord) -> Result<(), AceError> {
        if record.task_status.is_terminal() {
            return Err(AceError::Internal(
                "tasks must be created in RUNNING state".to_string(),
            ));
        }
        self.persist(&record).await?;
        self.tasks.insert(record.task_id.clone(), record);
        Ok(())
    }

    pub fn get(&self, task_id: &str) -> Result<TaskRecord, AceError> {
        self.tasks
            .get(task_id)
            .map(|r| r.clone())
            .ok_or_else(|| AceError::TaskNotFound(task_id.to_string()))
    }

    /// Stamps the moment a worker picked the task up.
    pub async fn mark_started(&self, task_id: &str) -> Result<(), AceError> {
        let record = {
            let mut entry = self
                .tasks
                .get_mut(task_id)
                .ok_or_else(|| AceError::TaskNotFound(task_id.to_string()))?;
            entry.started_at = Some(Utc::now());
            entry.clone()
        };
        self.persist(&record).await
    }

    /// Transitions a task to a terminal state. The transition happens at
    /// most once; later attempts fail with `AlreadyTerminal`.
    pub async fn finish(
        &self,
        task_id: &str,
        status: TaskStatus,
        result: Option<Value>,
    ) -> Result<TaskRecord, AceError> {
        if !status.is_terminal() {
            return Err(AceError::Internal(format!(
                "finish() called with non-terminal status {status}"
            )));
        }

        let record = {
            let mut entry = self
                .tasks
                .get_mut(task_id)
                .ok_or_else(|| AceError::TaskNotFound(task_id.to_string()))?;
            if entry.task_status.is_terminal() {
                return Err(AceError::AlreadyTerminal(task_id.to_string()));
            }
            entry.task_status = status;
            entry.task_result = result;
            entry.finished_at = Some(Utc::now());
            entry.clone()
        };

        self.persist(&record).await?;
        Ok(record)
    }

    /// Writes the record to a temp file and renames it into place.
    async fn persist(&self, record: &TaskRecord) -> Result<(), AceError> {
        let path = self.dir.join(format!("{}.json", record.task_id));
        let tmp = self.dir.join(format!(".{}.json.tmp", record.task_id));
        let contents = serde_json::to_vec_pretty(record)?;
        tokio::fs::write(&tmp, contents).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}
