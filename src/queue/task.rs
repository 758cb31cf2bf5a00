//! Task definitions
//!
//! A [`TaskSpec`] is what callers enqueue; a [`Task`] is the persisted row
//! the workers claim. Chains are expressed with `next`: the follow-up spec
//! is enqueued in the same transaction that marks its parent succeeded.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Maximum chain generation a deferral may reach.
pub const MAX_CHAIN_DEPTH: u32 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Dereference `target` and ingest it
    Fetch,
    /// POST `payload` to the inbox of `target`, signed as `origin`
    Deliver,
    /// Re-run inbound processing of `payload`
    Process,
    /// Re-run outbound processing of `payload`
    ProcessOutbox,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Fetch => "fetch",
            TaskKind::Deliver => "deliver",
            TaskKind::Process => "process",
            TaskKind::ProcessOutbox => "process_outbox",
        }
    }
}

impl std::str::FromStr for TaskKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fetch" => Ok(TaskKind::Fetch),
            "deliver" => Ok(TaskKind::Deliver),
            "process" => Ok(TaskKind::Process),
            "process_outbox" => Ok(TaskKind::ProcessOutbox),
            other => Err(AppError::Internal(anyhow::anyhow!(
                "unknown task kind {}",
                other
            ))),
        }
    }
}

/// A unit of work, optionally followed by another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub kind: TaskKind,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<Box<TaskSpec>>,
    #[serde(default)]
    pub depth: u32,
}

impl TaskSpec {
    fn new(kind: TaskKind, target: impl Into<String>) -> Self {
        Self {
            kind,
            target: target.into(),
            origin: None,
            payload: None,
            next: None,
            depth: 0,
        }
    }

    pub fn fetch(target: impl Into<String>) -> Self {
        Self::new(TaskKind::Fetch, target)
    }

    /// Deliver `payload` to `recipient`'s inbox as `origin`.
    pub fn deliver(
        recipient: impl Into<String>,
        origin: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            origin: Some(origin.into()),
            payload: Some(payload.into()),
            ..Self::new(TaskKind::Deliver, recipient)
        }
    }

    /// Reprocess an inbound activity. `target` is the activity IRI, kept for logs.
    pub fn process(target: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            payload: Some(payload.into()),
            ..Self::new(TaskKind::Process, target)
        }
    }

    pub fn process_outbox(target: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            payload: Some(payload.into()),
            ..Self::new(TaskKind::ProcessOutbox, target)
        }
    }

    /// Run `next` once this task succeeds.
    pub fn then(mut self, next: TaskSpec) -> Self {
        self.next = Some(Box::new(next));
        self
    }

    pub fn at_depth(mut self, depth: u32) -> Self {
        self.depth = depth;
        self
    }

    /// Number of specs in this chain, including this one.
    #[cfg(test)]
    pub(crate) fn chain_len(&self) -> usize {
        1 + self.next.as_ref().map_or(0, |next| next.chain_len())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "succeeded" => Ok(TaskStatus::Succeeded),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(AppError::Internal(anyhow::anyhow!(
                "unknown task status {}",
                other
            ))),
        }
    }
}

/// A persisted task as claimed by a worker.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: String,
    pub spec: TaskSpec,
    pub status: TaskStatus,
    /// Attempts started so far, including the current one
    pub attempts: u32,
    pub max_attempts: u32,
    pub run_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct TaskRow {
    pub id: String,
    pub kind: String,
    pub target: String,
    pub origin: Option<String>,
    pub payload: Option<String>,
    pub next: Option<String>,
    pub depth: i64,
    pub status: String,
    pub attempts: i64,
    pub max_attempts: i64,
    pub run_at: i64,
    pub last_error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub finished_at: Option<i64>,
}

pub(crate) fn from_millis(ms: i64) -> Result<DateTime<Utc>, AppError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| AppError::Internal(anyhow::anyhow!("invalid timestamp {}", ms)))
}

impl TryFrom<TaskRow> for Task {
    type Error = AppError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        let next = row
            .next
            .as_deref()
            .map(serde_json::from_str::<TaskSpec>)
            .transpose()
            .map_err(|e| AppError::Internal(anyhow::anyhow!("corrupt task chain: {}", e)))?;

        Ok(Self {
            id: row.id,
            spec: TaskSpec {
                kind: row.kind.parse()?,
                target: row.target,
                origin: row.origin,
                payload: row.payload,
                next: next.map(Box::new),
                depth: row.depth as u32,
            },
            status: row.status.parse()?,
            attempts: row.attempts as u32,
            max_attempts: row.max_attempts as u32,
            run_at: from_millis(row.run_at)?,
            last_error: row.last_error,
            created_at: from_millis(row.created_at)?,
            updated_at: from_millis(row.updated_at)?,
            finished_at: row.finished_at.map(from_millis).transpose()?,
        })
    }
}

/// What a successful execution asks the queue to do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Execution {
    /// Finished; the task's own `next` (if any) is enqueued.
    Done,
    /// Finished by restructuring: enqueue this chain instead of `next`.
    Replace(TaskSpec),
}
