//! Task queue persistence
//!
//! Tasks live in the `tasks` table with unix-millisecond timestamps so that
//! due-ness is a numeric comparison. Claiming is a single
//! `UPDATE ... RETURNING`, so two workers never run the same row.

use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;

use super::database::Database;
use crate::error::AppError;
use crate::queue::{Task, TaskRow, TaskSpec, TaskStatus};

type Result<T> = std::result::Result<T, AppError>;

async fn insert_task_in(
    conn: &mut SqliteConnection,
    spec: &TaskSpec,
    max_attempts: u32,
    run_at: DateTime<Utc>,
) -> Result<String> {
    let id = ulid::Ulid::new().to_string();
    let next = spec
        .next
        .as_deref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| AppError::Internal(anyhow::anyhow!("unserializable task chain: {}", e)))?;
    let now = Utc::now().timestamp_millis();

    sqlx::query(
        r#"
        INSERT INTO tasks (
            id, kind, target, origin, payload, next, depth, status, attempts, max_attempts,
            run_at, created_at, updated_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, 'pending', 0, ?, ?, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(spec.kind.as_str())
    .bind(&spec.target)
    .bind(&spec.origin)
    .bind(&spec.payload)
    .bind(next)
    .bind(spec.depth as i64)
    .bind(max_attempts as i64)
    .bind(run_at.timestamp_millis())
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    Ok(id)
}

impl Database {
    /// Persist a new pending task due at `run_at`.
    pub async fn insert_task(
        &self,
        spec: &TaskSpec,
        max_attempts: u32,
        run_at: DateTime<Utc>,
    ) -> Result<String> {
        let mut conn = self.pool().acquire().await?;
        insert_task_in(&mut conn, spec, max_attempts, run_at).await
    }

    /// Move the oldest due pending task to `running` and return it.
    pub async fn claim_due_task(&self, now: DateTime<Utc>) -> Result<Option<Task>> {
        let now = now.timestamp_millis();
        let row = sqlx::query_as::<_, TaskRow>(
            r#"
            UPDATE tasks
            SET status = 'running', attempts = attempts + 1, updated_at = ?
            WHERE id = (
                SELECT id FROM tasks
                WHERE status = 'pending' AND run_at <= ?
                ORDER BY run_at, created_at, rowid
                LIMIT 1
            )
            AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(now)
        .bind(now)
        .fetch_optional(self.pool())
        .await?;

        row.map(Task::try_from).transpose()
    }

    /// Mark a task succeeded and enqueue its follow-up in the same transaction.
    ///
    /// The payload of a succeeded task is dropped; the row is kept for the
    /// retention window. Returns the id of the follow-up, if any.
    pub async fn complete_task(
        &self,
        id: &str,
        follow_up: Option<&TaskSpec>,
        max_attempts: u32,
    ) -> Result<Option<String>> {
        let mut tx = self.pool().begin().await?;
        let now = Utc::now();

        sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'succeeded', payload = NULL, last_error = NULL,
                updated_at = ?, finished_at = ?
            WHERE id = ?
            "#,
        )
        .bind(now.timestamp_millis())
        .bind(now.timestamp_millis())
        .bind(id)
        .execute(&mut *tx)
        .await?;

        let next_id = match follow_up {
            Some(spec) => Some(insert_task_in(&mut tx, spec, max_attempts, now).await?),
            None => None,
        };

        tx.commit().await?;
        Ok(next_id)
    }

    /// Put a failed attempt back to pending, due at `run_at`.
    pub async fn retry_task(&self, id: &str, error: &str, run_at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE tasks SET status = 'pending', last_error = ?, run_at = ?, updated_at = ? WHERE id = ?",
        )
        .bind(error)
        .bind(run_at.timestamp_millis())
        .bind(Utc::now().timestamp_millis())
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Mark a task permanently failed. The payload is kept for inspection.
    pub async fn fail_task(&self, id: &str, error: &str) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        sqlx::query(
            "UPDATE tasks SET status = 'failed', last_error = ?, updated_at = ?, finished_at = ? WHERE id = ?",
        )
        .bind(error)
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Return tasks interrupted by a crash to the pending state.
    pub async fn reset_running_tasks(&self) -> Result<u64> {
        let result =
            sqlx::query("UPDATE tasks SET status = 'pending', updated_at = ? WHERE status = 'running'")
                .bind(Utc::now().timestamp_millis())
                .execute(self.pool())
                .await?;
        Ok(result.rows_affected())
    }

    /// Delete finished tasks whose terminal transition is older than `before`.
    pub async fn purge_finished_tasks(&self, before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM tasks
            WHERE status IN ('succeeded', 'failed') AND finished_at < ?
            "#,
        )
        .bind(before.timestamp_millis())
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn get_task(&self, id: &str) -> Result<Option<Task>> {
        let row = sqlx::query_as::<_, TaskRow>("SELECT * FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        row.map(Task::try_from).transpose()
    }

    /// Tasks in `status`, oldest first.
    pub async fn tasks_with_status(&self, status: TaskStatus) -> Result<Vec<Task>> {
        let rows = sqlx::query_as::<_, TaskRow>(
            "SELECT * FROM tasks WHERE status = ? ORDER BY created_at, rowid",
        )
        .bind(status.as_str())
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(Task::try_from).collect()
    }

    pub async fn pending_task_count(&self) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM tasks WHERE status = 'pending'")
            .fetch_one(self.pool())
            .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::TaskKind;
    use chrono::Duration;
    use tempfile::TempDir;

    async fn test_db() -> (Database, TempDir) {
        let dir = TempDir::new().unwrap();
        let db = Database::connect(&dir.path().join("test.db")).await.unwrap();
        (db, dir)
    }

    #[tokio::test]
    async fn claim_skips_tasks_not_yet_due() {
        let (db, _dir) = test_db().await;
        let later = Utc::now() + Duration::minutes(5);
        db.insert_task(&TaskSpec::fetch("https://b.example/u/bob"), 5, later)
            .await
            .unwrap();

        assert!(db.claim_due_task(Utc::now()).await.unwrap().is_none());
        assert!(db.claim_due_task(later).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn claim_is_exclusive_and_counts_attempts() {
        let (db, _dir) = test_db().await;
        let id = db
            .insert_task(&TaskSpec::fetch("https://b.example/u/bob"), 5, Utc::now())
            .await
            .unwrap();

        let claimed = db.claim_due_task(Utc::now()).await.unwrap().unwrap();
        assert_eq!(claimed.id, id);
        assert_eq!(claimed.attempts, 1);
        assert_eq!(claimed.status, TaskStatus::Running);
        assert!(db.claim_due_task(Utc::now()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn completing_enqueues_follow_up_and_drops_payload() {
        let (db, _dir) = test_db().await;
        let spec = TaskSpec::deliver("https://b.example/u/bob", "https://a.example", "{}")
            .then(TaskSpec::process("https://a.example/accept/1", "{}"));
        let id = db.insert_task(&spec, 5, Utc::now()).await.unwrap();
        let claimed = db.claim_due_task(Utc::now()).await.unwrap().unwrap();

        let next_id = db
            .complete_task(&id, claimed.spec.next.as_deref(), 5)
            .await
            .unwrap()
            .unwrap();

        let parent = db.get_task(&id).await.unwrap().unwrap();
        assert_eq!(parent.status, TaskStatus::Succeeded);
        assert!(parent.spec.payload.is_none());

        let next = db.get_task(&next_id).await.unwrap().unwrap();
        assert_eq!(next.spec.kind, TaskKind::Process);
        assert_eq!(next.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn reset_running_recovers_interrupted_tasks() {
        let (db, _dir) = test_db().await;
        db.insert_task(&TaskSpec::fetch("https://b.example/u/bob"), 5, Utc::now())
            .await
            .unwrap();
        db.claim_due_task(Utc::now()).await.unwrap().unwrap();

        assert_eq!(db.reset_running_tasks().await.unwrap(), 1);
        assert_eq!(db.pending_task_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn purge_removes_only_old_finished_tasks() {
        let (db, _dir) = test_db().await;
        let done = db
            .insert_task(&TaskSpec::fetch("https://b.example/u/bob"), 5, Utc::now())
            .await
            .unwrap();
        db.claim_due_task(Utc::now()).await.unwrap();
        db.complete_task(&done, None, 5).await.unwrap();
        let pending = db
            .insert_task(&TaskSpec::fetch("https://c.example/u/carol"), 5, Utc::now())
            .await
            .unwrap();

        assert_eq!(
            db.purge_finished_tasks(Utc::now() - Duration::hours(1))
                .await
                .unwrap(),
            0
        );
        assert_eq!(
            db.purge_finished_tasks(Utc::now() + Duration::seconds(1))
                .await
                .unwrap(),
            1
        );
        assert!(db.get_task(&done).await.unwrap().is_none());
        assert!(db.get_task(&pending).await.unwrap().is_some());
    }
}
