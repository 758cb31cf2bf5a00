//! Worker pool
//!
//! [`TaskQueue`] is the enqueue handle shared by the engine. Workers are
//! started separately with [`TaskQueue::start`] once the executor exists,
//! so components that only enqueue never depend on the executor.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::task::{Execution, MAX_CHAIN_DEPTH, Task, TaskSpec};
use crate::config::QueueConfig;
use crate::data::Database;
use crate::error::AppError;
use crate::metrics::{QUEUE_TASK_DURATION_SECONDS, QUEUE_TASKS_TOTAL, QUEUE_WORKERS_BUSY};

type Result<T> = std::result::Result<T, AppError>;

/// Runs one claimed task.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, task: &Task) -> Result<Execution>;
}

/// Delay before retrying after `attempts` failed attempts.
pub fn backoff_for(config: &QueueConfig, attempts: u32) -> Duration {
    let exponent = attempts.saturating_sub(1).min(16);
    config
        .backoff()
        .saturating_mul(1u32 << exponent)
        .min(config.max_backoff())
}

/// Holds `QUEUE_WORKERS_BUSY` up for one execution.
struct BusyWorker;

impl BusyWorker {
    fn enter() -> Self {
        QUEUE_WORKERS_BUSY.inc();
        BusyWorker
    }
}

impl Drop for BusyWorker {
    fn drop(&mut self) {
        QUEUE_WORKERS_BUSY.dec();
    }
}

/// Durable queue handle.
#[derive(Clone)]
pub struct TaskQueue {
    db: Database,
    config: QueueConfig,
    notify: Arc<Notify>,
}

impl TaskQueue {
    pub fn new(db: Database, config: QueueConfig) -> Self {
        Self {
            db,
            config,
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Persist `spec` and wake a worker.
    pub async fn enqueue(&self, spec: TaskSpec) -> Result<String> {
        if spec.depth > MAX_CHAIN_DEPTH {
            return Err(AppError::Unprocessable(format!(
                "task chain depth {} exceeds {}",
                spec.depth, MAX_CHAIN_DEPTH
            )));
        }

        let id = self
            .db
            .insert_task(&spec, self.config.max_attempts, Utc::now())
            .await?;
        debug!(
            task_id = %id,
            kind = spec.kind.as_str(),
            target = %spec.target,
            depth = spec.depth,
            "Task enqueued"
        );
        self.notify.notify_one();
        Ok(id)
    }

    /// Reset tasks left `running` by a previous process.
    pub async fn recover(&self) -> Result<u64> {
        let recovered = self.db.reset_running_tasks().await?;
        if recovered > 0 {
            info!(recovered, "Recovered interrupted tasks");
        }
        Ok(recovered)
    }

    /// Delete finished tasks older than the retention window.
    pub async fn purge(&self) -> Result<u64> {
        let retention = chrono::Duration::from_std(self.config.retention())
            .map_err(|e| AppError::Config(format!("queue.retention_seconds: {}", e)))?;
        let purged = self.db.purge_finished_tasks(Utc::now() - retention).await?;
        if purged > 0 {
            debug!(purged, "Purged finished tasks");
        }
        Ok(purged)
    }

    /// Claim and run one due task. Returns false when nothing was due.
    pub async fn run_once(&self, executor: &dyn TaskExecutor) -> Result<bool> {
        let Some(task) = self.db.claim_due_task(Utc::now()).await? else {
            return Ok(false);
        };

        let outcome = self.observe(&task, executor.execute(&task)).await;
        self.finish(&task, outcome).await?;
        Ok(true)
    }

    /// [`run_once`](Self::run_once) with the executor in its own tokio
    /// task: a panic fails the attempt and leaves the worker running.
    async fn run_once_isolated(&self, executor: &Arc<dyn TaskExecutor>) -> Result<bool> {
        let Some(task) = self.db.claim_due_task(Utc::now()).await? else {
            return Ok(false);
        };

        let executor = executor.clone();
        let claimed = task.clone();
        let mut handle = tokio::spawn(async move { executor.execute(&claimed).await });
        let outcome = self
            .observe(&task, async {
                match (&mut handle).await {
                    Ok(outcome) => outcome,
                    Err(e) if e.is_panic() => {
                        Err(AppError::Internal(anyhow::anyhow!("executor panicked")))
                    }
                    Err(e) => Err(AppError::Internal(anyhow::anyhow!("executor aborted: {}", e))),
                }
            })
            .await;
        // Stops an execution that outlived its timeout.
        handle.abort();

        self.finish(&task, outcome).await?;
        Ok(true)
    }

    async fn observe<F>(&self, task: &Task, execution: F) -> Result<Execution>
    where
        F: std::future::Future<Output = Result<Execution>>,
    {
        let kind = task.spec.kind.as_str();
        debug!(
            task_id = %task.id,
            kind,
            target = %task.spec.target,
            attempt = task.attempts,
            "Running task"
        );

        let _busy = BusyWorker::enter();
        let started = Instant::now();
        let outcome = match tokio::time::timeout(self.config.timeout(), execution).await {
            Ok(outcome) => outcome,
            Err(_) => Err(AppError::Internal(anyhow::anyhow!(
                "timed out after {}s",
                self.config.timeout_seconds
            ))),
        };
        QUEUE_TASK_DURATION_SECONDS
            .with_label_values(&[kind])
            .observe(started.elapsed().as_secs_f64());
        outcome
    }

    async fn finish(&self, task: &Task, outcome: Result<Execution>) -> Result<()> {
        let kind = task.spec.kind.as_str();
        match outcome {
            Ok(Execution::Done) => {
                self.succeed(task, task.spec.next.as_deref()).await?;
            }
            Ok(Execution::Replace(chain)) if chain.depth > MAX_CHAIN_DEPTH => {
                let err = AppError::Unprocessable(format!(
                    "task chain depth {} exceeds {}",
                    chain.depth, MAX_CHAIN_DEPTH
                ));
                self.fail(task, &err).await?;
            }
            Ok(Execution::Replace(chain)) => {
                info!(
                    task_id = %task.id,
                    kind,
                    replacement = chain.kind.as_str(),
                    depth = chain.depth,
                    "Task restructured"
                );
                self.succeed(task, Some(&chain)).await?;
            }
            Err(err) => self.record_failure(task, err).await?,
        }
        Ok(())
    }

    async fn succeed(&self, task: &Task, follow_up: Option<&TaskSpec>) -> Result<()> {
        self.db
            .complete_task(&task.id, follow_up, self.config.max_attempts)
            .await?;
        QUEUE_TASKS_TOTAL
            .with_label_values(&[task.spec.kind.as_str(), "succeeded"])
            .inc();
        if follow_up.is_some() {
            self.notify.notify_one();
        }
        Ok(())
    }

    async fn fail(&self, task: &Task, err: &AppError) -> Result<()> {
        error!(
            task_id = %task.id,
            kind = task.spec.kind.as_str(),
            target = %task.spec.target,
            attempts = task.attempts,
            error = %err,
            "Task failed permanently"
        );
        self.db.fail_task(&task.id, &err.to_string()).await?;
        QUEUE_TASKS_TOTAL
            .with_label_values(&[task.spec.kind.as_str(), "failed"])
            .inc();
        Ok(())
    }

    async fn record_failure(&self, task: &Task, err: AppError) -> Result<()> {
        let kind = task.spec.kind.as_str();
        if err.is_client_rejection() {
            warn!(
                task_id = %task.id,
                kind,
                target = %task.spec.target,
                attempt = task.attempts,
                error = %err,
                "Task attempt failed: recipient rejected"
            );
        } else {
            error!(
                task_id = %task.id,
                kind,
                target = %task.spec.target,
                attempt = task.attempts,
                error = %err,
                "Task attempt failed"
            );
        }

        if err.is_terminal() || task.attempts >= task.max_attempts {
            return self.fail(task, &err).await;
        }

        let delay = backoff_for(&self.config, task.attempts);
        let run_at = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(0));
        warn!(
            task_id = %task.id,
            kind,
            retry_in_secs = delay.as_secs(),
            "Task scheduled for retry"
        );
        self.db.retry_task(&task.id, &err.to_string(), run_at).await?;
        QUEUE_TASKS_TOTAL.with_label_values(&[kind, "retried"]).inc();
        Ok(())
    }

    /// Run due tasks until none are left. Tasks scheduled for a later
    /// retry are not waited for.
    pub async fn run_until_idle(&self, executor: &dyn TaskExecutor) -> Result<usize> {
        let mut ran = 0;
        while self.run_once(executor).await? {
            ran += 1;
        }
        Ok(ran)
    }

    /// Spawn the worker pool and the retention purge loop.
    pub fn start(&self, executor: Arc<dyn TaskExecutor>) -> QueueHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::with_capacity(self.config.workers + 1);

        for worker in 0..self.config.workers {
            let queue = self.clone();
            let executor = executor.clone();
            let shutdown = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move {
                queue.worker_loop(worker, executor, shutdown).await;
            }));
        }

        let queue = self.clone();
        let shutdown = shutdown_rx;
        tasks.push(tokio::spawn(async move {
            queue.purge_loop(shutdown).await;
        }));

        info!(workers = self.config.workers, "Task queue started");
        QueueHandle {
            shutdown: shutdown_tx,
            tasks,
        }
    }

    async fn worker_loop(
        &self,
        worker: usize,
        executor: Arc<dyn TaskExecutor>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.run_once_isolated(&executor).await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => error!(worker, error = %e, "Queue worker error"),
            }

            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(self.config.poll_interval()) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        debug!(worker, "Queue worker stopped");
    }

    async fn purge_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.purge_interval());
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.purge().await {
                        error!(error = %e, "Task purge failed");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }
}

/// Running worker pool. Dropping it stops the workers after their
/// current task without waiting for them.
pub struct QueueHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl QueueHandle {
    /// Signal every worker to stop and wait for in-flight tasks.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
        info!("Task queue stopped");
    }
}
