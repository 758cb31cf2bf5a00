//! Durable task queue
//!
//! Fetch, deliver and reprocess work is persisted before it runs, retried
//! with exponential backoff, and chained through `TaskSpec::next`.

mod task;
mod worker;

pub use task::{Execution, MAX_CHAIN_DEPTH, Task, TaskKind, TaskSpec, TaskStatus};
pub(crate) use task::TaskRow;
pub use worker::{QueueHandle, TaskExecutor, TaskQueue, backoff_for};

#[cfg(test)]
pub use worker::MockTaskExecutor;
