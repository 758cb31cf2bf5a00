//! Task execution
//!
//! Runs the four task kinds against the network and the processor.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info};

use super::activity::ActivityProcessor;
use super::client::{SignedClient, authority_of};
use super::convert::object_id;
use crate::error::AppError;
use crate::queue::{Execution, Task, TaskExecutor, TaskKind, TaskSpec};

type Result<T> = std::result::Result<T, AppError>;

pub struct FederationExecutor {
    client: Arc<SignedClient>,
    processor: Arc<ActivityProcessor>,
}

impl FederationExecutor {
    pub fn new(client: Arc<SignedClient>, processor: Arc<ActivityProcessor>) -> Self {
        Self { client, processor }
    }

    async fn fetch(&self, target: &str) -> Result<Execution> {
        let objects = self.processor.objects();
        if objects.owns(target).await? {
            debug!(%target, "Fetch of local object skipped");
            return Ok(Execution::Done);
        }

        let document = self
            .client
            .dereference(target, self.client.instance_actor())
            .await?;
        let id = object_id(&document).ok_or_else(|| AppError::MissingProperty("id".to_string()))?;
        if authority_of(id).is_none() || authority_of(id) != authority_of(target) {
            return Err(AppError::Forbidden(format!(
                "{} answered with an object from another host: {}",
                target, id
            )));
        }

        self.processor.ingest_object(&document).await?;
        info!(%target, "Fetched and ingested");
        Ok(Execution::Done)
    }

    async fn deliver(&self, spec: &TaskSpec) -> Result<Execution> {
        let payload = spec
            .payload
            .as_deref()
            .ok_or_else(|| AppError::Unprocessable("deliver task without payload".to_string()))?;
        let origin = spec
            .origin
            .as_deref()
            .ok_or_else(|| AppError::Unprocessable("deliver task without origin".to_string()))?;

        let store = self.processor.objects().store();
        let Some(inbox) = store.actor_inbox(&spec.target).await? else {
            // Resolve the recipient first, then retry this delivery with
            // its continuation intact.
            let depth = spec.depth + 1;
            debug!(recipient = %spec.target, depth, "Recipient inbox unknown, fetching first");
            return Ok(Execution::Replace(
                TaskSpec::fetch(spec.target.as_str())
                    .at_depth(depth)
                    .then(spec.clone().at_depth(depth)),
            ));
        };

        self.client.deliver(payload, &inbox, origin).await?;
        Ok(Execution::Done)
    }

    fn payload(spec: &TaskSpec) -> Result<Value> {
        let payload = spec
            .payload
            .as_deref()
            .ok_or_else(|| AppError::Unprocessable("process task without payload".to_string()))?;
        Ok(serde_json::from_str(payload)?)
    }
}

#[async_trait]
impl TaskExecutor for FederationExecutor {
    async fn execute(&self, task: &Task) -> Result<Execution> {
        let spec = &task.spec;
        match spec.kind {
            TaskKind::Fetch => self.fetch(&spec.target).await,
            TaskKind::Deliver => self.deliver(spec).await,
            TaskKind::Process => {
                self.processor
                    .process(Self::payload(spec)?, spec.depth)
                    .await?;
                Ok(Execution::Done)
            }
            TaskKind::ProcessOutbox => {
                self.processor
                    .process_outbox(Self::payload(spec)?, spec.depth)
                    .await?;
                Ok(Execution::Done)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FollowerPolicy, QueueConfig};
    use crate::data::{Database, NewLocalCollective, Store};
    use crate::federation::delivery::DeliveryPipeline;
    use crate::federation::objects::ObjectCache;
    use crate::keys::generate_key_pair;
    use crate::queue::{TaskQueue, TaskStatus};
    use chrono::Utc;
    use tempfile::TempDir;

    const BASE: &str = "https://a.example";

    async fn executor() -> (FederationExecutor, Database, TempDir) {
        let (executor, _queue, db, dir) = setup(true).await;
        (executor, db, dir)
    }

    async fn setup(allow_private_hosts: bool) -> (FederationExecutor, TaskQueue, Database, TempDir) {
        let dir = TempDir::new().unwrap();
        let db = Database::connect(&dir.path().join("test.db")).await.unwrap();
        let store: Arc<dyn Store> = Arc::new(db.clone());
        let keys = generate_key_pair(1024).unwrap();

        db.ensure_local_collective(&NewLocalCollective {
            ap_id: BASE.to_string(),
            name: "wiki".to_string(),
            summary: None,
            inbox: format!("{}/inbox", BASE),
            outbox: format!("{}/outbox", BASE),
            followers: format!("{}/followers", BASE),
            following: format!("{}/following", BASE),
            public_key_pem: keys.public_pem.clone(),
            private_key_pem: keys.private_pem.clone(),
        })
        .await
        .unwrap();

        let queue = TaskQueue::new(db.clone(), QueueConfig::default());
        let objects = ObjectCache::new(store.clone(), BASE).unwrap();
        let delivery = DeliveryPipeline::new(store.clone(), queue.clone(), BASE);
        let processor = Arc::new(ActivityProcessor::new(
            objects,
            queue.clone(),
            delivery,
            FollowerPolicy::Confirmed,
        ));
        let client = Arc::new(
            SignedClient::new(
                reqwest::Client::new(),
                store,
                BASE,
                &keys.private_pem,
                allow_private_hosts,
            )
            .unwrap(),
        );
        (FederationExecutor::new(client, processor), queue, db, dir)
    }

    fn task(spec: TaskSpec) -> Task {
        let now = Utc::now();
        Task {
            id: "t1".to_string(),
            spec,
            status: TaskStatus::Running,
            attempts: 1,
            max_attempts: 5,
            run_at: now,
            last_error: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    #[tokio::test]
    async fn delivery_to_unknown_inbox_fetches_first() {
        let (executor, _db, _dir) = executor().await;
        let continuation = TaskSpec::process("https://a.example/accept/1", "{}");
        let spec = TaskSpec::deliver("https://b.example/u/bob", BASE, "{}")
            .at_depth(2)
            .then(continuation.clone());

        let Execution::Replace(chain) = executor.execute(&task(spec.clone())).await.unwrap() else {
            panic!("expected a replacement chain");
        };
        assert_eq!(chain.kind, TaskKind::Fetch);
        assert_eq!(chain.target, "https://b.example/u/bob");
        assert_eq!(chain.depth, 3);

        let retry = chain.next.as_deref().unwrap();
        assert_eq!(retry.kind, TaskKind::Deliver);
        assert_eq!(retry.depth, 3);
        assert_eq!(retry.next.as_deref(), Some(&continuation));
    }

    #[tokio::test]
    async fn fetch_of_owned_object_is_a_no_op() {
        let (executor, _db, _dir) = executor().await;
        let result = executor.execute(&task(TaskSpec::fetch(BASE))).await.unwrap();
        assert!(matches!(result, Execution::Done));
    }

    #[tokio::test]
    async fn process_without_payload_is_unprocessable() {
        let (executor, _db, _dir) = executor().await;
        let mut spec = TaskSpec::process("https://b.example/x", "{}");
        spec.payload = None;

        let result = executor.execute(&task(spec)).await;
        assert!(matches!(result, Err(AppError::Unprocessable(_))));
    }

    #[tokio::test]
    async fn process_task_runs_inbound_processing() {
        let (executor, db, _dir) = executor().await;
        let person = serde_json::json!({
            "id": "https://b.example/u/bob",
            "type": "Person",
            "inbox": "https://b.example/u/bob/inbox"
        });

        executor
            .execute(&task(TaskSpec::process(
                "https://b.example/u/bob",
                person.to_string(),
            )))
            .await
            .unwrap();
        assert!(db.get_actor("https://b.example/u/bob").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn unresolvable_peer_is_retried_later() {
        let (executor, queue, db, _dir) = setup(false).await;
        let id = queue
            .enqueue(TaskSpec::fetch("https://peer.invalid/u/bob"))
            .await
            .unwrap();
        let before = Utc::now();

        assert!(queue.run_once(&executor).await.unwrap());

        let task = db.get_task(&id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.attempts, 1);
        assert!(task.run_at > before);
        assert!(task.last_error.unwrap().contains("peer.invalid"));
    }
}
