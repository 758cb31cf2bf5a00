//! Activity delivery
//!
//! Outgoing activities are written to the sender's outbox first and then
//! handed to the task queue, one Deliver per recipient. Recipients whose
//! inbox is not yet known get a Fetch chained in front of the Deliver.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, error, info};

use super::convert;
use crate::data::{Article, EntityId, NewFollow, NewObject, Revision, Store};
use crate::error::AppError;
use crate::metrics::ACTIVITYPUB_ACTIVITIES_SENT;
use crate::queue::{TaskQueue, TaskSpec};

type Result<T> = std::result::Result<T, AppError>;

/// Outbox collection of a local actor.
pub fn outbox_of(actor: &str) -> String {
    format!("{}/outbox", actor)
}

/// Serialized activity persisted in an outbox.
struct Outgoing {
    iri: String,
    kind: String,
    payload: String,
}

#[derive(Clone)]
pub struct DeliveryPipeline {
    store: Arc<dyn Store>,
    queue: TaskQueue,
    instance_actor: String,
}

impl DeliveryPipeline {
    pub fn new(store: Arc<dyn Store>, queue: TaskQueue, instance_actor: impl Into<String>) -> Self {
        Self {
            store,
            queue,
            instance_actor: instance_actor.into(),
        }
    }

    pub fn instance_actor(&self) -> &str {
        &self.instance_actor
    }

    /// Serialize `activity` and append it to `from`'s outbox.
    async fn persist(&self, activity: &Value, from: &str) -> Result<Outgoing> {
        let iri = activity
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::MissingProperty("id".to_string()))?
            .to_string();
        let kind = convert::type_name(activity)
            .ok_or_else(|| AppError::MissingProperty("type".to_string()))?
            .to_string();
        let payload = serde_json::to_string(activity)?;

        self.store
            .add_outbox(&NewObject::raw(&iri, &kind, payload.clone()), &outbox_of(from))
            .await?;
        debug!(activity = %iri, outbox = %outbox_of(from), "Activity added to outbox");

        Ok(Outgoing { iri, kind, payload })
    }

    /// The task chain delivering `payload` to `to`.
    async fn delivery_spec(&self, to: &str, from: &str, payload: &str) -> Result<TaskSpec> {
        let deliver = TaskSpec::deliver(to, from, payload);
        if self.store.actor_inbox(to).await?.is_some() {
            return Ok(deliver);
        }
        debug!(recipient = %to, "Recipient inbox unknown, fetching first");
        Ok(TaskSpec::fetch(to).at_depth(1).then(deliver.at_depth(1)))
    }

    async fn enqueue_delivery(
        &self,
        outgoing: &Outgoing,
        to: &str,
        from: &str,
        then: Option<TaskSpec>,
    ) -> Result<String> {
        let mut spec = self.delivery_spec(to, from, &outgoing.payload).await?;
        if let Some(continuation) = then {
            spec = append(spec, continuation);
        }
        let id = self.queue.enqueue(spec).await?;
        ACTIVITYPUB_ACTIVITIES_SENT
            .with_label_values(&[outgoing.kind.as_str()])
            .inc();
        Ok(id)
    }

    /// Send `activity` from `from` to one recipient.
    pub async fn deliver(&self, activity: &Value, to: &str, from: &str) -> Result<()> {
        let outgoing = self.persist(activity, from).await?;
        self.enqueue_delivery(&outgoing, to, from, None).await?;
        info!(activity = %outgoing.iri, recipient = %to, "Delivery scheduled");
        Ok(())
    }

    /// Like [`deliver`](Self::deliver), running `then` once the recipient
    /// has acknowledged the activity.
    pub async fn deliver_then(
        &self,
        activity: &Value,
        to: &str,
        from: &str,
        then: TaskSpec,
    ) -> Result<()> {
        let outgoing = self.persist(activity, from).await?;
        self.enqueue_delivery(&outgoing, to, from, Some(then)).await?;
        info!(activity = %outgoing.iri, recipient = %to, "Delivery scheduled");
        Ok(())
    }

    /// Persist once, then schedule one delivery per recipient. A recipient
    /// that cannot be scheduled is logged and skipped.
    pub async fn batch_deliver(&self, activity: &Value, recipients: &[String], from: &str) -> Result<usize> {
        let outgoing = self.persist(activity, from).await?;

        let mut scheduled = 0;
        for recipient in recipients {
            match self.enqueue_delivery(&outgoing, recipient, from, None).await {
                Ok(_) => scheduled += 1,
                Err(e) => error!(
                    activity = %outgoing.iri,
                    %recipient,
                    error = %e,
                    "Failed to schedule delivery"
                ),
            }
        }

        info!(
            activity = %outgoing.iri,
            recipients = recipients.len(),
            scheduled,
            "Batch delivery scheduled"
        );
        Ok(scheduled)
    }

    /// Announce a newly published local article to the instance followers.
    pub async fn create_local_article(&self, article: &Article) -> Result<()> {
        let activity = convert::wrap(
            "Create",
            &format!("{}/create", article.ap_id),
            &self.instance_actor,
            convert::article_object(article),
            &self.store.followers_collection(&self.instance_actor).await?,
            article.summary.as_deref(),
        );
        let followers = self.store.followers(&self.instance_actor).await?;
        self.batch_deliver(&activity, &followers, &self.instance_actor)
            .await?;
        Ok(())
    }

    /// Announce a new revision of a local article, sent by its author.
    pub async fn update_local_article(
        &self,
        article: &Article,
        revision: &Revision,
        author: &str,
    ) -> Result<()> {
        let summary = Some(revision.summary.as_str()).filter(|s| !s.is_empty());
        let activity = convert::wrap(
            "Update",
            &revision.ap_id,
            author,
            convert::article_object(article),
            &self.store.followers_collection(&self.instance_actor).await?,
            summary,
        );
        let followers = self.store.followers(&self.instance_actor).await?;
        self.batch_deliver(&activity, &followers, author).await?;
        Ok(())
    }

    /// Record a pending follow of `followee` by the local actor `follower`
    /// and send the Follow.
    pub async fn follow_remote_actor(&self, follower: &str, followee: &str) -> Result<String> {
        if self.store.local_user_by_iri(follower).await?.is_none() && follower != self.instance_actor {
            return Err(AppError::NotFoundIri(follower.to_string()));
        }

        let iri = format!("{}/follows/{}", follower, EntityId::new().0);
        let activity = convert::follow(&iri, follower, followee);
        let follow = self
            .store
            .put_follow(&NewFollow {
                iri: iri.clone(),
                follower: follower.to_string(),
                followee: followee.to_string(),
                follower_inbox: self.store.actor_inbox(follower).await?,
                raw: Some(activity.to_string()),
            })
            .await?;

        // Re-following keeps the original edge; resend its Follow.
        let activity = if follow.iri == iri {
            activity
        } else {
            convert::follow(&follow.iri, follower, followee)
        };
        self.deliver(&activity, followee, follower).await?;
        Ok(follow.iri)
    }
}

/// Append `tail` at the end of `chain`.
fn append(mut chain: TaskSpec, tail: TaskSpec) -> TaskSpec {
    chain.next = Some(Box::new(match chain.next.take() {
        Some(next) => append(*next, tail),
        None => tail,
    }));
    chain
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::data::{Database, NewLocalActor, RemoteActor};
    use crate::queue::{TaskKind, TaskStatus};
    use serde_json::json;
    use tempfile::TempDir;

    const INSTANCE: &str = "https://a.example";

    async fn pipeline() -> (DeliveryPipeline, Database, TempDir) {
        let dir = TempDir::new().unwrap();
        let db = Database::connect(&dir.path().join("test.db")).await.unwrap();
        let queue = TaskQueue::new(db.clone(), QueueConfig::default());
        let pipeline = DeliveryPipeline::new(Arc::new(db.clone()), queue, INSTANCE);
        (pipeline, db, dir)
    }

    async fn known_remote(db: &Database, name: &str) -> String {
        let ap_id = format!("https://{}.example/u/{}", name, name);
        db.upsert_actor(
            &RemoteActor {
                ap_id: ap_id.clone(),
                username: name.to_string(),
                host: format!("{}.example", name),
                inbox: format!("{}/inbox", ap_id),
                ..Default::default()
            },
            "{}",
            chrono::Utc::now(),
        )
        .await
        .unwrap();
        ap_id
    }

    fn note(id: &str) -> Value {
        json!({"id": id, "type": "Create", "actor": INSTANCE, "object": "https://a.example/a/X"})
    }

    #[tokio::test]
    async fn fan_out_persists_once_and_enqueues_per_recipient() {
        let (pipeline, db, _dir) = pipeline().await;
        let mut recipients = Vec::new();
        for name in ["b", "c", "d"] {
            recipients.push(known_remote(&db, name).await);
        }

        let scheduled = pipeline
            .batch_deliver(&note("https://a.example/act/1"), &recipients, INSTANCE)
            .await
            .unwrap();

        assert_eq!(scheduled, 3);
        let outbox = db.collection_stats("https://a.example/outbox").await.unwrap();
        assert_eq!(outbox.total_items, 1);
        let pending = db.tasks_with_status(TaskStatus::Pending).await.unwrap();
        assert_eq!(pending.len(), 3);
        assert!(pending.iter().all(|t| t.spec.kind == TaskKind::Deliver));
    }

    #[tokio::test]
    async fn unknown_inbox_fetches_before_delivering() {
        let (pipeline, db, _dir) = pipeline().await;

        pipeline
            .deliver(&note("https://a.example/act/2"), "https://z.example/u/zed", INSTANCE)
            .await
            .unwrap();

        let pending = db.tasks_with_status(TaskStatus::Pending).await.unwrap();
        assert_eq!(pending.len(), 1);
        let fetch = &pending[0].spec;
        assert_eq!(fetch.kind, TaskKind::Fetch);
        assert_eq!(fetch.target, "https://z.example/u/zed");
        let deliver = fetch.next.as_deref().unwrap();
        assert_eq!(deliver.kind, TaskKind::Deliver);
        assert_eq!(deliver.origin.as_deref(), Some(INSTANCE));
    }

    #[tokio::test]
    async fn outbox_written_even_without_recipients() {
        let (pipeline, db, _dir) = pipeline().await;

        let scheduled = pipeline
            .batch_deliver(&note("https://a.example/act/3"), &[], INSTANCE)
            .await
            .unwrap();

        assert_eq!(scheduled, 0);
        assert!(db.exists("https://a.example/act/3").await.unwrap());
        assert_eq!(db.pending_task_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn continuation_runs_after_the_delivery() {
        let (pipeline, db, _dir) = pipeline().await;
        let bob = known_remote(&db, "b").await;

        pipeline
            .deliver_then(
                &note("https://a.example/accept/1"),
                &bob,
                INSTANCE,
                TaskSpec::process("https://a.example/accept/1", "{}"),
            )
            .await
            .unwrap();

        let pending = db.tasks_with_status(TaskStatus::Pending).await.unwrap();
        let deliver = &pending[0].spec;
        assert_eq!(deliver.kind, TaskKind::Deliver);
        assert_eq!(deliver.next.as_deref().unwrap().kind, TaskKind::Process);
    }

    #[tokio::test]
    async fn follow_remote_actor_stores_pending_edge() {
        let (pipeline, db, _dir) = pipeline().await;
        let base = "https://a.example/u/alice";
        db.create_local_user(&NewLocalActor {
            ap_id: base.to_string(),
            username: "alice".to_string(),
            name: None,
            summary: None,
            inbox: format!("{}/inbox", base),
            outbox: format!("{}/outbox", base),
            followers: format!("{}/followers", base),
            following: format!("{}/following", base),
            public_key_pem: "PUBLIC".to_string(),
            private_key_pem: "PRIVATE".to_string(),
        })
        .await
        .unwrap();
        let bob = known_remote(&db, "b").await;

        let iri = pipeline.follow_remote_actor(base, &bob).await.unwrap();
        let again = pipeline.follow_remote_actor(base, &bob).await.unwrap();

        assert!(iri.starts_with("https://a.example/u/alice/follows/"));
        assert_eq!(iri, again);
        let follow = db.get_follow(base, &bob).await.unwrap().unwrap();
        assert!(!follow.accepted);
        assert_eq!(
            db.collection_stats(&outbox_of(base)).await.unwrap().total_items,
            1
        );
    }

    #[test]
    fn append_extends_the_tail() {
        let chain = TaskSpec::fetch("x").then(TaskSpec::deliver("x", "y", "{}"));
        let chain = append(chain, TaskSpec::process("z", "{}"));
        assert_eq!(chain.chain_len(), 3);
    }
}
