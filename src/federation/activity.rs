//! Activity processing
//!
//! Interprets activities arriving in an inbox and activities submitted to
//! the local outbox, and turns them into store mutations and follow-up
//! deliveries. Activities whose actor is not known yet are deferred: a
//! Fetch of the actor is queued with the reprocessing chained after it.

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info};

use super::client::authority_of;
use super::convert::{self, object_id, type_name};
use super::delivery::DeliveryPipeline;
use super::objects::ObjectCache;
use crate::config::FollowerPolicy;
use crate::data::{Actor, EntityId, NewArticle, NewFollow, NewRevision};
use crate::diff::make_diff;
use crate::error::AppError;
use crate::queue::{MAX_CHAIN_DEPTH, TaskQueue, TaskSpec};

type Result<T> = std::result::Result<T, AppError>;

/// Actor types mirrored as collectives.
const COLLECTIVE_TYPES: &[&str] = &["Group", "Service", "Application", "Organization"];

/// Activities and objects this node understands.
#[derive(Debug, Clone)]
pub enum Activity {
    Follow(Value),
    Accept(Value),
    Create(Value),
    Update(Value),
    Delete(Value),
    Person(Value),
    Group(Value),
    Article(Value),
    Unsupported(String),
}

impl Activity {
    /// Classify a document by its `type`.
    pub fn parse(document: Value) -> Result<Self> {
        let kind = type_name(&document)
            .ok_or_else(|| AppError::MissingProperty("type".to_string()))?
            .to_string();

        Ok(match kind.as_str() {
            "Follow" => Self::Follow(document),
            "Accept" => Self::Accept(document),
            "Create" => Self::Create(document),
            "Update" => Self::Update(document),
            "Delete" => Self::Delete(document),
            "Person" => Self::Person(document),
            "Article" => Self::Article(document),
            k if COLLECTIVE_TYPES.contains(&k) => Self::Group(document),
            _ => Self::Unsupported(kind),
        })
    }
}

fn process_id(document: &Value) -> Result<&str> {
    document
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| AppError::MissingProperty("id".to_string()))
}

/// The `actor` property as an IRI; embedded actors must carry an id.
fn process_actor(document: &Value) -> Result<&str> {
    match document.get("actor") {
        None | Some(Value::Null) => Err(AppError::MissingProperty("actor".to_string())),
        Some(actor) => object_id(actor)
            .ok_or_else(|| AppError::UnprocessablePropValue("actor has no id".to_string())),
    }
}

fn object_prop(document: &Value) -> Result<&Value> {
    match document.get("object") {
        None | Some(Value::Null) => Err(AppError::MissingProperty("object".to_string())),
        Some(object) => Ok(object),
    }
}

fn summary_of(document: &Value) -> String {
    document
        .get("summary")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Title and body of an embedded Article submitted by a local author.
fn process_article_object(object: &Value) -> Result<(String, String)> {
    if !object.is_object() {
        return Err(AppError::UnprocessablePropValue(
            "object must be an embedded Article".to_string(),
        ));
    }
    if type_name(object) != Some("Article") {
        return Err(AppError::Unsupported(format!(
            "{} objects",
            type_name(object).unwrap_or("untyped")
        )));
    }

    let content = object
        .get("content")
        .and_then(Value::as_str)
        .ok_or_else(|| AppError::MissingProperty("content".to_string()))?;
    let title = object
        .get("name")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|title| !title.is_empty())
        .ok_or_else(|| AppError::MissingProperty("name".to_string()))?;

    Ok((title.to_string(), content.to_string()))
}

/// Where a revision produced by ingesting a remote article comes from.
struct RevisionSource<'a> {
    iri: Option<&'a str>,
    author: &'a str,
    summary: String,
}

pub struct ActivityProcessor {
    objects: ObjectCache,
    queue: TaskQueue,
    delivery: DeliveryPipeline,
    follower_policy: FollowerPolicy,
}

impl ActivityProcessor {
    pub fn new(
        objects: ObjectCache,
        queue: TaskQueue,
        delivery: DeliveryPipeline,
        follower_policy: FollowerPolicy,
    ) -> Self {
        Self {
            objects,
            queue,
            delivery,
            follower_policy,
        }
    }

    pub fn objects(&self) -> &ObjectCache {
        &self.objects
    }

    pub fn delivery(&self) -> &DeliveryPipeline {
        &self.delivery
    }

    /// Handle an activity received in an inbox. `depth` is the chain
    /// generation it is being processed at (0 when it came over HTTP).
    pub async fn process(&self, document: Value, depth: u32) -> Result<()> {
        match Activity::parse(document)? {
            Activity::Follow(doc) => self.handle_follow(&doc, depth).await,
            Activity::Accept(doc) => self.handle_accept(&doc).await,
            Activity::Create(doc) => self.handle_create(&doc, depth).await,
            Activity::Update(doc) => self.handle_update(&doc, depth).await,
            Activity::Delete(doc) => self.handle_delete(&doc).await,
            Activity::Person(doc) | Activity::Group(doc) | Activity::Article(doc) => {
                self.ingest_object(&doc).await
            }
            Activity::Unsupported(kind) => Err(AppError::Unsupported(kind)),
        }
    }

    /// Handle an activity a local author submitted to the outbox.
    pub async fn process_outbox(&self, document: Value, depth: u32) -> Result<()> {
        match Activity::parse(document)? {
            Activity::Create(doc) => self.handle_create_outbox(&doc, depth).await,
            Activity::Update(doc) => self.handle_update_outbox(&doc, depth).await,
            Activity::Follow(doc) => self.handle_follow_outbox(&doc, depth).await,
            Activity::Unsupported(kind) => Err(AppError::Unsupported(kind)),
            Activity::Accept(_) => Err(AppError::Unsupported("Accept in outbox".to_string())),
            Activity::Delete(_) => Err(AppError::Unsupported("Delete in outbox".to_string())),
            Activity::Person(_) | Activity::Group(_) | Activity::Article(_) => Err(
                AppError::Unsupported("bare objects in outbox".to_string()),
            ),
        }
    }

    /// Mirror a dereferenced actor or article.
    pub async fn ingest_object(&self, document: &Value) -> Result<()> {
        match type_name(document) {
            Some("Person") => {
                let actor = self.objects.ingest_actor(document).await?;
                debug!(actor = %actor.ap_id, "Ingested actor");
            }
            Some(kind) if COLLECTIVE_TYPES.contains(&kind) => {
                let collective = self.objects.ingest_collective(document).await?;
                debug!(actor = %collective.ap_id, kind, "Ingested collective");
            }
            Some("Article") => {
                let iri = process_id(document)?;
                let author = document
                    .get("attributedTo")
                    .and_then(object_id)
                    .unwrap_or(iri);
                self.ingest_article(
                    document,
                    RevisionSource {
                        iri: None,
                        author,
                        summary: String::new(),
                    },
                )
                .await?;
            }
            Some(other) => {
                return Err(AppError::Unprocessable(format!("cannot ingest {} objects", other)));
            }
            None => return Err(AppError::MissingProperty("type".to_string())),
        }
        Ok(())
    }

    // =========================================================================
    // Shared steps
    // =========================================================================

    async fn actor_known(&self, actor: &str) -> Result<bool> {
        Ok(self.objects.store().actor_inbox(actor).await?.is_some())
    }

    /// Queue a Fetch of `actor` followed by reprocessing `document`.
    async fn defer(&self, actor: &str, document: &Value, depth: u32, outbox: bool) -> Result<()> {
        let next_depth = depth + 1;
        if next_depth > MAX_CHAIN_DEPTH {
            return Err(AppError::Unprocessable(format!(
                "{} still unknown after {} deferrals",
                actor, depth
            )));
        }

        let target = document.get("id").and_then(Value::as_str).unwrap_or(actor);
        let payload = document.to_string();
        let reprocess = if outbox {
            TaskSpec::process_outbox(target, payload)
        } else {
            TaskSpec::process(target, payload)
        };
        self.queue
            .enqueue(
                TaskSpec::fetch(actor)
                    .at_depth(next_depth)
                    .then(reprocess.at_depth(next_depth)),
            )
            .await?;

        info!(%actor, activity = %target, depth = next_depth, "Actor unknown, processing deferred");
        Ok(())
    }

    /// The local user behind an outbox activity. `None` means processing
    /// was deferred until the actor is fetched.
    async fn local_author(&self, actor: &str, document: &Value, depth: u32) -> Result<Option<Actor>> {
        if let Some(user) = self.objects.store().local_user_by_iri(actor).await? {
            return Ok(Some(user));
        }
        if self.objects.is_local_iri(actor) {
            return Err(AppError::NotFoundIri(actor.to_string()));
        }
        if self.actor_known(actor).await? {
            return Err(AppError::Forbidden(format!("{} is not a local user", actor)));
        }
        self.defer(actor, document, depth, true).await?;
        Ok(None)
    }

    async fn is_local_actor(&self, iri: &str) -> Result<bool> {
        if iri == self.delivery.instance_actor() {
            return Ok(true);
        }
        Ok(self.objects.store().local_user_by_iri(iri).await?.is_some())
    }

    /// Create or extend the local mirror of a remote article.
    async fn ingest_article(&self, document: &Value, source: RevisionSource<'_>) -> Result<()> {
        let article = convert::remote_article(document)?;
        if self.objects.is_local_iri(&article.ap_id) {
            return Err(AppError::Forbidden(format!(
                "{} is a local article",
                article.ap_id
            )));
        }

        let _guard = self.objects.lock(&article.ap_id).await;
        let store = self.objects.store();
        let raw = document.to_string();
        let now = Utc::now();
        let revision_iri = |prefix: &str| {
            source
                .iri
                .map(str::to_string)
                .unwrap_or_else(|| format!("{}#rev-{}", prefix, EntityId::new().0))
        };

        match store.article_by_iri(&article.ap_id).await? {
            None => {
                let revision = NewRevision {
                    ap_id: revision_iri(&article.ap_id),
                    author: source.author.to_string(),
                    summary: source.summary.clone(),
                    patch: make_diff("", &article.content),
                };
                store
                    .persist_remote_article(&article, &raw, &revision, now)
                    .await?;
                info!(article = %article.ap_id, title = %article.title, "Remote article stored");
            }
            Some(existing) if existing.is_local => {
                return Err(AppError::Forbidden(format!(
                    "{} is a local article",
                    existing.ap_id
                )));
            }
            Some(existing) if existing.content == article.content && source.iri.is_none() => {
                store.touch(&article.ap_id, &raw, now).await?;
                debug!(article = %article.ap_id, "Remote article unchanged");
            }
            Some(existing) => {
                let revision = NewRevision {
                    ap_id: revision_iri(&article.ap_id),
                    author: source.author.to_string(),
                    summary: source.summary.clone(),
                    patch: make_diff(&existing.content, &article.content),
                };
                let stored = store
                    .append_revision(existing.id, &article.content, &revision, Some(&raw))
                    .await?;
                store.touch(&article.ap_id, &raw, now).await?;
                info!(article = %article.ap_id, revision = %stored.ap_id, "Remote article revised");
            }
        }
        Ok(())
    }

    // =========================================================================
    // Inbound
    // =========================================================================

    /// Only actors on an object's own host may create, revise or delete it.
    fn ensure_same_host(actor: &str, iri: &str, verb: &str) -> Result<()> {
        if authority_of(iri).is_none() || authority_of(iri) != authority_of(actor) {
            return Err(AppError::Forbidden(format!("{} cannot {} {}", actor, verb, iri)));
        }
        Ok(())
    }

    async fn handle_follow(&self, document: &Value, depth: u32) -> Result<()> {
        let id = process_id(document)?;
        let actor = process_actor(document)?;
        let followee = object_id(object_prop(document)?)
            .ok_or_else(|| AppError::UnprocessablePropValue("object has no id".to_string()))?;

        if !self.objects.owns(followee).await? {
            return Err(AppError::NotFoundIri(followee.to_string()));
        }
        if !self.is_local_actor(followee).await? {
            return Err(AppError::UnprocessablePropValue(format!(
                "{} cannot be followed",
                followee
            )));
        }
        if !self.actor_known(actor).await? {
            return self.defer(actor, document, depth, false).await;
        }

        let store = self.objects.store();
        let follow = {
            let _guard = self.objects.lock(id).await;
            let follow = store
                .put_follow(&NewFollow {
                    iri: id.to_string(),
                    follower: actor.to_string(),
                    followee: followee.to_string(),
                    follower_inbox: store.actor_inbox(actor).await?,
                    raw: Some(document.to_string()),
                })
                .await?;

            if self.follower_policy == FollowerPolicy::Optimistic {
                let followers = store.followers_collection(followee).await?;
                store.add_member(&followers, actor).await?;
            }
            follow
        };
        info!(follower = %actor, %followee, follow = %follow.iri, "Follow received");

        let accept_iri = format!("{}/accept/{}", self.objects.base_url(), follow.id);
        let accept = convert::accept(&accept_iri, followee, &follow.iri);
        // The follow is applied locally only once the follower took the Accept.
        let apply = TaskSpec::process(&accept_iri, accept.to_string());
        self.delivery
            .deliver_then(&accept, actor, followee, apply)
            .await
    }

    async fn handle_accept(&self, document: &Value) -> Result<()> {
        let actor = process_actor(document)?;
        let object = object_prop(document)?;
        let follow_iri = match object {
            Value::String(iri) => iri.as_str(),
            Value::Object(_) if type_name(object) == Some("Follow") => object_id(object)
                .ok_or_else(|| AppError::MissingProperty("object id".to_string()))?,
            _ => {
                return Err(AppError::Unsupported(format!(
                    "Accept of {}",
                    type_name(object).unwrap_or("non-Follow object")
                )));
            }
        };

        let _guard = self.objects.lock(follow_iri).await;
        let store = self.objects.store();
        let follow = store
            .get_follow_by_iri(follow_iri)
            .await?
            .ok_or_else(|| AppError::NotFoundIri(follow_iri.to_string()))?;

        if follow.followee != actor {
            return Err(AppError::Forbidden(format!(
                "{} cannot accept a follow of {}",
                actor, follow.followee
            )));
        }

        if store.accept_follow(follow_iri).await? {
            info!(follower = %follow.follower, followee = %follow.followee, "Follow accepted");
        } else {
            debug!(follow = %follow_iri, "Follow already accepted");
        }
        Ok(())
    }

    async fn handle_create(&self, document: &Value, depth: u32) -> Result<()> {
        let actor = process_actor(document)?;
        if !self.actor_known(actor).await? {
            return self.defer(actor, document, depth, false).await;
        }

        let object = object_prop(document)?;
        match object {
            Value::String(iri) => self.fetch_if_unknown(iri).await,
            Value::Object(_) => match type_name(object) {
                Some("Article") => {
                    let iri = object_id(object)
                        .ok_or_else(|| AppError::MissingProperty("object id".to_string()))?;
                    Self::ensure_same_host(actor, iri, "create")?;
                    self.ingest_article(
                        object,
                        RevisionSource {
                            iri: None,
                            author: actor,
                            summary: summary_of(document),
                        },
                    )
                    .await
                }
                Some(other) => Err(AppError::Unsupported(format!("Create of {}", other))),
                None => Err(AppError::MissingProperty("object type".to_string())),
            },
            _ => Err(AppError::UnprocessablePropValue("object".to_string())),
        }
    }

    async fn fetch_if_unknown(&self, iri: &str) -> Result<()> {
        if self.objects.is_local_iri(iri) {
            return Err(AppError::Forbidden(format!("{} is a local object", iri)));
        }
        if !self.objects.store().exists(iri).await? {
            self.queue.enqueue(TaskSpec::fetch(iri)).await?;
            debug!(%iri, "Queued fetch of referenced object");
        }
        Ok(())
    }

    async fn handle_update(&self, document: &Value, depth: u32) -> Result<()> {
        let id = process_id(document)?;
        let actor = process_actor(document)?;
        if !self.actor_known(actor).await? {
            return self.defer(actor, document, depth, false).await;
        }

        let object = object_prop(document)?;
        match object {
            Value::String(iri) => {
                if self.objects.is_local_iri(iri) {
                    return Err(AppError::Forbidden(format!("{} is a local object", iri)));
                }
                self.queue.enqueue(TaskSpec::fetch(iri.as_str())).await?;
                Ok(())
            }
            Value::Object(_) => match type_name(object) {
                Some("Article") => {
                    let iri = object_id(object)
                        .ok_or_else(|| AppError::MissingProperty("object id".to_string()))?;
                    Self::ensure_same_host(actor, iri, "revise")?;
                    self.ingest_article(
                        object,
                        RevisionSource {
                            iri: Some(id),
                            author: actor,
                            summary: summary_of(document),
                        },
                    )
                    .await
                }
                Some(kind) if kind == "Person" || COLLECTIVE_TYPES.contains(&kind) => {
                    if object_id(object) != Some(actor) {
                        return Err(AppError::Forbidden(format!(
                            "{} cannot update another actor",
                            actor
                        )));
                    }
                    self.ingest_object(object).await
                }
                Some(other) => Err(AppError::Unsupported(format!("Update of {}", other))),
                None => Err(AppError::MissingProperty("object type".to_string())),
            },
            _ => Err(AppError::UnprocessablePropValue("object".to_string())),
        }
    }

    async fn handle_delete(&self, document: &Value) -> Result<()> {
        let actor = process_actor(document)?;
        let iri = object_id(object_prop(document)?)
            .ok_or_else(|| AppError::UnprocessablePropValue("object has no id".to_string()))?;

        Self::ensure_same_host(actor, iri, "delete")?;
        if self.objects.is_local_iri(iri) {
            return Err(AppError::Forbidden(format!("{} is a local object", iri)));
        }

        let _guard = self.objects.lock(iri).await;
        match self.objects.store().delete(iri).await {
            Ok(()) => {
                info!(%iri, %actor, "Cached object deleted");
                Ok(())
            }
            Err(AppError::NotFound) => {
                debug!(%iri, "Deleted object was not cached");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    // =========================================================================
    // Outbound
    // =========================================================================

    async fn handle_create_outbox(&self, document: &Value, depth: u32) -> Result<()> {
        let actor = process_actor(document)?;
        let Some(author) = self.local_author(actor, document, depth).await? else {
            return Ok(());
        };

        let object = object_prop(document)?;
        let (title, content) = process_article_object(object)?;
        let iri = format!(
            "{}/a/{}",
            self.objects.base_url(),
            urlencoding::encode(&title)
        );

        let article = {
            let _guard = self.objects.lock(&iri).await;
            let store = self.objects.store();
            if store.local_article_by_title(&title).await?.is_some() {
                return Err(AppError::Conflict(format!("article \"{}\" already exists", title)));
            }

            let media_type = object
                .get("mediaType")
                .and_then(Value::as_str)
                .unwrap_or(convert::LOCAL_MEDIA_TYPE);
            store
                .create_local_article(
                    &NewArticle {
                        ap_id: iri.clone(),
                        title: title.clone(),
                        summary: object
                            .get("summary")
                            .and_then(Value::as_str)
                            .map(str::to_string),
                        content: content.clone(),
                        media_type: media_type.to_string(),
                        attributed_to: self.delivery.instance_actor().to_string(),
                        url: Some(iri.clone()),
                    },
                    &NewRevision {
                        ap_id: format!("{}/revisions/{}", iri, EntityId::new().0),
                        author: author.ap_id.clone(),
                        summary: summary_of(document),
                        patch: make_diff("", &content),
                    },
                )
                .await?
        };
        info!(article = %article.ap_id, author = %author.ap_id, "Local article created");

        self.delivery.create_local_article(&article).await
    }

    async fn handle_update_outbox(&self, document: &Value, depth: u32) -> Result<()> {
        let actor = process_actor(document)?;
        let Some(author) = self.local_author(actor, document, depth).await? else {
            return Ok(());
        };

        let object = object_prop(document)?;
        let iri = object_id(object)
            .ok_or_else(|| AppError::MissingProperty("object".to_string()))?;
        let content = object
            .get("content")
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::MissingProperty("content".to_string()))?;

        let (article, revision) = {
            let _guard = self.objects.lock(iri).await;
            let store = self.objects.store();
            let article = store
                .article_by_iri(iri)
                .await?
                .ok_or_else(|| AppError::NotFoundIri(iri.to_string()))?;
            if !article.is_local {
                return Err(AppError::Forbidden(format!("{} is not a local article", iri)));
            }

            let revision = store
                .append_revision(
                    article.id,
                    content,
                    &NewRevision {
                        ap_id: format!("{}/revisions/{}", article.ap_id, EntityId::new().0),
                        author: author.ap_id.clone(),
                        summary: summary_of(document),
                        patch: make_diff(&article.content, content),
                    },
                    None,
                )
                .await?;
            let article = store
                .article_by_iri(iri)
                .await?
                .ok_or_else(|| AppError::NotFoundIri(iri.to_string()))?;
            (article, revision)
        };
        info!(article = %article.ap_id, revision = %revision.ap_id, "Local article revised");

        self.delivery
            .update_local_article(&article, &revision, &author.ap_id)
            .await
    }

    async fn handle_follow_outbox(&self, document: &Value, depth: u32) -> Result<()> {
        let actor = process_actor(document)?;
        let follower = if actor == self.delivery.instance_actor() {
            actor.to_string()
        } else {
            match self.local_author(actor, document, depth).await? {
                Some(user) => user.ap_id,
                None => return Ok(()),
            }
        };
        let followee = object_id(object_prop(document)?)
            .ok_or_else(|| AppError::UnprocessablePropValue("object has no id".to_string()))?;
        if self.objects.is_local_iri(followee) {
            return Err(AppError::UnprocessablePropValue(format!(
                "{} is a local actor",
                followee
            )));
        }

        self.delivery.follow_remote_actor(&follower, followee).await?;
        Ok(())
    }
}
