//! Persistence contract consumed by the federation engine
//!
//! The engine only talks to storage through [`Store`]. Every method that
//! touches more than one row runs in a single transaction in the
//! implementation; errors are already translated to [`AppError`].
//! Row-level locking is not assumed: conflicting writes on one IRI are
//! serialized by the caller (see `federation::lock`).

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::models::*;
use crate::error::AppError;

type Result<T> = std::result::Result<T, AppError>;

#[async_trait]
pub trait Store: Send + Sync {
    // =========================================================================
    // Object cache
    // =========================================================================

    async fn exists(&self, iri: &str) -> Result<bool>;

    /// Fails with `AppError::NotFound` when the IRI is not cached.
    async fn get(&self, iri: &str) -> Result<CachedObject>;

    async fn create(&self, object: &NewObject) -> Result<()>;

    /// Replace the raw payload of a cached object.
    async fn update(&self, iri: &str, raw_payload: &str) -> Result<()>;

    async fn delete(&self, iri: &str) -> Result<()>;

    /// Mark a cached object as re-fetched now.
    async fn touch(&self, iri: &str, raw_payload: &str, fetched_at: DateTime<Utc>) -> Result<()>;

    // =========================================================================
    // Collections
    // =========================================================================

    async fn collection_contains(&self, collection: &str, member: &str) -> Result<bool>;

    /// Idempotent: adding an existing member is a no-op.
    async fn add_member(&self, collection: &str, member: &str) -> Result<()>;

    /// Members inserted strictly before `cursor`, newest first.
    async fn get_page(&self, collection: &str, cursor: i64) -> Result<CollectionPage>;

    async fn collection_stats(&self, collection: &str) -> Result<CollectionStats>;

    /// Persist an outgoing activity and append it to `outbox` atomically.
    async fn add_outbox(&self, activity: &NewObject, outbox: &str) -> Result<()>;

    // =========================================================================
    // Local resolution
    // =========================================================================

    async fn resolve_local(&self, local: LocalRef) -> Result<LocalEntity>;

    // =========================================================================
    // Follows
    // =========================================================================

    /// Insert a pending follow. Re-following an existing pair returns the
    /// existing edge unchanged.
    async fn put_follow(&self, follow: &NewFollow) -> Result<Follow>;

    async fn get_follow_by_iri(&self, iri: &str) -> Result<Option<Follow>>;

    /// Mark the follow accepted and record followers/following membership.
    ///
    /// Returns false when the follow was already accepted.
    async fn accept_follow(&self, iri: &str) -> Result<bool>;

    async fn follows_exists(&self, follower: &str, followee: &str) -> Result<bool>;

    /// Members of `actor`'s followers collection, oldest first.
    async fn followers(&self, actor: &str) -> Result<Vec<String>>;

    /// IRI of `actor`'s followers collection, falling back to
    /// `<actor>/followers` for actors that do not advertise one.
    async fn followers_collection(&self, actor: &str) -> Result<String>;

    // =========================================================================
    // Key material
    // =========================================================================

    /// Fails with `AppError::NotFound` unless `iri` is a local actor.
    async fn get_private_key_for_actor(&self, iri: &str) -> Result<String>;

    async fn get_public_key_for_actor(&self, iri: &str) -> Result<Option<String>>;

    // =========================================================================
    // Actors
    // =========================================================================

    /// Insert or refresh a mirrored remote person together with its cached
    /// document.
    async fn upsert_actor(
        &self,
        actor: &RemoteActor,
        raw: &str,
        fetched_at: DateTime<Utc>,
    ) -> Result<Actor>;

    async fn upsert_collective(
        &self,
        collective: &RemoteCollective,
        raw: &str,
        fetched_at: DateTime<Utc>,
    ) -> Result<Collective>;

    /// Inbox of any known actor, person or collective.
    async fn actor_inbox(&self, iri: &str) -> Result<Option<String>>;

    async fn local_user_by_iri(&self, iri: &str) -> Result<Option<Actor>>;

    async fn local_user_by_username(&self, username: &str) -> Result<Option<Actor>>;

    async fn create_local_user(&self, user: &NewLocalActor) -> Result<Actor>;

    /// Create the local collective unless one with that IRI already exists.
    async fn ensure_local_collective(&self, collective: &NewLocalCollective) -> Result<Collective>;

    // =========================================================================
    // Articles
    // =========================================================================

    async fn article_by_iri(&self, iri: &str) -> Result<Option<Article>>;

    async fn local_article_by_title(&self, title: &str) -> Result<Option<Article>>;

    /// Article row, object cache entry and first revision in one transaction.
    async fn create_local_article(
        &self,
        article: &NewArticle,
        revision: &NewRevision,
    ) -> Result<Article>;

    async fn persist_remote_article(
        &self,
        article: &RemoteArticle,
        raw: &str,
        revision: &NewRevision,
        fetched_at: DateTime<Utc>,
    ) -> Result<Article>;

    /// Append a revision and set the article's current content. `raw`
    /// refreshes the cached document of remote articles.
    async fn append_revision(
        &self,
        article_id: i64,
        content: &str,
        revision: &NewRevision,
        raw: Option<&str>,
    ) -> Result<Revision>;

    /// History oldest first.
    async fn revisions(&self, article_id: i64) -> Result<Vec<Revision>>;
}
