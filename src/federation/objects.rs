//! Object store façade
//!
//! [`ObjectCache`] wraps the raw [`Store`] with what only this node knows:
//! its own authority (for ownership checks), per-IRI locking, and how to
//! render local rows back into protocol documents.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::debug;

use super::client::authority_of;
use super::convert;
use super::lock::{IriLockGuard, IriLocks};
use crate::data::{Actor, Collective, LocalEntity, Store};
use crate::error::AppError;

type Result<T> = std::result::Result<T, AppError>;

#[derive(Clone)]
pub struct ObjectCache {
    store: Arc<dyn Store>,
    locks: IriLocks,
    base_url: String,
    authority: String,
}

impl ObjectCache {
    pub fn new(store: Arc<dyn Store>, base_url: impl Into<String>) -> Result<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let authority = authority_of(&base_url)
            .ok_or_else(|| AppError::Config(format!("base URL {} has no host", base_url)))?;
        Ok(Self {
            store,
            locks: IriLocks::new(),
            base_url,
            authority,
        })
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Serialize read-modify-write work on one IRI.
    pub async fn lock(&self, iri: &str) -> IriLockGuard {
        self.locks.lock(iri).await
    }

    /// Whether `iri` is under this node's authority, existing or not.
    pub fn is_local_iri(&self, iri: &str) -> bool {
        authority_of(iri).is_some_and(|authority| authority == self.authority)
    }

    /// Whether this node owns `iri`: same authority and the object exists.
    pub async fn owns(&self, iri: &str) -> Result<bool> {
        if !self.is_local_iri(iri) {
            return Ok(false);
        }
        self.store.exists(iri).await
    }

    /// Protocol document for `iri`: the cached payload of remote objects,
    /// a fresh rendering for local ones.
    pub async fn get(&self, iri: &str) -> Result<Value> {
        let object = self.store.get(iri).await?;

        if let Some(local) = object.local_ref {
            return Ok(match self.store.resolve_local(local).await? {
                LocalEntity::User(actor) => convert::person_document(&actor),
                LocalEntity::Article(article) => convert::article_document(&article),
                LocalEntity::Collective(collective) => convert::group_document(&collective),
            });
        }

        let raw = object.raw_payload.ok_or_else(|| {
            AppError::Internal(anyhow::anyhow!("cached object {} has no payload", iri))
        })?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Render a collection. Without a cursor this is the collection head;
    /// with one it is the page of members inserted before the cursor.
    /// `expand` inlines each member's document (outboxes list activities).
    pub async fn collection(&self, iri: &str, cursor: Option<i64>, expand: bool) -> Result<Value> {
        let Some(cursor) = cursor else {
            let stats = self.store.collection_stats(iri).await?;
            let first = format!("{}?last={}", iri, stats.start);
            return Ok(convert::ordered_collection(iri, stats.total_items, &first));
        };

        let page = self.store.get_page(iri, cursor).await?;
        let mut items = Vec::with_capacity(page.items.len());
        for member in page.items {
            if !expand {
                items.push(Value::String(member));
                continue;
            }
            match self.get(&member).await {
                Ok(document) => items.push(document),
                Err(AppError::NotFound) => {
                    debug!(collection = %iri, %member, "Collection member no longer cached");
                    items.push(Value::String(member));
                }
                Err(e) => return Err(e),
            }
        }

        Ok(convert::ordered_collection_page(
            &format!("{}?last={}", iri, cursor),
            iri,
            items,
            page.next.map(|next| format!("{}?last={}", iri, next)),
        ))
    }

    /// Upsert a remote person from its document.
    pub async fn ingest_actor(&self, document: &Value) -> Result<Actor> {
        let actor = convert::remote_actor(document)?;
        if self.is_local_iri(&actor.ap_id) {
            return Err(AppError::Forbidden(format!(
                "{} is under this node's authority",
                actor.ap_id
            )));
        }
        let _guard = self.lock(&actor.ap_id).await;
        self.store
            .upsert_actor(&actor, &document.to_string(), Utc::now())
            .await
    }

    /// Upsert a remote Group/Service/Application from its document.
    pub async fn ingest_collective(&self, document: &Value) -> Result<Collective> {
        let collective = convert::remote_collective(document)?;
        if self.is_local_iri(&collective.ap_id) {
            return Err(AppError::Forbidden(format!(
                "{} is under this node's authority",
                collective.ap_id
            )));
        }
        let _guard = self.lock(&collective.ap_id).await;
        self.store
            .upsert_collective(&collective, &document.to_string(), Utc::now())
            .await
    }
}
