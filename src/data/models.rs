//! Data models
//!
//! Rust structs representing persisted federation state.
//! Row structs derive `sqlx::FromRow`; the `New*`/`Remote*` structs are
//! insert payloads built by the federation layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppError;

// =============================================================================
// ID Types
// =============================================================================

/// Entity ID wrapper (ULID format, 26 characters)
///
/// Used as the opaque suffix of locally minted IRIs and as task ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    /// Generate a new ULID
    pub fn new() -> Self {
        Self(ulid::Ulid::new().to_string())
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Object cache
// =============================================================================

/// Table a local object is materialized from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LocalTable {
    Users,
    Articles,
    Collectives,
}

impl LocalTable {
    pub fn as_str(&self) -> &'static str {
        match self {
            LocalTable::Users => "users",
            LocalTable::Articles => "articles",
            LocalTable::Collectives => "collectives",
        }
    }
}

impl std::str::FromStr for LocalTable {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "users" => Ok(LocalTable::Users),
            "articles" => Ok(LocalTable::Articles),
            "collectives" => Ok(LocalTable::Collectives),
            other => Err(AppError::Internal(anyhow::anyhow!(
                "unknown local table {}",
                other
            ))),
        }
    }
}

/// Pointer to a local row from which the wire form is re-derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalRef {
    pub table: LocalTable,
    pub id: i64,
}

/// One federation object known to this node.
///
/// Exactly one of `raw_payload` and `local_ref` is set.
#[derive(Debug, Clone)]
pub struct CachedObject {
    pub iri: String,
    pub type_name: String,
    pub raw_payload: Option<String>,
    pub is_local: bool,
    pub local_ref: Option<LocalRef>,
    pub last_fetched: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct ObjectRow {
    pub iri: String,
    pub ap_type: String,
    pub raw_json: Option<String>,
    pub is_local: bool,
    pub local_table: Option<String>,
    pub local_id: Option<i64>,
    pub last_fetched: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<ObjectRow> for CachedObject {
    type Error = AppError;

    fn try_from(row: ObjectRow) -> Result<Self, Self::Error> {
        let local_ref = match (row.local_table, row.local_id) {
            (Some(table), Some(id)) => Some(LocalRef {
                table: table.parse()?,
                id,
            }),
            _ => None,
        };
        Ok(Self {
            iri: row.iri,
            type_name: row.ap_type,
            raw_payload: row.raw_json,
            is_local: row.is_local,
            local_ref,
            last_fetched: row.last_fetched,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Insert payload for the object cache.
#[derive(Debug, Clone)]
pub struct NewObject {
    pub iri: String,
    pub type_name: String,
    pub raw_payload: Option<String>,
    pub is_local: bool,
    pub local_ref: Option<LocalRef>,
}

impl NewObject {
    /// A remote (or locally authored, serialized) activity or object.
    pub fn raw(iri: impl Into<String>, type_name: impl Into<String>, raw: String) -> Self {
        Self {
            iri: iri.into(),
            type_name: type_name.into(),
            raw_payload: Some(raw),
            is_local: false,
            local_ref: None,
        }
    }
}

// =============================================================================
// Collections
// =============================================================================

/// One page of a collection, newest first.
#[derive(Debug, Clone, Default)]
pub struct CollectionPage {
    pub items: Vec<String>,
    /// Cursor for the following (older) page, if any
    pub next: Option<i64>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CollectionStats {
    pub total_items: i64,
    /// Cursor addressing the first (newest) page
    pub start: i64,
}

// =============================================================================
// Follows
// =============================================================================

/// A directed follow edge. Unique on (follower, followee).
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Follow {
    pub id: i64,
    pub iri: String,
    pub follower: String,
    pub followee: String,
    pub follower_inbox: Option<String>,
    pub accepted: bool,
    /// Original serialized Follow activity
    pub raw: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewFollow {
    pub iri: String,
    pub follower: String,
    pub followee: String,
    pub follower_inbox: Option<String>,
    pub raw: Option<String>,
}

// =============================================================================
// Actors
// =============================================================================

/// A person, local or mirrored from a remote node.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Actor {
    pub id: i64,
    pub ap_id: String,
    pub username: String,
    pub name: Option<String>,
    /// None for local users
    pub host: Option<String>,
    pub summary: Option<String>,
    pub url: Option<String>,
    pub inbox: String,
    pub outbox: Option<String>,
    pub followers: Option<String>,
    pub following: Option<String>,
    pub public_key_pem: Option<String>,
    #[serde(skip_serializing)]
    pub private_key_pem: Option<String>,
    pub is_local: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_fetched: Option<DateTime<Utc>>,
}

/// Fields extracted from a remote actor document.
#[derive(Debug, Clone, Default)]
pub struct RemoteActor {
    pub ap_id: String,
    pub username: String,
    pub name: Option<String>,
    pub host: String,
    pub summary: Option<String>,
    pub url: Option<String>,
    pub inbox: String,
    pub outbox: Option<String>,
    pub followers: Option<String>,
    pub following: Option<String>,
    pub public_key_pem: Option<String>,
}

/// Insert payload for a local user.
#[derive(Debug, Clone)]
pub struct NewLocalActor {
    pub ap_id: String,
    pub username: String,
    pub name: Option<String>,
    pub summary: Option<String>,
    pub inbox: String,
    pub outbox: String,
    pub followers: String,
    pub following: String,
    pub public_key_pem: String,
    pub private_key_pem: String,
}

/// A group actor. The instance actor is the local collective at the base URL.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Collective {
    pub id: i64,
    pub ap_id: String,
    /// Protocol type, usually "Group"
    pub kind: String,
    pub name: String,
    pub host: Option<String>,
    pub summary: Option<String>,
    pub url: Option<String>,
    pub inbox: String,
    pub outbox: Option<String>,
    pub followers: Option<String>,
    pub following: Option<String>,
    pub public_key_pem: Option<String>,
    #[serde(skip_serializing)]
    pub private_key_pem: Option<String>,
    pub is_local: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_fetched: Option<DateTime<Utc>>,
}

/// Fields extracted from a remote Group/Service/Application document.
#[derive(Debug, Clone, Default)]
pub struct RemoteCollective {
    pub ap_id: String,
    pub kind: String,
    pub name: String,
    pub host: String,
    pub summary: Option<String>,
    pub url: Option<String>,
    pub inbox: String,
    pub outbox: Option<String>,
    pub followers: Option<String>,
    pub public_key_pem: Option<String>,
}

/// Insert payload for a locally owned collective.
#[derive(Debug, Clone)]
pub struct NewLocalCollective {
    pub ap_id: String,
    pub name: String,
    pub summary: Option<String>,
    pub inbox: String,
    pub outbox: String,
    pub followers: String,
    pub following: String,
    pub public_key_pem: String,
    pub private_key_pem: String,
}

// =============================================================================
// Articles
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Article {
    pub id: i64,
    pub ap_id: String,
    pub title: String,
    /// None for local articles
    pub host: Option<String>,
    pub summary: Option<String>,
    pub content: String,
    pub media_type: String,
    pub attributed_to: Option<String>,
    pub url: Option<String>,
    pub is_local: bool,
    pub published: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Insert payload for a locally authored article.
#[derive(Debug, Clone)]
pub struct NewArticle {
    pub ap_id: String,
    pub title: String,
    pub summary: Option<String>,
    pub content: String,
    pub media_type: String,
    pub attributed_to: String,
    pub url: Option<String>,
}

/// Fields extracted from a remote Article document.
#[derive(Debug, Clone)]
pub struct RemoteArticle {
    pub ap_id: String,
    pub title: String,
    pub host: String,
    pub summary: Option<String>,
    pub content: String,
    pub media_type: String,
    pub attributed_to: Option<String>,
    pub url: Option<String>,
}

/// One immutable edit in an article's linear history.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Revision {
    pub id: i64,
    pub article_id: i64,
    /// Protocol IRI, from the remote Update or minted locally
    pub ap_id: String,
    pub author: String,
    pub summary: String,
    pub patch: String,
    pub prev_revision_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewRevision {
    pub ap_id: String,
    pub author: String,
    pub summary: String,
    pub patch: String,
}

// =============================================================================
// Local resolution
// =============================================================================

/// A local row referenced by a cached object's `LocalRef`.
#[derive(Debug, Clone)]
pub enum LocalEntity {
    User(Actor),
    Article(Article),
    Collective(Collective),
}
