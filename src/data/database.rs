//! SQLite database operations
//!
//! All database access goes through this module. `Database` implements the
//! engine's [`Store`] contract; multi-row writes run inside one transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite, SqliteConnection};
use std::path::Path;
use std::time::Duration;

use super::models::*;
use super::store::Store;
use crate::error::AppError;

type Result<T> = std::result::Result<T, AppError>;

/// Page size for every ordered collection.
pub const PAGE_SIZE: i64 = 20;

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: Pool<Sqlite>,
}

/// Map unique-constraint violations to `Conflict`, everything else through
/// the regular translation.
fn conflict_on_unique(err: sqlx::Error, what: &str) -> AppError {
    match &err {
        sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
            AppError::Conflict(format!("{} already exists", what))
        }
        _ => err.into(),
    }
}

async fn followers_collection_in(conn: &mut SqliteConnection, actor: &str) -> Result<String> {
    let advertised = sqlx::query_scalar::<_, Option<String>>(
        r#"
        SELECT followers FROM users WHERE ap_id = ?
        UNION ALL
        SELECT followers FROM collectives WHERE ap_id = ?
        LIMIT 1
        "#,
    )
    .bind(actor)
    .bind(actor)
    .fetch_optional(&mut *conn)
    .await?
    .flatten();

    Ok(advertised.unwrap_or_else(|| format!("{}/followers", actor)))
}

async fn local_following_collection_in(
    conn: &mut SqliteConnection,
    actor: &str,
) -> Result<Option<String>> {
    let following = sqlx::query_scalar::<_, Option<String>>(
        r#"
        SELECT following FROM users WHERE ap_id = ? AND is_local = 1
        UNION ALL
        SELECT following FROM collectives WHERE ap_id = ? AND is_local = 1
        LIMIT 1
        "#,
    )
    .bind(actor)
    .bind(actor)
    .fetch_optional(&mut *conn)
    .await?
    .flatten();

    Ok(following)
}

async fn add_member_in(conn: &mut SqliteConnection, collection: &str, member: &str) -> Result<()> {
    sqlx::query(
        "INSERT OR IGNORE INTO collection_members (collection_iri, member_iri, created_at) VALUES (?, ?, ?)",
    )
    .bind(collection)
    .bind(member)
    .bind(Utc::now())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn upsert_raw_object_in(
    conn: &mut SqliteConnection,
    iri: &str,
    type_name: &str,
    raw: &str,
    fetched_at: Option<DateTime<Utc>>,
) -> Result<()> {
    let now = Utc::now();
    sqlx::query(
        r#"
        INSERT INTO ap_objects (iri, ap_type, raw_json, is_local, last_fetched, created_at, updated_at)
        VALUES (?, ?, ?, 0, ?, ?, ?)
        ON CONFLICT(iri) DO UPDATE SET
            ap_type = excluded.ap_type,
            raw_json = excluded.raw_json,
            last_fetched = COALESCE(excluded.last_fetched, ap_objects.last_fetched),
            updated_at = excluded.updated_at
        WHERE ap_objects.is_local = 0
        "#,
    )
    .bind(iri)
    .bind(type_name)
    .bind(raw)
    .bind(fetched_at)
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn insert_local_object_in(
    conn: &mut SqliteConnection,
    iri: &str,
    type_name: &str,
    local: LocalRef,
) -> Result<()> {
    let now = Utc::now();
    sqlx::query(
        r#"
        INSERT INTO ap_objects (iri, ap_type, raw_json, is_local, local_table, local_id, created_at, updated_at)
        VALUES (?, ?, NULL, 1, ?, ?, ?, ?)
        "#,
    )
    .bind(iri)
    .bind(type_name)
    .bind(local.table.as_str())
    .bind(local.id)
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await
    .map_err(|e| conflict_on_unique(e, iri))?;
    Ok(())
}

async fn insert_revision_in(
    conn: &mut SqliteConnection,
    article_id: i64,
    revision: &NewRevision,
) -> Result<Revision> {
    let prev = sqlx::query_scalar::<_, Option<i64>>(
        "SELECT MAX(id) FROM revisions WHERE article_id = ?",
    )
    .bind(article_id)
    .fetch_one(&mut *conn)
    .await?;

    let inserted = sqlx::query_as::<_, Revision>(
        r#"
        INSERT INTO revisions (article_id, ap_id, author, summary, patch, prev_revision_id, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        RETURNING *
        "#,
    )
    .bind(article_id)
    .bind(&revision.ap_id)
    .bind(&revision.author)
    .bind(&revision.summary)
    .bind(&revision.patch)
    .bind(prev)
    .bind(Utc::now())
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| conflict_on_unique(e, &revision.ap_id))?;

    Ok(inserted)
}

impl Database {
    // =========================================================================
    // Connection
    // =========================================================================

    /// Connect to SQLite database
    ///
    /// Creates the database file if it doesn't exist.
    /// Runs pending migrations automatically.
    ///
    /// # Errors
    /// Returns error if connection or migration fails
    pub async fn connect(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AppError::Database(sqlx::Error::Io(e)))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| {
                tracing::error!("Migration failed: {}", e);
                AppError::Internal(anyhow::anyhow!("Migration failed: {}", e))
            })?;

        tracing::info!(path = %path.display(), "Database connected and migrated successfully");

        Ok(Self { pool })
    }

    pub(crate) fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Follow edge between two actors, if any.
    pub async fn get_follow(&self, follower: &str, followee: &str) -> Result<Option<Follow>> {
        let follow = sqlx::query_as::<_, Follow>(
            "SELECT * FROM follows WHERE follower = ? AND followee = ?",
        )
        .bind(follower)
        .bind(followee)
        .fetch_optional(&self.pool)
        .await?;
        Ok(follow)
    }

    /// Number of rows in a collection, used by tests and diagnostics.
    pub async fn count_members(&self, collection: &str, member: &str) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM collection_members WHERE collection_iri = ? AND member_iri = ?",
        )
        .bind(collection)
        .bind(member)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Remote actor row by IRI.
    pub async fn get_actor(&self, iri: &str) -> Result<Option<Actor>> {
        let actor = sqlx::query_as::<_, Actor>("SELECT * FROM users WHERE ap_id = ?")
            .bind(iri)
            .fetch_optional(&self.pool)
            .await?;
        Ok(actor)
    }

    pub async fn get_collective(&self, iri: &str) -> Result<Option<Collective>> {
        let collective = sqlx::query_as::<_, Collective>("SELECT * FROM collectives WHERE ap_id = ?")
            .bind(iri)
            .fetch_optional(&self.pool)
            .await?;
        Ok(collective)
    }
}

#[async_trait]
impl Store for Database {
    // =========================================================================
    // Object cache
    // =========================================================================

    async fn exists(&self, iri: &str) -> Result<bool> {
        let found = sqlx::query_scalar::<_, i64>("SELECT 1 FROM ap_objects WHERE iri = ?")
            .bind(iri)
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    async fn get(&self, iri: &str) -> Result<CachedObject> {
        let row = sqlx::query_as::<_, ObjectRow>("SELECT * FROM ap_objects WHERE iri = ?")
            .bind(iri)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(AppError::NotFound)?;
        row.try_into()
    }

    async fn create(&self, object: &NewObject) -> Result<()> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO ap_objects (iri, ap_type, raw_json, is_local, local_table, local_id, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&object.iri)
        .bind(&object.type_name)
        .bind(&object.raw_payload)
        .bind(object.is_local)
        .bind(object.local_ref.map(|r| r.table.as_str()))
        .bind(object.local_ref.map(|r| r.id))
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| conflict_on_unique(e, &object.iri))?;
        Ok(())
    }

    async fn update(&self, iri: &str, raw_payload: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE ap_objects SET raw_json = ?, updated_at = ? WHERE iri = ? AND is_local = 0",
        )
        .bind(raw_payload)
        .bind(Utc::now())
        .bind(iri)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound);
        }
        Ok(())
    }

    async fn delete(&self, iri: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query("DELETE FROM ap_objects WHERE iri = ?")
            .bind(iri)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound);
        }

        // Mirrored rows go with the cached document; local rows are never
        // deleted through federation.
        sqlx::query("DELETE FROM articles WHERE ap_id = ? AND is_local = 0")
            .bind(iri)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM users WHERE ap_id = ? AND is_local = 0")
            .bind(iri)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM collectives WHERE ap_id = ? AND is_local = 0")
            .bind(iri)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn touch(&self, iri: &str, raw_payload: &str, fetched_at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE ap_objects SET raw_json = ?, last_fetched = ?, updated_at = ? WHERE iri = ? AND is_local = 0",
        )
        .bind(raw_payload)
        .bind(fetched_at)
        .bind(Utc::now())
        .bind(iri)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // =========================================================================
    // Collections
    // =========================================================================

    async fn collection_contains(&self, collection: &str, member: &str) -> Result<bool> {
        Ok(self.count_members(collection, member).await? > 0)
    }

    async fn add_member(&self, collection: &str, member: &str) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        add_member_in(&mut conn, collection, member).await
    }

    async fn get_page(&self, collection: &str, cursor: i64) -> Result<CollectionPage> {
        let mut rows = sqlx::query_as::<_, (i64, String)>(
            r#"
            SELECT id, member_iri FROM collection_members
            WHERE collection_iri = ? AND id < ?
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(collection)
        .bind(cursor)
        .bind(PAGE_SIZE + 1)
        .fetch_all(&self.pool)
        .await?;

        let has_more = rows.len() as i64 > PAGE_SIZE;
        rows.truncate(PAGE_SIZE as usize);
        let next = if has_more {
            rows.last().map(|(id, _)| *id)
        } else {
            None
        };

        Ok(CollectionPage {
            items: rows.into_iter().map(|(_, iri)| iri).collect(),
            next,
        })
    }

    async fn collection_stats(&self, collection: &str) -> Result<CollectionStats> {
        let (total_items, max_id) = sqlx::query_as::<_, (i64, i64)>(
            "SELECT COUNT(*), COALESCE(MAX(id), 0) FROM collection_members WHERE collection_iri = ?",
        )
        .bind(collection)
        .fetch_one(&self.pool)
        .await?;

        Ok(CollectionStats {
            total_items,
            start: max_id + 1,
        })
    }

    async fn add_outbox(&self, activity: &NewObject, outbox: &str) -> Result<()> {
        let raw = activity.raw_payload.as_deref().ok_or_else(|| {
            AppError::Internal(anyhow::anyhow!("outbox activity {} has no payload", activity.iri))
        })?;

        let mut tx = self.pool.begin().await?;
        upsert_raw_object_in(&mut tx, &activity.iri, &activity.type_name, raw, None).await?;
        add_member_in(&mut tx, outbox, &activity.iri).await?;
        tx.commit().await?;
        Ok(())
    }

    // =========================================================================
    // Local resolution
    // =========================================================================

    async fn resolve_local(&self, local: LocalRef) -> Result<LocalEntity> {
        let entity = match local.table {
            LocalTable::Users => sqlx::query_as::<_, Actor>("SELECT * FROM users WHERE id = ?")
                .bind(local.id)
                .fetch_optional(&self.pool)
                .await?
                .map(LocalEntity::User),
            LocalTable::Articles => {
                sqlx::query_as::<_, Article>("SELECT * FROM articles WHERE id = ?")
                    .bind(local.id)
                    .fetch_optional(&self.pool)
                    .await?
                    .map(LocalEntity::Article)
            }
            LocalTable::Collectives => {
                sqlx::query_as::<_, Collective>("SELECT * FROM collectives WHERE id = ?")
                    .bind(local.id)
                    .fetch_optional(&self.pool)
                    .await?
                    .map(LocalEntity::Collective)
            }
        };
        entity.ok_or(AppError::NotFound)
    }

    // =========================================================================
    // Follows
    // =========================================================================

    async fn put_follow(&self, follow: &NewFollow) -> Result<Follow> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO follows (iri, follower, followee, follower_inbox, accepted, raw, created_at, updated_at)
            VALUES (?, ?, ?, ?, 0, ?, ?, ?)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(&follow.iri)
        .bind(&follow.follower)
        .bind(&follow.followee)
        .bind(&follow.follower_inbox)
        .bind(&follow.raw)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get_follow(&follow.follower, &follow.followee)
            .await?
            .ok_or_else(|| AppError::Conflict(format!("follow {} already exists", follow.iri)))
    }

    async fn get_follow_by_iri(&self, iri: &str) -> Result<Option<Follow>> {
        let follow = sqlx::query_as::<_, Follow>("SELECT * FROM follows WHERE iri = ?")
            .bind(iri)
            .fetch_optional(&self.pool)
            .await?;
        Ok(follow)
    }

    async fn accept_follow(&self, iri: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let follow = sqlx::query_as::<_, Follow>("SELECT * FROM follows WHERE iri = ?")
            .bind(iri)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(AppError::NotFound)?;

        if follow.accepted {
            return Ok(false);
        }

        sqlx::query("UPDATE follows SET accepted = 1, updated_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(follow.id)
            .execute(&mut *tx)
            .await?;

        let followers = followers_collection_in(&mut tx, &follow.followee).await?;
        add_member_in(&mut tx, &followers, &follow.follower).await?;

        if let Some(following) = local_following_collection_in(&mut tx, &follow.follower).await? {
            add_member_in(&mut tx, &following, &follow.followee).await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn follows_exists(&self, follower: &str, followee: &str) -> Result<bool> {
        Ok(self.get_follow(follower, followee).await?.is_some())
    }

    async fn followers(&self, actor: &str) -> Result<Vec<String>> {
        let collection = self.followers_collection(actor).await?;
        let members = sqlx::query_scalar::<_, String>(
            "SELECT member_iri FROM collection_members WHERE collection_iri = ? ORDER BY id",
        )
        .bind(&collection)
        .fetch_all(&self.pool)
        .await?;
        Ok(members)
    }

    async fn followers_collection(&self, actor: &str) -> Result<String> {
        let mut conn = self.pool.acquire().await?;
        followers_collection_in(&mut conn, actor).await
    }

    // =========================================================================
    // Key material
    // =========================================================================

    async fn get_private_key_for_actor(&self, iri: &str) -> Result<String> {
        sqlx::query_scalar::<_, Option<String>>(
            r#"
            SELECT private_key_pem FROM users WHERE ap_id = ? AND is_local = 1
            UNION ALL
            SELECT private_key_pem FROM collectives WHERE ap_id = ? AND is_local = 1
            LIMIT 1
            "#,
        )
        .bind(iri)
        .bind(iri)
        .fetch_optional(&self.pool)
        .await?
        .flatten()
        .ok_or(AppError::NotFound)
    }

    async fn get_public_key_for_actor(&self, iri: &str) -> Result<Option<String>> {
        let key = sqlx::query_scalar::<_, Option<String>>(
            r#"
            SELECT public_key_pem FROM users WHERE ap_id = ?
            UNION ALL
            SELECT public_key_pem FROM collectives WHERE ap_id = ?
            LIMIT 1
            "#,
        )
        .bind(iri)
        .bind(iri)
        .fetch_optional(&self.pool)
        .await?
        .flatten();
        Ok(key)
    }

    // =========================================================================
    // Actors
    // =========================================================================

    async fn upsert_actor(
        &self,
        actor: &RemoteActor,
        raw: &str,
        fetched_at: DateTime<Utc>,
    ) -> Result<Actor> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        let row = sqlx::query_as::<_, Actor>(
            r#"
            INSERT INTO users (
                ap_id, username, name, host, summary, url, inbox, outbox, followers, following,
                public_key_pem, is_local, created_at, updated_at, last_fetched
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?, ?)
            ON CONFLICT(ap_id) DO UPDATE SET
                username = excluded.username,
                name = excluded.name,
                summary = excluded.summary,
                url = excluded.url,
                inbox = excluded.inbox,
                outbox = excluded.outbox,
                followers = excluded.followers,
                following = excluded.following,
                public_key_pem = COALESCE(excluded.public_key_pem, users.public_key_pem),
                updated_at = excluded.updated_at,
                last_fetched = excluded.last_fetched
            WHERE users.is_local = 0
            RETURNING *
            "#,
        )
        .bind(&actor.ap_id)
        .bind(&actor.username)
        .bind(&actor.name)
        .bind(&actor.host)
        .bind(&actor.summary)
        .bind(&actor.url)
        .bind(&actor.inbox)
        .bind(&actor.outbox)
        .bind(&actor.followers)
        .bind(&actor.following)
        .bind(&actor.public_key_pem)
        .bind(now)
        .bind(now)
        .bind(fetched_at)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| AppError::Forbidden(format!("{} is a local actor", actor.ap_id)))?;

        upsert_raw_object_in(&mut tx, &actor.ap_id, "Person", raw, Some(fetched_at)).await?;

        tx.commit().await?;
        Ok(row)
    }

    async fn upsert_collective(
        &self,
        collective: &RemoteCollective,
        raw: &str,
        fetched_at: DateTime<Utc>,
    ) -> Result<Collective> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        let row = sqlx::query_as::<_, Collective>(
            r#"
            INSERT INTO collectives (
                ap_id, kind, name, host, summary, url, inbox, outbox, followers,
                public_key_pem, is_local, created_at, updated_at, last_fetched
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?, ?)
            ON CONFLICT(ap_id) DO UPDATE SET
                kind = excluded.kind,
                name = excluded.name,
                summary = excluded.summary,
                url = excluded.url,
                inbox = excluded.inbox,
                outbox = excluded.outbox,
                followers = excluded.followers,
                public_key_pem = COALESCE(excluded.public_key_pem, collectives.public_key_pem),
                updated_at = excluded.updated_at,
                last_fetched = excluded.last_fetched
            WHERE collectives.is_local = 0
            RETURNING *
            "#,
        )
        .bind(&collective.ap_id)
        .bind(&collective.kind)
        .bind(&collective.name)
        .bind(&collective.host)
        .bind(&collective.summary)
        .bind(&collective.url)
        .bind(&collective.inbox)
        .bind(&collective.outbox)
        .bind(&collective.followers)
        .bind(&collective.public_key_pem)
        .bind(now)
        .bind(now)
        .bind(fetched_at)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| AppError::Forbidden(format!("{} is a local collective", collective.ap_id)))?;

        upsert_raw_object_in(&mut tx, &collective.ap_id, &collective.kind, raw, Some(fetched_at))
            .await?;

        tx.commit().await?;
        Ok(row)
    }

    async fn actor_inbox(&self, iri: &str) -> Result<Option<String>> {
        let inbox = sqlx::query_scalar::<_, String>(
            r#"
            SELECT inbox FROM users WHERE ap_id = ?
            UNION ALL
            SELECT inbox FROM collectives WHERE ap_id = ?
            LIMIT 1
            "#,
        )
        .bind(iri)
        .bind(iri)
        .fetch_optional(&self.pool)
        .await?;
        Ok(inbox)
    }

    async fn local_user_by_iri(&self, iri: &str) -> Result<Option<Actor>> {
        let user = sqlx::query_as::<_, Actor>("SELECT * FROM users WHERE ap_id = ? AND is_local = 1")
            .bind(iri)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    async fn local_user_by_username(&self, username: &str) -> Result<Option<Actor>> {
        let user =
            sqlx::query_as::<_, Actor>("SELECT * FROM users WHERE username = ? AND is_local = 1")
                .bind(username)
                .fetch_optional(&self.pool)
                .await?;
        Ok(user)
    }

    async fn create_local_user(&self, user: &NewLocalActor) -> Result<Actor> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        let row = sqlx::query_as::<_, Actor>(
            r#"
            INSERT INTO users (
                ap_id, username, name, host, summary, url, inbox, outbox, followers, following,
                public_key_pem, private_key_pem, is_local, created_at, updated_at, last_fetched
            )
            VALUES (?, ?, ?, NULL, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?, NULL)
            RETURNING *
            "#,
        )
        .bind(&user.ap_id)
        .bind(&user.username)
        .bind(&user.name)
        .bind(&user.summary)
        .bind(&user.ap_id)
        .bind(&user.inbox)
        .bind(&user.outbox)
        .bind(&user.followers)
        .bind(&user.following)
        .bind(&user.public_key_pem)
        .bind(&user.private_key_pem)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| conflict_on_unique(e, &user.username))?;

        insert_local_object_in(
            &mut tx,
            &row.ap_id,
            "Person",
            LocalRef {
                table: LocalTable::Users,
                id: row.id,
            },
        )
        .await?;

        tx.commit().await?;
        Ok(row)
    }

    async fn ensure_local_collective(&self, collective: &NewLocalCollective) -> Result<Collective> {
        if let Some(existing) = self.get_collective(&collective.ap_id).await? {
            return Ok(existing);
        }

        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        let row = sqlx::query_as::<_, Collective>(
            r#"
            INSERT INTO collectives (
                ap_id, kind, name, host, summary, url, inbox, outbox, followers, following,
                public_key_pem, private_key_pem, is_local, created_at, updated_at, last_fetched
            )
            VALUES (?, 'Group', ?, NULL, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?, NULL)
            RETURNING *
            "#,
        )
        .bind(&collective.ap_id)
        .bind(&collective.name)
        .bind(&collective.summary)
        .bind(&collective.ap_id)
        .bind(&collective.inbox)
        .bind(&collective.outbox)
        .bind(&collective.followers)
        .bind(&collective.following)
        .bind(&collective.public_key_pem)
        .bind(&collective.private_key_pem)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| conflict_on_unique(e, &collective.ap_id))?;

        insert_local_object_in(
            &mut tx,
            &row.ap_id,
            "Group",
            LocalRef {
                table: LocalTable::Collectives,
                id: row.id,
            },
        )
        .await?;

        tx.commit().await?;
        Ok(row)
    }

    // =========================================================================
    // Articles
    // =========================================================================

    async fn article_by_iri(&self, iri: &str) -> Result<Option<Article>> {
        let article = sqlx::query_as::<_, Article>("SELECT * FROM articles WHERE ap_id = ?")
            .bind(iri)
            .fetch_optional(&self.pool)
            .await?;
        Ok(article)
    }

    async fn local_article_by_title(&self, title: &str) -> Result<Option<Article>> {
        let article =
            sqlx::query_as::<_, Article>("SELECT * FROM articles WHERE title = ? AND is_local = 1")
                .bind(title)
                .fetch_optional(&self.pool)
                .await?;
        Ok(article)
    }

    async fn create_local_article(
        &self,
        article: &NewArticle,
        revision: &NewRevision,
    ) -> Result<Article> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        let row = sqlx::query_as::<_, Article>(
            r#"
            INSERT INTO articles (
                ap_id, title, host, summary, content, media_type, attributed_to, url,
                is_local, published, updated_at
            )
            VALUES (?, ?, NULL, ?, ?, ?, ?, ?, 1, ?, ?)
            RETURNING *
            "#,
        )
        .bind(&article.ap_id)
        .bind(&article.title)
        .bind(&article.summary)
        .bind(&article.content)
        .bind(&article.media_type)
        .bind(&article.attributed_to)
        .bind(&article.url)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| conflict_on_unique(e, &format!("article \"{}\"", article.title)))?;

        insert_local_object_in(
            &mut tx,
            &row.ap_id,
            "Article",
            LocalRef {
                table: LocalTable::Articles,
                id: row.id,
            },
        )
        .await?;
        insert_revision_in(&mut tx, row.id, revision).await?;

        tx.commit().await?;
        Ok(row)
    }

    async fn persist_remote_article(
        &self,
        article: &RemoteArticle,
        raw: &str,
        revision: &NewRevision,
        fetched_at: DateTime<Utc>,
    ) -> Result<Article> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        let row = sqlx::query_as::<_, Article>(
            r#"
            INSERT INTO articles (
                ap_id, title, host, summary, content, media_type, attributed_to, url,
                is_local, published, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?)
            RETURNING *
            "#,
        )
        .bind(&article.ap_id)
        .bind(&article.title)
        .bind(&article.host)
        .bind(&article.summary)
        .bind(&article.content)
        .bind(&article.media_type)
        .bind(&article.attributed_to)
        .bind(&article.url)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| conflict_on_unique(e, &article.ap_id))?;

        upsert_raw_object_in(&mut tx, &article.ap_id, "Article", raw, Some(fetched_at)).await?;
        insert_revision_in(&mut tx, row.id, revision).await?;

        tx.commit().await?;
        Ok(row)
    }

    async fn append_revision(
        &self,
        article_id: i64,
        content: &str,
        revision: &NewRevision,
        raw: Option<&str>,
    ) -> Result<Revision> {
        let mut tx = self.pool.begin().await?;

        // Replaying the same Update must not write a second revision.
        let existing = sqlx::query_as::<_, Revision>("SELECT * FROM revisions WHERE ap_id = ?")
            .bind(&revision.ap_id)
            .fetch_optional(&mut *tx)
            .await?;
        if let Some(existing) = existing {
            return Ok(existing);
        }

        let inserted = insert_revision_in(&mut tx, article_id, revision).await?;

        let now = Utc::now();
        sqlx::query("UPDATE articles SET content = ?, updated_at = ? WHERE id = ?")
            .bind(content)
            .bind(now)
            .bind(article_id)
            .execute(&mut *tx)
            .await?;

        if let Some(raw) = raw {
            sqlx::query(
                r#"
                UPDATE ap_objects SET raw_json = ?, updated_at = ?
                WHERE iri = (SELECT ap_id FROM articles WHERE id = ?) AND is_local = 0
                "#,
            )
            .bind(raw)
            .bind(now)
            .bind(article_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(inserted)
    }

    async fn revisions(&self, article_id: i64) -> Result<Vec<Revision>> {
        let revisions =
            sqlx::query_as::<_, Revision>("SELECT * FROM revisions WHERE article_id = ? ORDER BY id")
                .bind(article_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(revisions)
    }
}
