//! ActivityPub endpoints
//!
//! - Inboxes (instance and per user)
//! - Outbox submission
//! - Actor and article documents
//! - Paginated outbox/followers/following collections

use axum::body::Bytes;
use axum::{
    Router,
    extract::{Path, Query, State},
    http::{StatusCode, Uri, header},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use http::HeaderMap;
use serde::Deserialize;
use serde_json::{Value, json};
use tower_http::limit::RequestBodyLimitLayer;
use tracing::debug;

use crate::AppState;
use crate::data::Actor;
use crate::error::AppError;
use crate::federation::{ACTIVITY_JSON, AS_CONTEXT, authority_of, key_owner, object_id, type_name};
use crate::metrics::{ACTIVITYPUB_ACTIVITIES_RECEIVED, FEDERATION_REQUESTS_TOTAL};

/// Largest accepted activity body.
const MAX_ACTIVITY_BYTES: usize = 1024 * 1024;

/// Create ActivityPub router
///
/// Routes:
/// - POST /inbox, POST /u/:username/inbox - Inboxes
/// - POST /outbox - Submit a Create/Update/Follow from a local user
/// - GET / - Instance actor
/// - GET /u/:username - Local user
/// - GET /a/:title, GET /a/:title/revisions - Local articles
/// - GET /{outbox,followers,following} and the same under /u/:username
pub fn activitypub_router() -> Router<AppState> {
    Router::new()
        .route("/inbox", post(shared_inbox))
        .route("/u/:username/inbox", post(user_inbox))
        .route("/outbox", post(submit_outbox).get(instance_outbox))
        .route("/followers", get(instance_followers))
        .route("/following", get(instance_following))
        .route("/", get(instance_actor))
        .route("/u/:username", get(user_actor))
        .route("/u/:username/outbox", get(user_outbox))
        .route("/u/:username/followers", get(user_followers))
        .route("/u/:username/following", get(user_following))
        .route("/a/:title", get(article))
        .route("/a/:title/revisions", get(article_revisions))
        .layer(RequestBodyLimitLayer::new(MAX_ACTIVITY_BYTES))
}

/// Protocol document response.
fn activity_json(document: Value) -> Response {
    (
        [(header::CONTENT_TYPE, ACTIVITY_JSON)],
        Json(document),
    )
        .into_response()
}

// =============================================================================
// Inboxes
// =============================================================================

/// POST /inbox
async fn shared_inbox(
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    receive(&state, &uri, &headers, &body).await
}

/// POST /u/:username/inbox
async fn user_inbox(
    State(state): State<AppState>,
    Path(username): Path<String>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    local_user(&state, &username).await?;
    receive(&state, &uri, &headers, &body).await
}

/// Verify, authorize and process one inbound document.
///
/// # Steps
/// 1. Verify the HTTP signature and learn the signer
/// 2. Check the signer speaks for the activity (or owns the bare object)
/// 3. Process at depth 0; deferrals are queued, not awaited
async fn receive(
    state: &AppState,
    uri: &Uri,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<StatusCode, AppError> {
    let path = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| uri.path());

    let signer = match state
        .keys
        .verify_incoming("POST", path, headers, Some(body))
        .await
    {
        Ok(signer) => signer,
        Err(e) => {
            FEDERATION_REQUESTS_TOTAL
                .with_label_values(&["inbound", "unauthorized"])
                .inc();
            return Err(e);
        }
    };

    let document: Value = serde_json::from_slice(body)?;
    let kind = type_name(&document)
        .ok_or_else(|| AppError::MissingProperty("type".to_string()))?
        .to_string();

    if let Err(e) = authorize(&signer, &document) {
        FEDERATION_REQUESTS_TOTAL
            .with_label_values(&["inbound", "forbidden"])
            .inc();
        return Err(e);
    }

    ACTIVITYPUB_ACTIVITIES_RECEIVED
        .with_label_values(&[&kind])
        .inc();
    debug!(%signer, kind = %kind, "Inbound document accepted for processing");

    state.processor.process(document, 0).await?;

    FEDERATION_REQUESTS_TOTAL
        .with_label_values(&["inbound", "202"])
        .inc();
    Ok(StatusCode::ACCEPTED)
}

/// Activities must be signed by their actor; bare objects by an actor on
/// the object's host.
fn authorize(signer: &str, document: &Value) -> Result<(), AppError> {
    match document.get("actor") {
        Some(actor) => {
            let actor = object_id(actor)
                .ok_or_else(|| AppError::UnprocessablePropValue("actor has no id".to_string()))?;
            if key_owner(actor) != signer {
                return Err(AppError::Forbidden(format!(
                    "{} cannot send activities as {}",
                    signer, actor
                )));
            }
        }
        None => {
            let id = object_id(document)
                .ok_or_else(|| AppError::MissingProperty("id".to_string()))?;
            if authority_of(id).is_none() || authority_of(id) != authority_of(signer) {
                return Err(AppError::Forbidden(format!(
                    "{} cannot speak for {}",
                    signer, id
                )));
            }
        }
    }
    Ok(())
}

// =============================================================================
// Outbox
// =============================================================================

/// POST /outbox
///
/// Accepts a Create, Update or Follow on behalf of a local user. Callers
/// are authenticated by the session layer in front of this service.
async fn submit_outbox(
    State(state): State<AppState>,
    Json(document): Json<Value>,
) -> Result<StatusCode, AppError> {
    state.processor.process_outbox(document, 0).await?;
    Ok(StatusCode::ACCEPTED)
}

// =============================================================================
// Documents
// =============================================================================

async fn local_user(state: &AppState, username: &str) -> Result<Actor, AppError> {
    state
        .store
        .local_user_by_username(username)
        .await?
        .ok_or(AppError::NotFound)
}

/// GET /
async fn instance_actor(State(state): State<AppState>) -> Result<Response, AppError> {
    let document = state.objects.get(state.objects.base_url()).await?;
    Ok(activity_json(document))
}

/// GET /u/:username
async fn user_actor(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<Response, AppError> {
    let user = local_user(&state, &username).await?;
    Ok(activity_json(state.objects.get(&user.ap_id).await?))
}

/// GET /a/:title
async fn article(
    State(state): State<AppState>,
    Path(title): Path<String>,
) -> Result<Response, AppError> {
    let article = state
        .store
        .local_article_by_title(&title)
        .await?
        .ok_or(AppError::NotFound)?;
    Ok(activity_json(state.objects.get(&article.ap_id).await?))
}

/// GET /a/:title/revisions
///
/// Full history, oldest first, each entry carrying its unified patch.
async fn article_revisions(
    State(state): State<AppState>,
    Path(title): Path<String>,
) -> Result<Response, AppError> {
    let article = state
        .store
        .local_article_by_title(&title)
        .await?
        .ok_or(AppError::NotFound)?;
    let revisions = state.store.revisions(article.id).await?;

    let items: Vec<Value> = revisions
        .iter()
        .map(|revision| {
            json!({
                "id": revision.ap_id,
                "attributedTo": revision.author,
                "summary": revision.summary,
                "published": revision.created_at.to_rfc3339(),
                "mediaType": "text/x-diff",
                "content": revision.patch,
            })
        })
        .collect();

    Ok(activity_json(json!({
        "@context": AS_CONTEXT,
        "id": format!("{}/revisions", article.ap_id),
        "type": "OrderedCollection",
        "totalItems": items.len(),
        "orderedItems": items,
    })))
}

// =============================================================================
// Collections
// =============================================================================

#[derive(Debug, Deserialize)]
struct PageQuery {
    last: Option<i64>,
}

async fn collection(
    state: &AppState,
    iri: &str,
    query: PageQuery,
    expand: bool,
) -> Result<Response, AppError> {
    let document = state.objects.collection(iri, query.last, expand).await?;
    Ok(activity_json(document))
}

/// GET /outbox
async fn instance_outbox(
    State(state): State<AppState>,
    Query(query): Query<PageQuery>,
) -> Result<Response, AppError> {
    let iri = format!("{}/outbox", state.objects.base_url());
    collection(&state, &iri, query, true).await
}

/// GET /followers
async fn instance_followers(
    State(state): State<AppState>,
    Query(query): Query<PageQuery>,
) -> Result<Response, AppError> {
    let iri = format!("{}/followers", state.objects.base_url());
    collection(&state, &iri, query, false).await
}

/// GET /following
async fn instance_following(
    State(state): State<AppState>,
    Query(query): Query<PageQuery>,
) -> Result<Response, AppError> {
    let iri = format!("{}/following", state.objects.base_url());
    collection(&state, &iri, query, false).await
}

/// GET /u/:username/outbox
async fn user_outbox(
    State(state): State<AppState>,
    Path(username): Path<String>,
    Query(query): Query<PageQuery>,
) -> Result<Response, AppError> {
    let user = local_user(&state, &username).await?;
    let iri = user.outbox.unwrap_or_else(|| format!("{}/outbox", user.ap_id));
    collection(&state, &iri, query, true).await
}

/// GET /u/:username/followers
async fn user_followers(
    State(state): State<AppState>,
    Path(username): Path<String>,
    Query(query): Query<PageQuery>,
) -> Result<Response, AppError> {
    let user = local_user(&state, &username).await?;
    let iri = user
        .followers
        .unwrap_or_else(|| format!("{}/followers", user.ap_id));
    collection(&state, &iri, query, false).await
}

/// GET /u/:username/following
async fn user_following(
    State(state): State<AppState>,
    Path(username): Path<String>,
    Query(query): Query<PageQuery>,
) -> Result<Response, AppError> {
    let user = local_user(&state, &username).await?;
    let iri = user
        .following
        .unwrap_or_else(|| format!("{}/following", user.ap_id));
    collection(&state, &iri, query, false).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn activity_must_come_from_signer() {
        let follow = json!({"type": "Follow", "actor": "https://b.example/u/bob"});
        assert!(authorize("https://b.example/u/bob", &follow).is_ok());
        assert!(matches!(
            authorize("https://b.example/u/mallory", &follow),
            Err(AppError::Forbidden(_))
        ));
    }

    #[test]
    fn embedded_actor_is_compared_by_id() {
        let create = json!({
            "type": "Create",
            "actor": {"id": "https://b.example/u/bob", "type": "Person"}
        });
        assert!(authorize("https://b.example/u/bob", &create).is_ok());
    }

    #[test]
    fn bare_object_must_share_signer_host() {
        let article = json!({"type": "Article", "id": "https://b.example/a/Tea"});
        assert!(authorize("https://b.example/u/bob", &article).is_ok());
        assert!(matches!(
            authorize("https://c.example/u/carol", &article),
            Err(AppError::Forbidden(_))
        ));
    }
}
