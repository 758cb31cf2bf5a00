//! Protocol document conversions
//!
//! Extraction of domain records from received JSON documents, and
//! rendering of local rows and outgoing activities back to JSON.

use serde_json::{Map, Value, json};

use super::client::{authority_of, main_key_id};
use crate::data::{Actor, Article, Collective, RemoteActor, RemoteArticle, RemoteCollective};
use crate::error::AppError;

type Result<T> = std::result::Result<T, AppError>;

pub const AS_CONTEXT: &str = "https://www.w3.org/ns/activitystreams";
pub const SECURITY_CONTEXT: &str = "https://w3id.org/security/v1";
pub const PUBLIC: &str = "https://www.w3.org/ns/activitystreams#Public";

/// Media type of locally authored article bodies.
pub const LOCAL_MEDIA_TYPE: &str = "text/markdown";

// =============================================================================
// Property access
// =============================================================================

/// The IRI of a property value: the string itself, or an embedded object's `id`.
pub fn object_id(value: &Value) -> Option<&str> {
    match value {
        Value::String(iri) => Some(iri),
        Value::Object(map) => map.get("id").and_then(Value::as_str),
        Value::Array(items) => items.first().and_then(object_id),
        _ => None,
    }
}

/// `type` of a document; the first entry when several are given.
pub fn type_name(value: &Value) -> Option<&str> {
    match value.get("type")? {
        Value::String(name) => Some(name),
        Value::Array(names) => names.first().and_then(Value::as_str),
        _ => None,
    }
}

/// A natural-language property, accepting the plain and the `*Map` form.
fn text_prop(doc: &Value, name: &str) -> Option<String> {
    if let Some(text) = doc.get(name).and_then(Value::as_str) {
        return Some(text.to_string());
    }
    doc.get(format!("{}Map", name))
        .and_then(Value::as_object)
        .and_then(|map| map.values().find_map(Value::as_str))
        .map(str::to_string)
}

/// A link property: an IRI, a Link object's `href`, or the first of several.
fn link_prop(doc: &Value, name: &str) -> Option<String> {
    fn link(value: &Value) -> Option<&str> {
        match value {
            Value::String(iri) => Some(iri),
            Value::Object(map) => map
                .get("href")
                .or_else(|| map.get("id"))
                .and_then(Value::as_str),
            Value::Array(items) => items.first().and_then(link),
            _ => None,
        }
    }
    doc.get(name).and_then(link).map(str::to_string)
}

fn require_iri(doc: &Value, name: &str) -> Result<String> {
    match doc.get(name) {
        None | Some(Value::Null) => Err(AppError::MissingProperty(name.to_string())),
        Some(Value::String(iri)) => Ok(iri.clone()),
        Some(_) => Err(AppError::UnprocessablePropValue(name.to_string())),
    }
}

fn host_of(iri: &str) -> Result<String> {
    authority_of(iri).ok_or_else(|| AppError::UnprocessablePropValue(format!("id {}", iri)))
}

/// `publicKey.publicKeyPem`, tolerating an array of keys.
pub fn public_key_pem(doc: &Value) -> Option<String> {
    let key = match doc.get("publicKey")? {
        Value::Array(keys) => keys.first()?,
        key => key,
    };
    key.get("publicKeyPem")
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// `publicKey.id`, when the document declares one.
pub fn public_key_id(doc: &Value) -> Option<&str> {
    match doc.get("publicKey")? {
        Value::Array(keys) => keys.first()?.get("id")?.as_str(),
        key => key.get("id")?.as_str(),
    }
}

fn username_fallback(ap_id: &str) -> String {
    url::Url::parse(ap_id)
        .ok()
        .and_then(|url| {
            url.path_segments()
                .and_then(|segments| segments.filter(|s| !s.is_empty()).last().map(str::to_string))
                .or_else(|| url.host_str().map(str::to_string))
        })
        .unwrap_or_else(|| ap_id.to_string())
}

// =============================================================================
// Extraction
// =============================================================================

pub fn remote_actor(doc: &Value) -> Result<RemoteActor> {
    let ap_id = require_iri(doc, "id")?;
    let inbox = require_iri(doc, "inbox")?;

    Ok(RemoteActor {
        host: host_of(&ap_id)?,
        username: text_prop(doc, "preferredUsername").unwrap_or_else(|| username_fallback(&ap_id)),
        name: text_prop(doc, "name"),
        summary: text_prop(doc, "summary").map(|s| ammonia::clean(&s)),
        url: link_prop(doc, "url"),
        outbox: link_prop(doc, "outbox"),
        followers: link_prop(doc, "followers"),
        following: link_prop(doc, "following"),
        public_key_pem: public_key_pem(doc),
        inbox,
        ap_id,
    })
}

pub fn remote_collective(doc: &Value) -> Result<RemoteCollective> {
    let ap_id = require_iri(doc, "id")?;
    let inbox = require_iri(doc, "inbox")?;

    Ok(RemoteCollective {
        host: host_of(&ap_id)?,
        kind: type_name(doc).unwrap_or("Group").to_string(),
        name: text_prop(doc, "preferredUsername")
            .or_else(|| text_prop(doc, "name"))
            .unwrap_or_else(|| username_fallback(&ap_id)),
        summary: text_prop(doc, "summary").map(|s| ammonia::clean(&s)),
        url: link_prop(doc, "url"),
        outbox: link_prop(doc, "outbox"),
        followers: link_prop(doc, "followers"),
        public_key_pem: public_key_pem(doc),
        inbox,
        ap_id,
    })
}

/// Extract a remote Article. `source` wins over `content`.
///
/// HTML bodies are sanitized here, before any diff is built: the local
/// mirror and its revision history hold the sanitized text, never the
/// exact markup the origin sent.
pub fn remote_article(doc: &Value) -> Result<RemoteArticle> {
    let ap_id = require_iri(doc, "id")?;
    let title = text_prop(doc, "name")
        .map(|t| t.trim().to_string())
        .ok_or_else(|| AppError::MissingProperty("name".to_string()))?;

    let (content, media_type) = match doc.get("source") {
        Some(Value::Object(source)) => {
            let content = source
                .get("content")
                .and_then(Value::as_str)
                .ok_or_else(|| AppError::MissingProperty("source content".to_string()))?;
            let media_type = source.get("mediaType").and_then(Value::as_str);
            (content.to_string(), media_type.map(str::to_string))
        }
        Some(Value::String(_)) => {
            return Err(AppError::UnprocessablePropValue(
                "source is an IRI".to_string(),
            ));
        }
        _ => {
            let content = text_prop(doc, "content").ok_or_else(|| {
                AppError::MissingProperty("source or content properties".to_string())
            })?;
            let media_type = doc.get("mediaType").and_then(Value::as_str);
            (content, media_type.map(str::to_string))
        }
    };
    let media_type = media_type.unwrap_or_else(|| "text/html".to_string());
    let content = if media_type == "text/html" {
        ammonia::clean(&content)
    } else {
        content
    };

    Ok(RemoteArticle {
        host: host_of(&ap_id)?,
        summary: text_prop(doc, "summary"),
        attributed_to: doc
            .get("attributedTo")
            .and_then(object_id)
            .map(str::to_string),
        url: link_prop(doc, "url"),
        title,
        content,
        media_type,
        ap_id,
    })
}

// =============================================================================
// Rendering
// =============================================================================

fn with_context(mut body: Map<String, Value>, security: bool) -> Value {
    let context = if security {
        json!([AS_CONTEXT, SECURITY_CONTEXT])
    } else {
        json!(AS_CONTEXT)
    };
    body.insert("@context".to_string(), context);
    Value::Object(body)
}

fn public_key(owner: &str, pem: Option<&str>) -> Value {
    json!({
        "id": main_key_id(owner),
        "owner": owner,
        "publicKeyPem": pem.unwrap_or_default(),
    })
}

fn insert_opt(map: &mut Map<String, Value>, key: &str, value: Option<&str>) {
    if let Some(value) = value.filter(|v| !v.is_empty()) {
        map.insert(key.to_string(), json!(value));
    }
}

pub fn person_document(actor: &Actor) -> Value {
    let mut doc = Map::new();
    doc.insert("id".into(), json!(actor.ap_id));
    doc.insert("type".into(), json!("Person"));
    doc.insert("preferredUsername".into(), json!(actor.username));
    insert_opt(&mut doc, "name", actor.name.as_deref());
    insert_opt(&mut doc, "summary", actor.summary.as_deref());
    insert_opt(&mut doc, "url", actor.url.as_deref());
    doc.insert("inbox".into(), json!(actor.inbox));
    insert_opt(&mut doc, "outbox", actor.outbox.as_deref());
    insert_opt(&mut doc, "followers", actor.followers.as_deref());
    insert_opt(&mut doc, "following", actor.following.as_deref());
    doc.insert("published".into(), json!(actor.created_at.to_rfc3339()));
    doc.insert("updated".into(), json!(actor.updated_at.to_rfc3339()));
    doc.insert(
        "publicKey".into(),
        public_key(&actor.ap_id, actor.public_key_pem.as_deref()),
    );
    with_context(doc, true)
}

pub fn group_document(collective: &Collective) -> Value {
    let mut doc = Map::new();
    doc.insert("id".into(), json!(collective.ap_id));
    doc.insert("type".into(), json!(collective.kind));
    doc.insert("preferredUsername".into(), json!(collective.name));
    doc.insert(
        "summary".into(),
        json!(collective.summary.clone().unwrap_or_default()),
    );
    insert_opt(&mut doc, "url", collective.url.as_deref());
    doc.insert("inbox".into(), json!(collective.inbox));
    insert_opt(&mut doc, "outbox", collective.outbox.as_deref());
    insert_opt(&mut doc, "followers", collective.followers.as_deref());
    insert_opt(&mut doc, "following", collective.following.as_deref());
    doc.insert(
        "publicKey".into(),
        public_key(&collective.ap_id, collective.public_key_pem.as_deref()),
    );
    with_context(doc, true)
}

/// The Article object without `@context`, as embedded in activities.
pub fn article_object(article: &Article) -> Value {
    let mut doc = Map::new();
    doc.insert("id".into(), json!(article.ap_id));
    doc.insert("type".into(), json!("Article"));
    doc.insert("name".into(), json!(article.title));
    insert_opt(&mut doc, "summary", article.summary.as_deref());
    doc.insert("content".into(), json!(article.content));
    doc.insert("mediaType".into(), json!(article.media_type));
    doc.insert(
        "source".into(),
        json!({ "content": article.content, "mediaType": article.media_type }),
    );
    insert_opt(&mut doc, "attributedTo", article.attributed_to.as_deref());
    insert_opt(&mut doc, "url", article.url.as_deref());
    doc.insert("published".into(), json!(article.published.to_rfc3339()));
    doc.insert("updated".into(), json!(article.updated_at.to_rfc3339()));
    Value::Object(doc)
}

pub fn article_document(article: &Article) -> Value {
    match article_object(article) {
        Value::Object(doc) => with_context(doc, false),
        other => other,
    }
}

// =============================================================================
// Activities
// =============================================================================

pub fn follow(id: &str, actor: &str, object: &str) -> Value {
    json!({
        "@context": AS_CONTEXT,
        "id": id,
        "type": "Follow",
        "actor": actor,
        "object": object,
    })
}

pub fn accept(id: &str, actor: &str, follow_iri: &str) -> Value {
    json!({
        "@context": AS_CONTEXT,
        "id": id,
        "type": "Accept",
        "actor": actor,
        "object": follow_iri,
    })
}

/// Create or Update wrapping an embedded object, addressed to the public
/// and to `audience`.
pub fn wrap(
    kind: &str,
    id: &str,
    actor: &str,
    object: Value,
    audience: &str,
    summary: Option<&str>,
) -> Value {
    let mut activity = Map::new();
    activity.insert("id".into(), json!(id));
    activity.insert("type".into(), json!(kind));
    activity.insert("actor".into(), json!(actor));
    activity.insert("to".into(), json!([PUBLIC, audience]));
    insert_opt(&mut activity, "summary", summary);
    activity.insert("object".into(), object);
    with_context(activity, false)
}

pub fn ordered_collection(id: &str, total_items: i64, first: &str) -> Value {
    json!({
        "@context": AS_CONTEXT,
        "id": id,
        "type": "OrderedCollection",
        "totalItems": total_items,
        "first": first,
    })
}

pub fn ordered_collection_page(
    id: &str,
    part_of: &str,
    items: Vec<Value>,
    next: Option<String>,
) -> Value {
    let mut page = Map::new();
    page.insert("id".into(), json!(id));
    page.insert("type".into(), json!("OrderedCollectionPage"));
    page.insert("partOf".into(), json!(part_of));
    page.insert("orderedItems".into(), Value::Array(items));
    if let Some(next) = next {
        page.insert("next".into(), json!(next));
    }
    with_context(page, false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn actor_requires_inbox() {
        let doc = json!({"id": "https://b.example/u/bob", "type": "Person"});
        assert!(matches!(
            remote_actor(&doc),
            Err(AppError::MissingProperty(p)) if p == "inbox"
        ));

        let doc = json!({
            "id": "https://b.example/u/bob",
            "type": "Person",
            "inbox": {"id": "https://b.example/u/bob/inbox"}
        });
        assert!(matches!(
            remote_actor(&doc),
            Err(AppError::UnprocessablePropValue(_))
        ));
    }

    #[test]
    fn actor_extraction_reads_key_and_collections() {
        let doc = json!({
            "id": "https://b.example:8443/u/bob",
            "type": "Person",
            "preferredUsername": "bob",
            "summary": "<p>hi</p><script>alert(1)</script>",
            "inbox": "https://b.example:8443/u/bob/inbox",
            "followers": "https://b.example:8443/u/bob/followers",
            "url": [{"type": "Link", "href": "https://b.example:8443/@bob"}],
            "publicKey": {"id": "https://b.example:8443/u/bob#main-key", "publicKeyPem": "PEM"}
        });
        let actor = remote_actor(&doc).unwrap();

        assert_eq!(actor.host, "b.example:8443");
        assert_eq!(actor.username, "bob");
        assert_eq!(actor.url.as_deref(), Some("https://b.example:8443/@bob"));
        assert_eq!(actor.public_key_pem.as_deref(), Some("PEM"));
        assert!(!actor.summary.unwrap().contains("script"));
    }

    #[test]
    fn username_falls_back_to_last_path_segment() {
        let doc = json!({"id": "https://b.example/users/carol/", "inbox": "https://b.example/i"});
        assert_eq!(remote_actor(&doc).unwrap().username, "carol");
    }

    #[test]
    fn article_prefers_source_over_content() {
        let doc = json!({
            "id": "https://b.example/a/Rust",
            "type": "Article",
            "name": "  Rust ",
            "content": "<p>rendered</p>",
            "source": {"content": "# Rust", "mediaType": "text/markdown"}
        });
        let article = remote_article(&doc).unwrap();

        assert_eq!(article.title, "Rust");
        assert_eq!(article.content, "# Rust");
        assert_eq!(article.media_type, "text/markdown");
    }

    #[test]
    fn article_html_is_sanitized() {
        let doc = json!({
            "id": "https://b.example/a/Rust",
            "type": "Article",
            "name": "Rust",
            "content": "<p>ok</p><script>steal()</script>"
        });
        let article = remote_article(&doc).unwrap();
        assert_eq!(article.content, "<p>ok</p>");
        assert_eq!(article.media_type, "text/html");
    }

    #[test]
    fn article_without_body_is_rejected() {
        let doc = json!({"id": "https://b.example/a/Rust", "type": "Article", "name": "Rust"});
        assert!(matches!(
            remote_article(&doc),
            Err(AppError::MissingProperty(_))
        ));
    }

    #[test]
    fn object_id_reads_iri_or_embedded_id() {
        assert_eq!(object_id(&json!("https://x")), Some("https://x"));
        assert_eq!(object_id(&json!({"id": "https://y"})), Some("https://y"));
        assert_eq!(object_id(&json!(42)), None);
    }

    #[test]
    fn page_omits_next_on_last_page() {
        let page = ordered_collection_page(
            "https://a.example/followers?last=5",
            "https://a.example/followers",
            vec![json!("https://b.example/u/bob")],
            None,
        );
        assert!(page.get("next").is_none());
        assert_eq!(page["orderedItems"][0], "https://b.example/u/bob");
    }
}
