//! Well-known endpoints
//!
//! - /.well-known/webfinger

use axum::{
    Router,
    extract::{Query, State},
    http::header,
    response::{IntoResponse, Json, Response},
    routing::get,
};
use serde::Deserialize;

use crate::AppState;
use crate::error::AppError;
use crate::federation::ACTIVITY_JSON;

/// Create well-known router
pub fn wellknown_router() -> Router<AppState> {
    Router::new().route("/.well-known/webfinger", get(webfinger))
}

/// WebFinger query parameters
#[derive(Debug, Deserialize)]
struct WebFingerQuery {
    resource: String,
}

/// Split `acct:user@domain` into its parts.
fn parse_acct(resource: &str) -> Result<(&str, &str), AppError> {
    let acct = resource
        .strip_prefix("acct:")
        .ok_or_else(|| AppError::Validation("Resource must start with 'acct:'".to_string()))?;

    match acct.split_once('@') {
        Some((user, domain)) if !user.is_empty() && !domain.is_empty() && !domain.contains('@') => {
            Ok((user, domain))
        }
        _ => Err(AppError::Validation("Invalid acct format".to_string())),
    }
}

/// GET /.well-known/webfinger
///
/// Resolves `acct:name@domain` to a local user, or to the instance actor
/// when `name` is the instance name.
async fn webfinger(
    State(state): State<AppState>,
    Query(query): Query<WebFingerQuery>,
) -> Result<Response, AppError> {
    let (username, domain) = parse_acct(&query.resource)?;
    if domain != state.config.server.domain {
        return Err(AppError::NotFound);
    }

    let actor = if username == state.config.instance.name {
        state.objects.base_url().to_string()
    } else {
        state
            .store
            .local_user_by_username(username)
            .await?
            .ok_or(AppError::NotFound)?
            .ap_id
    };

    let jrd = serde_json::json!({
        "subject": query.resource,
        "aliases": [actor.clone()],
        "links": [
            {
                "rel": "self",
                "type": ACTIVITY_JSON,
                "href": actor
            }
        ]
    });
    Ok(([(header::CONTENT_TYPE, "application/jrd+json")], Json(jrd)).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_acct_resource() {
        assert_eq!(
            parse_acct("acct:alice@wiki.example").unwrap(),
            ("alice", "wiki.example")
        );
        assert_eq!(
            parse_acct("acct:alice@localhost:8080").unwrap(),
            ("alice", "localhost:8080")
        );
    }

    #[test]
    fn rejects_malformed_resources() {
        for resource in ["alice@wiki.example", "acct:alice", "acct:@wiki.example", "acct:a@b@c"] {
            assert!(
                matches!(parse_acct(resource), Err(AppError::Validation(_))),
                "{resource} should be rejected"
            );
        }
    }
}
