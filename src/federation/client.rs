//! Signed HTTP transport
//!
//! Every outbound federation request goes through [`SignedClient`]: GETs to
//! dereference objects, POSTs to deliver activities. Requests made as the
//! instance actor reuse the cached signers; any other local actor signs
//! with its own key loaded from the store.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Mutex;
use tracing::{debug, info};

use super::signature::{HttpSigner, SignatureHeaders};
use crate::config::FederationConfig;
use crate::data::Store;
use crate::error::AppError;
use crate::metrics::{FEDERATION_REQUEST_DURATION_SECONDS, FEDERATION_REQUESTS_TOTAL};

type Result<T> = std::result::Result<T, AppError>;

pub const ACTIVITY_JSON: &str = "application/activity+json";

/// Accept header for dereferencing; some servers only answer the LD profile.
const ACCEPT_ACTIVITY: &str =
    "application/activity+json, application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\"";

/// Longest remote error body kept in `AppError::RemoteStatus`.
const MAX_ERROR_BODY: usize = 512;

/// Key id under which an actor publishes its key.
pub fn main_key_id(actor: &str) -> String {
    format!("{}#main-key", actor)
}

fn is_disallowed_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unique_local()
                || v6.is_unicast_link_local()
                || v6.is_multicast()
                || v6.is_unspecified()
        }
    }
}

fn is_disallowed_host(host: &str) -> bool {
    let normalized = host
        .trim_start_matches('[')
        .trim_end_matches(']')
        .trim_end_matches('.')
        .to_ascii_lowercase();
    if normalized == "localhost" || normalized.ends_with(".localhost") {
        return true;
    }

    normalized
        .parse::<IpAddr>()
        .map(is_disallowed_ip)
        .unwrap_or(false)
}

async fn validate_resolved_host_ips(host: &str, port: u16) -> Result<()> {
    let normalized = host.trim_end_matches('.').to_ascii_lowercase();

    let mut resolved_any = false;
    let lookup = tokio::net::lookup_host((normalized.as_str(), port))
        .await
        .map_err(|e| AppError::Internal(anyhow::anyhow!("Failed to resolve {}: {}", host, e)))?;

    for addr in lookup {
        resolved_any = true;
        if is_disallowed_ip(addr.ip()) {
            return Err(AppError::Forbidden(format!(
                "{} resolves to a non-public address",
                host
            )));
        }
    }

    if !resolved_any {
        return Err(AppError::Internal(anyhow::anyhow!("No DNS records for {}", host)));
    }

    Ok(())
}

/// Host (with explicit port, if any) of an IRI, lowercased.
pub fn authority_of(iri: &str) -> Option<String> {
    let parsed = url::Url::parse(iri).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    Some(match parsed.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host,
    })
}

fn truncate_body(mut body: String) -> String {
    if body.len() > MAX_ERROR_BODY {
        let mut end = MAX_ERROR_BODY;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        body.truncate(end);
    }
    body
}

/// Build the reqwest client used for federation traffic.
pub fn build_http_client(config: &FederationConfig) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(config.user_agent.clone())
        .timeout(config.request_timeout())
        .build()
        .map_err(|e| AppError::Internal(e.into()))
}

pub struct SignedClient {
    http: reqwest::Client,
    store: Arc<dyn Store>,
    instance_actor: String,
    get_signer: Mutex<HttpSigner>,
    post_signer: Mutex<HttpSigner>,
    allow_private_hosts: bool,
}

impl SignedClient {
    pub fn new(
        http: reqwest::Client,
        store: Arc<dyn Store>,
        instance_actor: impl Into<String>,
        instance_private_key_pem: &str,
        allow_private_hosts: bool,
    ) -> Result<Self> {
        let instance_actor = instance_actor.into();
        let key_id = main_key_id(&instance_actor);
        Ok(Self {
            http,
            store,
            get_signer: Mutex::new(HttpSigner::for_get(instance_private_key_pem, &key_id)?),
            post_signer: Mutex::new(HttpSigner::for_post(instance_private_key_pem, key_id)?),
            instance_actor,
            allow_private_hosts,
        })
    }

    pub fn instance_actor(&self) -> &str {
        &self.instance_actor
    }

    /// Refuse targets that are not http(s) or that point into private
    /// address space.
    async fn ensure_public_target(&self, target: &str) -> Result<url::Url> {
        let parsed = url::Url::parse(target)
            .map_err(|e| AppError::Validation(format!("Invalid URL {}: {}", target, e)))?;

        match parsed.scheme() {
            "http" | "https" => {}
            scheme => {
                return Err(AppError::Validation(format!(
                    "Unsupported URL scheme: {}",
                    scheme
                )));
            }
        }

        let host = parsed
            .host_str()
            .ok_or_else(|| AppError::Validation(format!("Missing host in {}", target)))?;

        if !self.allow_private_hosts {
            if is_disallowed_host(host) {
                return Err(AppError::Forbidden(format!(
                    "{} is not a public host",
                    host
                )));
            }
            let port = parsed.port_or_known_default().unwrap_or(443);
            validate_resolved_host_ips(host, port).await?;
        }

        Ok(parsed)
    }

    async fn sign(
        &self,
        method: &str,
        url: &str,
        body: Option<&[u8]>,
        acting_as: &str,
    ) -> Result<SignatureHeaders> {
        if acting_as == self.instance_actor {
            let signer = match method {
                "GET" => self.get_signer.lock().await,
                _ => self.post_signer.lock().await,
            };
            return signer.sign(method, url, body);
        }

        let private_key = self.store.get_private_key_for_actor(acting_as).await?;
        let signer = match method {
            "GET" => HttpSigner::for_get(&private_key, main_key_id(acting_as))?,
            _ => HttpSigner::for_post(&private_key, main_key_id(acting_as))?,
        };
        signer.sign(method, url, body)
    }

    fn observe(direction: &str, status: &str, started: Instant) {
        FEDERATION_REQUESTS_TOTAL
            .with_label_values(&[direction, status])
            .inc();
        FEDERATION_REQUEST_DURATION_SECONDS
            .with_label_values(&[direction])
            .observe(started.elapsed().as_secs_f64());
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.as_u16() >= 400 {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::RemoteStatus {
                status: status.as_u16(),
                body: truncate_body(body),
            });
        }
        Ok(response)
    }

    /// Fetch the protocol document at `iri`, signed as `acting_as`.
    pub async fn dereference(&self, iri: &str, acting_as: &str) -> Result<serde_json::Value> {
        let url = self.ensure_public_target(iri).await?;
        let signed = self.sign("GET", url.as_str(), None, acting_as).await?;

        let started = Instant::now();
        let result = self
            .http
            .get(url)
            .header("Accept", ACCEPT_ACTIVITY)
            .header("Date", signed.date)
            .header("Signature", signed.signature)
            .send()
            .await;

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                Self::observe("outbound_get", "error", started);
                return Err(e.into());
            }
        };
        Self::observe("outbound_get", response.status().as_str(), started);

        let response = Self::check_status(response).await?;
        let document = response.json::<serde_json::Value>().await?;
        debug!(%iri, "Dereferenced remote object");
        Ok(document)
    }

    /// POST `payload` to `inbox`, signed as `acting_as`.
    pub async fn deliver(&self, payload: &str, inbox: &str, acting_as: &str) -> Result<()> {
        let url = self.ensure_public_target(inbox).await?;
        let body = payload.as_bytes().to_vec();
        let signed = self
            .sign("POST", url.as_str(), Some(&body), acting_as)
            .await?;

        let mut request = self
            .http
            .post(url)
            .header("Content-Type", ACTIVITY_JSON)
            .header("Date", signed.date)
            .header("Signature", signed.signature);
        if let Some(digest) = signed.digest {
            request = request.header("Digest", digest);
        }

        let started = Instant::now();
        let response = match request.body(body).send().await {
            Ok(response) => response,
            Err(e) => {
                Self::observe("outbound_post", "error", started);
                return Err(e.into());
            }
        };
        Self::observe("outbound_post", response.status().as_str(), started);

        Self::check_status(response).await?;
        info!(%inbox, actor = %acting_as, "Delivered activity");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Database, NewLocalActor};
    use crate::federation::signature::verify_signature;
    use axum::Router;
    use axum::body::Bytes;
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::{get, post};
    use std::sync::OnceLock;
    use tempfile::TempDir;

    fn test_keys() -> &'static crate::keys::KeyPair {
        static KEYS: OnceLock<crate::keys::KeyPair> = OnceLock::new();
        KEYS.get_or_init(|| crate::keys::generate_key_pair(1024).unwrap())
    }

    #[derive(Clone)]
    struct Peer {
        public_pem: String,
    }

    async fn inbox(State(peer): State<Peer>, headers: HeaderMap, body: Bytes) -> StatusCode {
        match verify_signature("POST", "/inbox", &headers, Some(&body[..]), &peer.public_pem, 300) {
            Ok(()) => StatusCode::ACCEPTED,
            Err(_) => StatusCode::UNAUTHORIZED,
        }
    }

    async fn actor(State(peer): State<Peer>, headers: HeaderMap) -> (StatusCode, String) {
        match verify_signature("GET", "/actor", &headers, None, &peer.public_pem, 300) {
            Ok(()) => (
                StatusCode::OK,
                serde_json::json!({"id": "peer", "type": "Person"}).to_string(),
            ),
            Err(_) => (StatusCode::UNAUTHORIZED, "bad signature".to_string()),
        }
    }

    async fn spawn_peer(public_pem: String) -> String {
        let app = Router::new()
            .route("/inbox", post(inbox))
            .route("/actor", get(actor))
            .route("/gone", get(|| async { (StatusCode::GONE, "deleted") }))
            .with_state(Peer { public_pem });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    async fn client(allow_private_hosts: bool) -> (SignedClient, Database, TempDir) {
        let dir = TempDir::new().unwrap();
        let db = Database::connect(&dir.path().join("client.db")).await.unwrap();
        let client = SignedClient::new(
            reqwest::Client::new(),
            Arc::new(db.clone()),
            "https://a.example",
            &test_keys().private_pem,
            allow_private_hosts,
        )
        .unwrap();
        (client, db, dir)
    }

    #[test]
    fn private_hosts_are_disallowed() {
        assert!(is_disallowed_host("localhost"));
        assert!(is_disallowed_host("wiki.localhost"));
        assert!(is_disallowed_host("192.168.1.10"));
        assert!(is_disallowed_host("[::1]"));
        assert!(!is_disallowed_host("example.com"));
        assert!(!is_disallowed_host("93.184.216.34"));
    }

    #[test]
    fn authority_keeps_explicit_port() {
        assert_eq!(
            authority_of("http://localhost:8080/u/alice").as_deref(),
            Some("localhost:8080")
        );
        assert_eq!(
            authority_of("https://Wiki.Example/a/Rust").as_deref(),
            Some("wiki.example")
        );
        assert!(authority_of("not a url").is_none());
    }

    #[tokio::test]
    async fn resolved_loopback_is_rejected() {
        assert!(matches!(
            validate_resolved_host_ips("127.0.0.1", 80).await,
            Err(AppError::Forbidden(_))
        ));
    }

    #[tokio::test]
    async fn resolution_failure_is_retryable() {
        let err = validate_resolved_host_ips("peer.invalid", 443).await.unwrap_err();
        assert!(matches!(err, AppError::Internal(_)));
        assert!(!err.is_terminal());
    }

    #[tokio::test]
    async fn refuses_private_targets_unless_allowed() {
        let (client, _db, _dir) = client(false).await;
        let result = client
            .dereference("http://127.0.0.1:9/actor", "https://a.example")
            .await;
        assert!(matches!(result, Err(AppError::Forbidden(_))));
    }

    #[tokio::test]
    async fn deliver_as_instance_is_verifiable() {
        let base = spawn_peer(test_keys().public_pem.clone()).await;
        let (client, _db, _dir) = client(true).await;

        client
            .deliver(r#"{"type":"Create"}"#, &format!("{}/inbox", base), "https://a.example")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn dereference_signs_get() {
        let base = spawn_peer(test_keys().public_pem.clone()).await;
        let (client, _db, _dir) = client(true).await;

        let document = client
            .dereference(&format!("{}/actor", base), "https://a.example")
            .await
            .unwrap();
        assert_eq!(document["type"], "Person");
    }

    #[tokio::test]
    async fn error_status_carries_body() {
        let base = spawn_peer(test_keys().public_pem.clone()).await;
        let (client, _db, _dir) = client(true).await;

        match client
            .dereference(&format!("{}/gone", base), "https://a.example")
            .await
        {
            Err(AppError::RemoteStatus { status, body }) => {
                assert_eq!(status, 410);
                assert_eq!(body, "deleted");
            }
            other => panic!("expected remote status, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn local_user_signs_with_own_key() {
        let user_keys = crate::keys::generate_key_pair(1024).unwrap();
        let base = spawn_peer(user_keys.public_pem.clone()).await;
        let (client, db, _dir) = client(true).await;
        db.create_local_user(&NewLocalActor {
            ap_id: "https://a.example/u/alice".to_string(),
            username: "alice".to_string(),
            name: None,
            summary: None,
            inbox: "https://a.example/u/alice/inbox".to_string(),
            outbox: "https://a.example/u/alice/outbox".to_string(),
            followers: "https://a.example/u/alice/followers".to_string(),
            following: "https://a.example/u/alice/following".to_string(),
            public_key_pem: user_keys.public_pem.clone(),
            private_key_pem: user_keys.private_pem.clone(),
        })
        .await
        .unwrap();

        client
            .deliver("{}", &format!("{}/inbox", base), "https://a.example/u/alice")
            .await
            .unwrap();

        let unknown = client
            .deliver("{}", &format!("{}/inbox", base), "https://a.example/u/nobody")
            .await;
        assert!(matches!(unknown, Err(AppError::NotFound)));
    }
}
