//! Public key resolution for inbound signatures
//!
//! Keys are looked up in a short-lived in-memory cache, then in the store,
//! and only then fetched from the owner. A verification that fails with a
//! previously known key refetches the owner once, so rotated keys are
//! picked up without a restart.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::client::SignedClient;
use super::convert::{self, object_id, type_name};
use super::objects::ObjectCache;
use super::signature::{extract_signature_key_id, key_owner, verify_signature};
use crate::data::Store;
use crate::error::AppError;

type Result<T> = std::result::Result<T, AppError>;

const DEFAULT_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone)]
struct CachedKey {
    pem: String,
    cached_at: Instant,
}

/// Where a key came from; only stale keys are worth a refetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeySource {
    Cached,
    Fetched,
}

pub struct KeyResolver {
    store: Arc<dyn Store>,
    client: Arc<SignedClient>,
    objects: ObjectCache,
    max_skew_seconds: i64,
    cache: RwLock<HashMap<String, CachedKey>>,
    ttl: Duration,
}

impl KeyResolver {
    pub fn new(client: Arc<SignedClient>, objects: ObjectCache, max_skew_seconds: i64) -> Self {
        Self {
            store: objects.store().clone(),
            client,
            objects,
            max_skew_seconds,
            cache: RwLock::new(HashMap::new()),
            ttl: DEFAULT_TTL,
        }
    }

    /// Verify the signature on an inbound request and return the actor
    /// that signed it. Every failure is reported as `InvalidSignature`.
    pub async fn verify_incoming(
        &self,
        method: &str,
        path: &str,
        headers: &http::HeaderMap,
        body: Option<&[u8]>,
    ) -> Result<String> {
        self.try_verify(method, path, headers, body)
            .await
            .map_err(|e| {
                warn!(%path, error = %e, "Rejected request signature");
                AppError::InvalidSignature
            })
    }

    async fn try_verify(
        &self,
        method: &str,
        path: &str,
        headers: &http::HeaderMap,
        body: Option<&[u8]>,
    ) -> Result<String> {
        let key_id = extract_signature_key_id(headers)?;
        let owner = key_owner(&key_id).to_string();

        let (pem, source) = self.key_for(&owner).await?;
        let first = verify_signature(method, path, headers, body, &pem, self.max_skew_seconds);

        match first {
            Ok(()) => Ok(owner),
            Err(AppError::InvalidSignature) if source == KeySource::Cached => {
                debug!(actor = %owner, "Signature failed with known key, refetching");
                self.invalidate(&owner).await;
                let pem = self.fetch(&owner).await?;
                verify_signature(method, path, headers, body, &pem, self.max_skew_seconds)?;
                Ok(owner)
            }
            Err(e) => Err(e),
        }
    }

    async fn key_for(&self, owner: &str) -> Result<(String, KeySource)> {
        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.get(owner) {
                if cached.cached_at.elapsed() < self.ttl {
                    return Ok((cached.pem.clone(), KeySource::Cached));
                }
            }
        }

        if let Some(pem) = self.store.get_public_key_for_actor(owner).await? {
            self.remember(owner, &pem).await;
            return Ok((pem, KeySource::Cached));
        }

        Ok((self.fetch(owner).await?, KeySource::Fetched))
    }

    /// Dereference the key owner, mirror it and return its key.
    async fn fetch(&self, owner: &str) -> Result<String> {
        if self.objects.is_local_iri(owner) {
            return Err(AppError::NotFoundIri(owner.to_string()));
        }

        let document = self
            .client
            .dereference(owner, self.client.instance_actor())
            .await?;
        if object_id(&document) != Some(owner) {
            return Err(AppError::Forbidden(format!(
                "document fetched from {} has a different id",
                owner
            )));
        }

        match type_name(&document) {
            Some("Person") => {
                self.objects.ingest_actor(&document).await?;
            }
            Some(_) => {
                self.objects.ingest_collective(&document).await?;
            }
            None => return Err(AppError::MissingProperty("type".to_string())),
        }

        let pem = convert::public_key_pem(&document)
            .ok_or_else(|| AppError::MissingProperty("publicKey".to_string()))?;
        self.remember(owner, &pem).await;
        Ok(pem)
    }

    async fn remember(&self, owner: &str, pem: &str) {
        let mut cache = self.cache.write().await;
        cache.insert(
            owner.to_string(),
            CachedKey {
                pem: pem.to_string(),
                cached_at: Instant::now(),
            },
        );
    }

    async fn invalidate(&self, owner: &str) {
        self.cache.write().await.remove(owner);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Database, RemoteActor};
    use crate::federation::signature::HttpSigner;
    use crate::keys::{KeyPair, generate_key_pair};
    use chrono::Utc;
    use http::{HeaderMap, HeaderValue};
    use tempfile::TempDir;

    // Unroutable so a refetch fails fast instead of leaving the machine.
    const BOB: &str = "http://127.0.0.1:1/u/bob";
    const PATH: &str = "/inbox";
    const BODY: &[u8] = br#"{"type":"Follow"}"#;

    async fn resolver(bob_key: &KeyPair) -> (KeyResolver, TempDir) {
        let dir = TempDir::new().unwrap();
        let db = Database::connect(&dir.path().join("test.db")).await.unwrap();
        db.upsert_actor(
            &RemoteActor {
                ap_id: BOB.to_string(),
                username: "bob".to_string(),
                host: "127.0.0.1:1".to_string(),
                inbox: format!("{}/inbox", BOB),
                public_key_pem: Some(bob_key.public_pem.clone()),
                ..Default::default()
            },
            "{}",
            Utc::now(),
        )
        .await
        .unwrap();

        let store: Arc<dyn Store> = Arc::new(db);
        let instance = generate_key_pair(1024).unwrap();
        let client = SignedClient::new(
            reqwest::Client::new(),
            store.clone(),
            "https://a.example",
            &instance.private_pem,
            true,
        )
        .unwrap();
        let objects = ObjectCache::new(store, "https://a.example").unwrap();
        (KeyResolver::new(Arc::new(client), objects, 300), dir)
    }

    fn signed_headers(private_pem: &str) -> HeaderMap {
        let signer = HttpSigner::for_post(private_pem, format!("{}#main-key", BOB)).unwrap();
        let signed = signer
            .sign("POST", &format!("https://a.example{}", PATH), Some(BODY))
            .unwrap();

        let mut headers = HeaderMap::new();
        headers.insert("date", HeaderValue::from_str(&signed.date).unwrap());
        headers.insert(
            "digest",
            HeaderValue::from_str(signed.digest.as_deref().unwrap()).unwrap(),
        );
        headers.insert("signature", HeaderValue::from_str(&signed.signature).unwrap());
        headers
    }

    #[tokio::test]
    async fn stored_key_verifies_and_names_signer() {
        let bob = generate_key_pair(1024).unwrap();
        let (resolver, _dir) = resolver(&bob).await;

        let signer = resolver
            .verify_incoming("POST", PATH, &signed_headers(&bob.private_pem), Some(BODY))
            .await
            .unwrap();
        assert_eq!(signer, BOB);
        assert_eq!(resolver.cache.read().await.len(), 1);
    }

    #[tokio::test]
    async fn wrong_key_fails_closed_after_refetch() {
        let bob = generate_key_pair(1024).unwrap();
        let mallory = generate_key_pair(1024).unwrap();
        let (resolver, _dir) = resolver(&bob).await;

        let result = resolver
            .verify_incoming("POST", PATH, &signed_headers(&mallory.private_pem), Some(BODY))
            .await;
        assert!(matches!(result, Err(AppError::InvalidSignature)));
    }

    #[tokio::test]
    async fn unsigned_request_is_invalid() {
        let bob = generate_key_pair(1024).unwrap();
        let (resolver, _dir) = resolver(&bob).await;

        let result = resolver
            .verify_incoming("POST", PATH, &HeaderMap::new(), Some(BODY))
            .await;
        assert!(matches!(result, Err(AppError::InvalidSignature)));
    }

    #[tokio::test]
    async fn tampered_body_is_invalid() {
        let bob = generate_key_pair(1024).unwrap();
        let (resolver, _dir) = resolver(&bob).await;

        let result = resolver
            .verify_incoming(
                "POST",
                PATH,
                &signed_headers(&bob.private_pem),
                Some(br#"{"type":"Delete"}"#),
            )
            .await;
        assert!(matches!(result, Err(AppError::InvalidSignature)));
    }
}
