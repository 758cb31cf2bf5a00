//! wikifed - a federated wiki node
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      API Layer (Axum)                        │
//! │  - Inboxes, outbox, documents, collections                  │
//! │  - WebFinger, admin, metrics                                │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Federation Layer                          │
//! │  - Activity processing and delivery fan-out                 │
//! │  - Signed transport, key resolution                         │
//! │  - Durable task queue (fetch / deliver / reprocess)         │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Data Layer                              │
//! │  - SQLite (sqlx): objects, actors, follows, articles, tasks │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `api`: HTTP handlers
//! - `federation`: protocol engine
//! - `queue`: durable task queue
//! - `data`: object store
//! - `diff`, `keys`: article patches and actor key material
//! - `config`, `error`, `metrics`: ambient concerns

pub mod api;
pub mod config;
pub mod data;
pub mod diff;
pub mod error;
pub mod federation;
pub mod keys;
pub mod metrics;
pub mod queue;

use std::sync::Arc;

use data::{Actor, Collective, Database, NewLocalActor, NewLocalCollective, Store};
use error::AppError;
use federation::{
    ActivityProcessor, DeliveryPipeline, FederationExecutor, KeyResolver, ObjectCache,
    SignedClient,
};
use queue::TaskQueue;

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<config::AppConfig>,
    pub db: Database,
    pub store: Arc<dyn Store>,
    pub objects: ObjectCache,
    pub queue: TaskQueue,
    pub client: Arc<SignedClient>,
    pub processor: Arc<ActivityProcessor>,
    pub keys: Arc<KeyResolver>,
    pub executor: Arc<FederationExecutor>,
}

impl AppState {
    /// Initialize application state
    ///
    /// # Steps
    /// 1. Connect to SQLite and run migrations
    /// 2. Ensure the instance actor and its keypair
    /// 3. Wire the signed client, queue, processor and executor
    ///
    /// Workers are not started here; see [`TaskQueue::start`].
    pub async fn new(config: config::AppConfig) -> Result<Self, AppError> {
        tracing::info!("Initializing application state...");

        let db = Database::connect(&config.database.path).await?;
        let store: Arc<dyn Store> = Arc::new(db.clone());
        let base_url = config.server.base_url();

        let instance = Self::ensure_instance_actor(&db, &config).await?;
        let private_key = instance.private_key_pem.clone().ok_or_else(|| {
            AppError::Internal(anyhow::anyhow!("instance actor has no private key"))
        })?;

        let http = federation::build_http_client(&config.federation)?;
        let client = Arc::new(SignedClient::new(
            http,
            store.clone(),
            &base_url,
            &private_key,
            config.federation.allow_private_hosts,
        )?);

        let queue = TaskQueue::new(db.clone(), config.queue.clone());
        let objects = ObjectCache::new(store.clone(), &base_url)?;
        let delivery = DeliveryPipeline::new(store.clone(), queue.clone(), &base_url);
        let processor = Arc::new(ActivityProcessor::new(
            objects.clone(),
            queue.clone(),
            delivery,
            config.federation.follower_policy,
        ));
        let keys = Arc::new(KeyResolver::new(
            client.clone(),
            objects.clone(),
            config.federation.signature_max_skew_seconds,
        ));
        let executor = Arc::new(FederationExecutor::new(client.clone(), processor.clone()));

        tracing::info!(actor = %base_url, "Application state initialized successfully");

        Ok(Self {
            config: Arc::new(config),
            db,
            store,
            objects,
            queue,
            client,
            processor,
            keys,
            executor,
        })
    }

    /// Create the instance Group with a fresh keypair unless it exists.
    async fn ensure_instance_actor(
        db: &Database,
        config: &config::AppConfig,
    ) -> Result<Collective, AppError> {
        let base_url = config.server.base_url();
        if let Some(existing) = db.get_collective(&base_url).await? {
            if existing.is_local {
                tracing::info!(actor = %base_url, "Instance actor exists");
                return Ok(existing);
            }
        }

        tracing::info!(bits = config.instance.key_bits, "Generating instance keypair...");
        let keys = keys::generate_key_pair_blocking(config.instance.key_bits).await?;
        let instance = db
            .ensure_local_collective(&NewLocalCollective {
                ap_id: base_url.clone(),
                name: config.instance.name.clone(),
                summary: Some(config.instance.summary.clone()),
                inbox: format!("{}/inbox", base_url),
                outbox: format!("{}/outbox", base_url),
                followers: format!("{}/followers", base_url),
                following: format!("{}/following", base_url),
                public_key_pem: keys.public_pem,
                private_key_pem: keys.private_pem,
            })
            .await?;

        tracing::info!(actor = %instance.ap_id, "Instance actor created");
        Ok(instance)
    }

    /// Register a local user with its own keypair.
    pub async fn register_user(
        &self,
        username: &str,
        name: Option<String>,
        summary: Option<String>,
    ) -> Result<Actor, AppError> {
        let valid = !username.is_empty()
            && username.len() <= 32
            && username
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
        if !valid {
            return Err(AppError::Validation(format!(
                "username {:?} must be 1-32 of [a-z0-9_]",
                username
            )));
        }
        if username == self.config.instance.name
            || self.store.local_user_by_username(username).await?.is_some()
        {
            return Err(AppError::Conflict(format!("username {} is taken", username)));
        }

        let keys = keys::generate_key_pair_blocking(self.config.instance.key_bits).await?;
        let ap_id = format!("{}/u/{}", self.objects.base_url(), username);
        let user = self
            .store
            .create_local_user(&NewLocalActor {
                ap_id: ap_id.clone(),
                username: username.to_string(),
                name,
                summary,
                inbox: format!("{}/inbox", ap_id),
                outbox: format!("{}/outbox", ap_id),
                followers: format!("{}/followers", ap_id),
                following: format!("{}/following", ap_id),
                public_key_pem: keys.public_pem,
                private_key_pem: keys.private_pem,
            })
            .await?;

        tracing::info!(actor = %user.ap_id, "Local user registered");
        Ok(user)
    }
}

/// Build the Axum router with all routes.
///
/// This is shared by the binary and integration tests to keep route
/// composition consistent across environments.
pub fn build_router(state: AppState) -> axum::Router {
    use axum::Router;
    use tower_http::{compression::CompressionLayer, trace::TraceLayer};

    let cors_layer = build_cors_layer(&state.config.server);

    Router::new()
        .route("/health", axum::routing::get(health_check))
        .merge(api::wellknown_router())
        .merge(api::activitypub_router())
        .nest("/admin", api::admin_router())
        .layer(axum::middleware::from_fn(api::track_requests))
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer)
        .with_state(state)
        .merge(api::metrics_router())
}

fn build_cors_layer(server: &config::ServerConfig) -> tower_http::cors::CorsLayer {
    use axum::http::HeaderValue;
    use tower_http::cors::{Any, CorsLayer};

    if !server.protocol.eq_ignore_ascii_case("https") {
        return CorsLayer::permissive();
    }

    let allowed_origin = server.base_url();
    match HeaderValue::from_str(&allowed_origin) {
        Ok(origin) => CorsLayer::new()
            .allow_origin([origin])
            .allow_methods(Any)
            .allow_headers(Any),
        Err(error) => {
            tracing::error!(
                %error,
                origin = %allowed_origin,
                "Failed to parse CORS origin from server base URL; denying cross-origin requests"
            );
            CorsLayer::new().allow_methods(Any).allow_headers(Any)
        }
    }
}

async fn health_check() -> &'static str {
    "OK"
}
