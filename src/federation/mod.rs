//! Federation engine
//!
//! Handles:
//! - Activity processing (inbox and outbox)
//! - Delivery fan-out through the task queue
//! - HTTP Signatures and inbound key resolution
//! - Object caching with per-IRI locking
//! - Task execution (fetch, deliver, reprocess)

mod activity;
mod client;
mod convert;
mod delivery;
mod executor;
mod key_cache;
mod lock;
mod objects;
mod signature;

pub use activity::{Activity, ActivityProcessor};
pub use client::{ACTIVITY_JSON, SignedClient, authority_of, build_http_client, main_key_id};
pub use convert::{AS_CONTEXT, LOCAL_MEDIA_TYPE, object_id, type_name};
pub use delivery::{DeliveryPipeline, outbox_of};
pub use executor::FederationExecutor;
pub use key_cache::KeyResolver;
pub use lock::{IriLockGuard, IriLocks};
pub use objects::ObjectCache;
pub use signature::{HttpSigner, extract_signature_key_id, key_owner, verify_signature};
