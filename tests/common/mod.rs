//! Common test utilities for E2E tests
//!
//! Every [`TestServer`] is a full node listening on an ephemeral loopback
//! port, with that port as its public authority, so two servers in one
//! test federate with each other for real. Queue workers are not started;
//! tests drive the queues with [`settle`].

#![allow(dead_code)]

use serde_json::Value;
use tempfile::TempDir;
use tokio::net::TcpListener;
use wikifed::config::{self, FollowerPolicy};
use wikifed::data::Actor;
use wikifed::{AppState, build_router};

/// Test server instance
pub struct TestServer {
    pub addr: String,
    pub state: AppState,
    pub _temp_dir: TempDir,
    pub client: reqwest::Client,
}

fn test_config(domain: String, db_path: std::path::PathBuf, policy: FollowerPolicy) -> config::AppConfig {
    config::AppConfig {
        server: config::ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            domain,
            protocol: "http".to_string(),
        },
        database: config::DatabaseConfig { path: db_path },
        instance: config::InstanceConfig {
            name: "wiki".to_string(),
            summary: "Test wiki".to_string(),
            key_bits: 1024,
        },
        federation: config::FederationConfig {
            follower_policy: policy,
            user_agent: "wikifed-test".to_string(),
            request_timeout_seconds: 5,
            allow_private_hosts: true,
            signature_max_skew_seconds: 300,
        },
        queue: config::QueueConfig {
            workers: 1,
            ..Default::default()
        },
        logging: config::LoggingConfig {
            format: "pretty".to_string(),
        },
    }
}

impl TestServer {
    /// Create a new test server instance
    pub async fn new() -> Self {
        Self::with_policy(FollowerPolicy::Confirmed).await
    }

    pub async fn with_policy(policy: FollowerPolicy) -> Self {
        let temp_dir = TempDir::new().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let config = test_config(addr.to_string(), temp_dir.path().join("test.db"), policy);
        let state = AppState::new(config).await.unwrap();

        let app = build_router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap();

        Self {
            addr: format!("http://{}", addr),
            state,
            _temp_dir: temp_dir,
            client,
        }
    }

    /// Get URL for a path on this node
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.addr, path)
    }

    /// IRI of the instance actor
    pub fn base_url(&self) -> String {
        self.state.config.server.base_url()
    }

    pub async fn register(&self, username: &str) -> Actor {
        self.state.register_user(username, None, None).await.unwrap()
    }

    /// Submit an activity to this node's outbox.
    pub async fn post_outbox(&self, activity: &Value) -> reqwest::Response {
        self.client
            .post(self.url("/outbox"))
            .json(activity)
            .send()
            .await
            .unwrap()
    }

    pub async fn get_json(&self, path: &str) -> Value {
        let response = self.client.get(self.url(path)).send().await.unwrap();
        assert!(response.status().is_success(), "GET {} failed: {}", path, response.status());
        response.json().await.unwrap()
    }
}

/// Run every node's due tasks until none of them has anything left to do.
/// Tasks waiting on a retry backoff are not waited for.
pub async fn settle(nodes: &[&TestServer]) {
    for _ in 0..20 {
        let mut ran = 0;
        for node in nodes {
            ran += node
                .state
                .queue
                .run_until_idle(node.state.executor.as_ref())
                .await
                .unwrap();
        }
        if ran == 0 {
            return;
        }
    }
    panic!("queues did not settle");
}
