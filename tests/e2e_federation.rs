//! Two-node federation scenarios

mod common;

use common::{TestServer, settle};
use serde_json::json;
use wikifed::config::FollowerPolicy;
use wikifed::data::Store;
use wikifed::federation::{HttpSigner, main_key_id};
use wikifed::queue::{TaskKind, TaskStatus};

#[tokio::test]
async fn alice_follows_bob_across_nodes() {
    let a = TestServer::new().await;
    let b = TestServer::new().await;
    let alice = a.register("alice").await;
    let bob = b.register("bob").await;

    let response = a
        .post_outbox(&json!({
            "type": "Follow",
            "actor": alice.ap_id,
            "object": bob.ap_id
        }))
        .await;
    assert_eq!(response.status(), 202);

    // Bob's inbox is unknown on A, so the Follow waits behind a fetch.
    let pending = a.state.db.tasks_with_status(TaskStatus::Pending).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].spec.kind, TaskKind::Fetch);
    assert_eq!(pending[0].spec.target, bob.ap_id);
    assert_eq!(
        pending[0].spec.next.as_deref().map(|next| next.kind),
        Some(TaskKind::Deliver)
    );

    settle(&[&a, &b]).await;

    let on_a = a.state.db.get_follow(&alice.ap_id, &bob.ap_id).await.unwrap().unwrap();
    let on_b = b.state.db.get_follow(&alice.ap_id, &bob.ap_id).await.unwrap().unwrap();
    assert!(on_a.accepted);
    assert!(on_b.accepted);
    assert_eq!(on_a.iri, on_b.iri);

    let bob_followers = format!("{}/followers", bob.ap_id);
    assert_eq!(b.state.db.count_members(&bob_followers, &alice.ap_id).await.unwrap(), 1);
    let alice_following = format!("{}/following", alice.ap_id);
    assert_eq!(a.state.db.count_members(&alice_following, &bob.ap_id).await.unwrap(), 1);

    let followers = b.get_json("/u/bob/followers").await;
    assert_eq!(followers["totalItems"], 1);

    assert!(a.state.db.tasks_with_status(TaskStatus::Failed).await.unwrap().is_empty());
    assert!(b.state.db.tasks_with_status(TaskStatus::Failed).await.unwrap().is_empty());
}

#[tokio::test]
async fn refollowing_keeps_a_single_edge() {
    let a = TestServer::new().await;
    let b = TestServer::new().await;
    let alice = a.register("alice").await;
    let bob = b.register("bob").await;
    let follow = json!({"type": "Follow", "actor": alice.ap_id, "object": bob.ap_id});

    a.post_outbox(&follow).await;
    settle(&[&a, &b]).await;
    a.post_outbox(&follow).await;
    settle(&[&a, &b]).await;

    let bob_followers = format!("{}/followers", bob.ap_id);
    assert_eq!(b.state.db.count_members(&bob_followers, &alice.ap_id).await.unwrap(), 1);
    assert!(b.state.db.get_follow(&alice.ap_id, &bob.ap_id).await.unwrap().unwrap().accepted);
}

#[tokio::test]
async fn articles_reach_instance_followers() {
    let a = TestServer::new().await;
    let b = TestServer::new().await;
    let alice = a.register("alice").await;
    let bob = b.register("bob").await;

    // Bob follows A's instance actor.
    b.post_outbox(&json!({"type": "Follow", "actor": bob.ap_id, "object": a.base_url()}))
        .await;
    settle(&[&a, &b]).await;
    let instance_followers = format!("{}/followers", a.base_url());
    assert_eq!(
        a.state.db.count_members(&instance_followers, &bob.ap_id).await.unwrap(),
        1
    );

    let response = a
        .post_outbox(&json!({
            "type": "Create",
            "actor": alice.ap_id,
            "summary": "new page",
            "object": {"type": "Article", "name": "Tea", "content": "Green.\n"}
        }))
        .await;
    assert_eq!(response.status(), 202);
    settle(&[&a, &b]).await;

    let iri = format!("{}/a/Tea", a.base_url());
    let mirrored = b.state.store.article_by_iri(&iri).await.unwrap().unwrap();
    assert!(!mirrored.is_local);
    assert_eq!(mirrored.title, "Tea");
    assert_eq!(mirrored.content, "Green.\n");

    a.post_outbox(&json!({
        "type": "Update",
        "actor": alice.ap_id,
        "summary": "more tea",
        "object": {"type": "Article", "id": iri, "content": "Green.\nBlack.\n"}
    }))
    .await;
    settle(&[&a, &b]).await;

    let mirrored = b.state.store.article_by_iri(&iri).await.unwrap().unwrap();
    assert_eq!(mirrored.content, "Green.\nBlack.\n");
    let history = b.state.store.revisions(mirrored.id).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].author, alice.ap_id);

    let local = a.state.store.article_by_iri(&iri).await.unwrap().unwrap();
    let local_history = a.state.store.revisions(local.id).await.unwrap();
    assert_eq!(local_history.len(), 2);
    assert_eq!(history[1].ap_id, local_history[1].ap_id);
}

#[tokio::test]
async fn optimistic_policy_lists_follower_before_accept() {
    let a = TestServer::new().await;
    let b = TestServer::with_policy(FollowerPolicy::Optimistic).await;
    let alice = a.register("alice").await;
    let bob = b.register("bob").await;

    a.post_outbox(&json!({"type": "Follow", "actor": alice.ap_id, "object": bob.ap_id}))
        .await;
    // Run A only: the Follow reaches B, B has not sent its Accept yet.
    settle(&[&a]).await;

    let bob_followers = format!("{}/followers", bob.ap_id);
    assert_eq!(b.state.db.count_members(&bob_followers, &alice.ap_id).await.unwrap(), 1);
    assert!(!b.state.db.get_follow(&alice.ap_id, &bob.ap_id).await.unwrap().unwrap().accepted);

    settle(&[&a, &b]).await;
    assert_eq!(b.state.db.count_members(&bob_followers, &alice.ap_id).await.unwrap(), 1);
    assert!(a.state.db.get_follow(&alice.ap_id, &bob.ap_id).await.unwrap().unwrap().accepted);
}

#[tokio::test]
async fn unsigned_inbox_post_is_unauthorized() {
    let b = TestServer::new().await;
    b.register("bob").await;

    let response = b
        .client
        .post(b.url("/u/bob/inbox"))
        .header("Content-Type", "application/activity+json")
        .body(r#"{"type":"Follow"}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
}

#[tokio::test]
async fn activity_signed_by_someone_else_is_forbidden() {
    let a = TestServer::new().await;
    let b = TestServer::new().await;
    let alice = a.register("alice").await;
    let bob = b.register("bob").await;

    let body = json!({
        "id": format!("{}/follows/forged", a.base_url()),
        "type": "Follow",
        "actor": format!("{}/u/carol", a.base_url()),
        "object": bob.ap_id
    })
    .to_string();

    let private_key = a.state.store.get_private_key_for_actor(&alice.ap_id).await.unwrap();
    let signer = HttpSigner::for_post(&private_key, main_key_id(&alice.ap_id)).unwrap();
    let inbox = b.url("/u/bob/inbox");
    let signed = signer.sign("POST", &inbox, Some(body.as_bytes())).unwrap();

    let response = b
        .client
        .post(&inbox)
        .header("Content-Type", "application/activity+json")
        .header("Date", signed.date)
        .header("Digest", signed.digest.unwrap())
        .header("Signature", signed.signature)
        .body(body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 403);
    assert!(b.state.db.get_follow(&alice.ap_id, &bob.ap_id).await.unwrap().is_none());
}
