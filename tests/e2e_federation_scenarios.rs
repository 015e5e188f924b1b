//! E2E tests for federation scenarios
//!
//! These tests drive the gateway against an in-process remote server:
//! - Remote Follow → edge stored → signed Accept delivered
//! - Replays and duplicates → 409, undo of missing state → 410
//! - Remote Create / Like against local posts
//! - Local follow, like and post → signed deliveries to the remote
//! - Remote outbox retrieval

mod common;

use std::time::{Duration, Instant};

use common::{MockRemote, TestServer};
use fedigate::federation::verify_signature;
use serde_json::{Value, json};

fn follow(remote: &MockRemote, id: &str, object: &str) -> Value {
    json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "id": remote.activity_id(id),
        "type": "Follow",
        "actor": remote.actor_url,
        "object": object,
    })
}

// =============================================================================
// Scenario 1: Remote Follow handshake
// =============================================================================

#[tokio::test]
async fn test_remote_follow_is_stored_and_accepted() {
    let server = TestServer::new().await;
    let alice = server.create_actor("alice").await;
    let remote = MockRemote::start("bob").await;
    let alice_url = server.actor_url("alice");

    let response = remote
        .deliver(
            &server.url("/users/alice/inbox"),
            &follow(&remote, "follow-1", &alice_url),
        )
        .await;
    assert_eq!(response.status(), 202);

    let followers = server.state.db.get_follower_uris(&alice_url).await.unwrap();
    assert_eq!(followers, vec![remote.actor_url.clone()]);

    let received = remote.wait_for_activities(1).await;
    assert_eq!(received.len(), 1);
    let accept = received[0].json();
    assert_eq!(accept["type"], "Accept");
    assert_eq!(accept["actor"], alice_url);
    assert_eq!(accept["object"]["type"], "Follow");
    assert_eq!(accept["object"]["id"], remote.activity_id("follow-1"));

    // The Accept is signed with alice's published key.
    verify_signature(
        "POST",
        &received[0].path,
        &received[0].headers,
        Some(received[0].body.as_ref()),
        alice["public_key_pem"].as_str().unwrap(),
    )
    .unwrap();
}

#[tokio::test]
async fn test_follow_replay_and_duplicate_are_conflicts() {
    let server = TestServer::new().await;
    server.create_actor("alice").await;
    let remote = MockRemote::start("bob").await;
    let alice_url = server.actor_url("alice");
    let inbox = server.url("/inbox");

    let first = follow(&remote, "follow-1", &alice_url);
    assert_eq!(remote.deliver(&inbox, &first).await.status(), 202);

    // Same activity id again
    let replay = remote.deliver(&inbox, &first).await;
    assert_eq!(replay.status(), 409);
    let body: Value = replay.json().await.unwrap();
    assert_eq!(body["error"], "conflict");

    // New activity id, same edge
    let duplicate = remote
        .deliver(&inbox, &follow(&remote, "follow-2", &alice_url))
        .await;
    assert_eq!(duplicate.status(), 409);

    assert_eq!(
        server.state.db.get_follower_uris(&alice_url).await.unwrap().len(),
        1
    );
}

#[tokio::test]
async fn test_undo_follow_then_undo_again_is_gone() {
    let server = TestServer::new().await;
    server.create_actor("alice").await;
    let remote = MockRemote::start("bob").await;
    let alice_url = server.actor_url("alice");
    let inbox = server.url("/users/alice/inbox");

    let original = follow(&remote, "follow-1", &alice_url);
    assert_eq!(remote.deliver(&inbox, &original).await.status(), 202);

    let undo = |id: &str| {
        json!({
            "id": remote.activity_id(id),
            "type": "Undo",
            "actor": remote.actor_url,
            "object": original,
        })
    };

    assert_eq!(remote.deliver(&inbox, &undo("undo-1")).await.status(), 202);
    assert!(server.state.db.get_follower_uris(&alice_url).await.unwrap().is_empty());

    assert_eq!(remote.deliver(&inbox, &undo("undo-2")).await.status(), 410);
}

#[tokio::test]
async fn test_follow_is_kept_when_accept_delivery_fails() {
    let server = TestServer::new().await;
    server.create_actor("alice").await;
    let remote = MockRemote::start("bob").await;
    remote.set_inbox_status(reqwest::StatusCode::INTERNAL_SERVER_ERROR);
    let alice_url = server.actor_url("alice");

    let response = remote
        .deliver(
            &server.url("/users/alice/inbox"),
            &follow(&remote, "follow-1", &alice_url),
        )
        .await;
    assert_eq!(response.status(), 202);

    // The Accept was attempted and refused.
    let received = remote.wait_for_activities(1).await;
    assert_eq!(received[0].json()["type"], "Accept");
    tokio::time::sleep(Duration::from_millis(200)).await;

    let followers = server.state.db.get_follower_uris(&alice_url).await.unwrap();
    assert_eq!(followers, vec![remote.actor_url.clone()]);
}

#[tokio::test]
async fn test_concurrent_identical_follows_store_one_edge() {
    let server = TestServer::new().await;
    server.create_actor("alice").await;
    let remote = MockRemote::start("bob").await;
    let alice_url = server.actor_url("alice");
    let inbox = server.url("/users/alice/inbox");

    let first = follow(&remote, "follow-a", &alice_url);
    let second = follow(&remote, "follow-b", &alice_url);
    let (a, b) = tokio::join!(remote.deliver(&inbox, &first), remote.deliver(&inbox, &second));

    let mut statuses = vec![a.status().as_u16(), b.status().as_u16()];
    statuses.sort_unstable();
    assert_eq!(statuses, vec![202, 409]);
    assert_eq!(
        server.state.db.get_follower_uris(&alice_url).await.unwrap().len(),
        1
    );
}

#[tokio::test]
async fn test_follow_of_unknown_local_actor_is_404() {
    let server = TestServer::new().await;
    server.create_actor("alice").await;
    let remote = MockRemote::start("bob").await;

    let response = remote
        .deliver(
            &server.url("/inbox"),
            &follow(&remote, "follow-1", &server.actor_url("ghost")),
        )
        .await;
    assert_eq!(response.status(), 404);
}

// =============================================================================
// Scenario 2: Remote Create and Like
// =============================================================================

#[tokio::test]
async fn test_remote_create_is_stored_sanitized() {
    let server = TestServer::new().await;
    server.create_actor("alice").await;
    let remote = MockRemote::start("bob").await;

    let note_id = format!("{}/notes/1", remote.actor_url);
    let create = json!({
        "id": remote.activity_id("create-1"),
        "type": "Create",
        "actor": {"id": remote.actor_url, "name": "Remote Bob"},
        "object": {
            "id": note_id,
            "type": "Note",
            "attributedTo": remote.actor_url,
            "content": "<p>hello</p><script>alert(1)</script>",
            "published": "2025-01-01T00:00:00Z",
        },
    });

    let inbox = server.url("/inbox");
    assert_eq!(remote.deliver(&inbox, &create).await.status(), 202);

    let post = server.state.db.get_post_by_uri(&note_id).await.unwrap().unwrap();
    assert_eq!(post.actor_uri, remote.actor_url);
    assert!(post.federated);
    assert!(!post.is_local);
    assert!(post.content.contains("hello"));
    assert!(!post.content.contains("script"));

    let mut again = create.clone();
    again["id"] = json!(remote.activity_id("create-2"));
    assert_eq!(remote.deliver(&inbox, &again).await.status(), 409);
}

#[tokio::test]
async fn test_remote_like_lifecycle() {
    let server = TestServer::new().await;
    server.create_actor("alice").await;
    let remote = MockRemote::start("bob").await;
    let inbox = server.url("/inbox");

    let missing = json!({
        "id": remote.activity_id("like-missing"),
        "type": "Like",
        "actor": remote.actor_url,
        "object": server.url("/users/alice/posts/missing"),
    });
    assert_eq!(remote.deliver(&inbox, &missing).await.status(), 404);

    let post = server.create_post("alice", "likeable").await;
    let post_uri = post["uri"].as_str().unwrap();

    let like = json!({
        "id": remote.activity_id("like-1"),
        "type": "Like",
        "actor": remote.actor_url,
        "object": post_uri,
    });
    assert_eq!(remote.deliver(&inbox, &like).await.status(), 202);
    assert_eq!(server.state.db.count_likes(post_uri).await.unwrap(), 1);

    let mut duplicate = like.clone();
    duplicate["id"] = json!(remote.activity_id("like-2"));
    assert_eq!(remote.deliver(&inbox, &duplicate).await.status(), 409);
    assert_eq!(server.state.db.count_likes(post_uri).await.unwrap(), 1);

    let undo = |id: &str| {
        json!({
            "id": remote.activity_id(id),
            "type": "Undo",
            "actor": remote.actor_url,
            "object": like,
        })
    };
    assert_eq!(remote.deliver(&inbox, &undo("undo-1")).await.status(), 202);
    assert_eq!(server.state.db.count_likes(post_uri).await.unwrap(), 0);
    assert_eq!(remote.deliver(&inbox, &undo("undo-2")).await.status(), 410);
}

#[tokio::test]
async fn test_unsupported_activity_type_is_400() {
    let server = TestServer::new().await;
    server.create_actor("alice").await;
    let remote = MockRemote::start("bob").await;

    let announce = json!({
        "id": remote.activity_id("announce-1"),
        "type": "Announce",
        "actor": remote.actor_url,
        "object": "https://elsewhere.example/notes/1",
    });
    let response = remote.deliver(&server.url("/inbox"), &announce).await;
    assert_eq!(response.status(), 400);
}

// =============================================================================
// Scenario 3: Local actions delivered to the remote
// =============================================================================

#[tokio::test]
async fn test_local_follow_is_delivered_and_accept_recorded() {
    let server = TestServer::new().await;
    let alice = server.create_actor("alice").await;
    let remote = MockRemote::start("bob").await;
    let alice_url = server.actor_url("alice");

    let response = server
        .internal_post(
            "/internal/follows",
            &json!({"username": "alice", "target": remote.handle()}),
        )
        .await;
    assert_eq!(response.status(), 201);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["object"], remote.actor_url);
    assert_eq!(body["delivery_queued"], true);
    assert!(body["accepted_at"].is_null());

    let received = remote.wait_for_activities(1).await;
    let follow_activity = received[0].json();
    assert_eq!(follow_activity["type"], "Follow");
    assert_eq!(follow_activity["actor"], alice_url);
    assert_eq!(follow_activity["object"], remote.actor_url);
    assert_eq!(received[0].path, "/users/bob/inbox");
    verify_signature(
        "POST",
        &received[0].path,
        &received[0].headers,
        Some(received[0].body.as_ref()),
        alice["public_key_pem"].as_str().unwrap(),
    )
    .unwrap();

    let accept = json!({
        "id": remote.activity_id("accept-1"),
        "type": "Accept",
        "actor": remote.actor_url,
        "object": follow_activity,
    });
    let response = remote
        .deliver(&server.url("/users/alice/inbox"), &accept)
        .await;
    assert_eq!(response.status(), 202);

    let edge = server
        .state
        .db
        .get_follow(&alice_url, &remote.actor_url)
        .await
        .unwrap()
        .unwrap();
    assert!(edge.accepted_at.is_some());

    // Unfollow sends Undo{Follow}, a second unfollow finds nothing.
    let response = server
        .internal_delete(
            "/internal/follows",
            &json!({"username": "alice", "target": remote.actor_url}),
        )
        .await;
    assert_eq!(response.status(), 200);

    let received = remote.wait_for_activities(2).await;
    let undo = received[1].json();
    assert_eq!(undo["type"], "Undo");
    assert_eq!(undo["object"]["type"], "Follow");
    assert_eq!(undo["object"]["id"], follow_activity["id"]);

    let response = server
        .internal_delete(
            "/internal/follows",
            &json!({"username": "alice", "target": remote.actor_url}),
        )
        .await;
    assert_eq!(response.status(), 410);
}

#[tokio::test]
async fn test_local_post_fans_out_to_remote_follower() {
    let server = TestServer::new().await;
    server.create_actor("alice").await;
    let remote = MockRemote::start("bob").await;

    let response = remote
        .deliver(
            &server.url("/users/alice/inbox"),
            &follow(&remote, "follow-1", &server.actor_url("alice")),
        )
        .await;
    assert_eq!(response.status(), 202);
    // Accept
    remote.wait_for_activities(1).await;

    let post = server.create_post("alice", "hello followers").await;
    assert_eq!(post["federated"], true);
    assert_eq!(post["queued_deliveries"], 1);

    let received = remote.wait_for_activities(2).await;
    let create = received[1].json();
    assert_eq!(create["type"], "Create");
    assert_eq!(create["object"]["type"], "Note");
    assert_eq!(create["object"]["id"], post["uri"]);
    assert_eq!(create["object"]["attributedTo"], server.actor_url("alice"));
}

#[tokio::test]
async fn test_local_like_of_remote_note_reaches_author() {
    let server = TestServer::new().await;
    server.create_actor("alice").await;
    let remote = MockRemote::start("bob").await;
    let note_id = remote.publish_note("42", "<p>remote words</p>");

    let response = server
        .internal_post(
            "/internal/likes",
            &json!({"username": "alice", "object": note_id}),
        )
        .await;
    assert_eq!(response.status(), 201);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["delivery_queued"], true);

    let received = remote.wait_for_activities(1).await;
    let like = received[0].json();
    assert_eq!(like["type"], "Like");
    assert_eq!(like["object"], note_id);

    let again = server
        .internal_post(
            "/internal/likes",
            &json!({"username": "alice", "object": note_id}),
        )
        .await;
    assert_eq!(again.status(), 409);

    let response = server
        .internal_delete(
            "/internal/likes",
            &json!({"username": "alice", "object": note_id}),
        )
        .await;
    assert_eq!(response.status(), 200);
    let received = remote.wait_for_activities(2).await;
    assert_eq!(received[1].json()["type"], "Undo");
    assert_eq!(received[1].json()["object"]["type"], "Like");

    let response = server
        .internal_delete(
            "/internal/likes",
            &json!({"username": "alice", "object": note_id}),
        )
        .await;
    assert_eq!(response.status(), 410);
}

#[tokio::test]
async fn test_local_actions_do_not_wait_for_slow_remote_inbox() {
    let server = TestServer::new().await;
    server.create_actor("alice").await;
    let remote = MockRemote::start("bob").await;

    let response = remote
        .deliver(
            &server.url("/users/alice/inbox"),
            &follow(&remote, "follow-1", &server.actor_url("alice")),
        )
        .await;
    assert_eq!(response.status(), 202);
    remote.wait_for_activities(1).await;
    remote.set_inbox_delay(Duration::from_secs(3));

    let started = Instant::now();
    let post = server.create_post("alice", "no waiting").await;
    assert_eq!(post["queued_deliveries"], 1);

    let response = server
        .internal_post(
            "/internal/follows",
            &json!({"username": "alice", "target": remote.actor_url}),
        )
        .await;
    assert_eq!(response.status(), 201);
    assert!(started.elapsed() < Duration::from_secs(2));

    // Both activities still arrive.
    let received = remote.wait_for_activities(3).await;
    assert_eq!(received.len(), 3);
}

// =============================================================================
// Scenario 4: Discovery and cross-server reads
// =============================================================================

#[tokio::test]
async fn test_external_actor_lookup() {
    let server = TestServer::new().await;
    let remote = MockRemote::start("bob").await;

    let by_handle: Value = server
        .internal_get(&format!(
            "/internal/external-actor?username=bob&domain={}",
            remote.domain
        ))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(by_handle["url"], remote.actor_url);
    assert_eq!(by_handle["inbox"], format!("{}/inbox", remote.actor_url));
    assert_eq!(by_handle["local"], false);

    let by_url: Value = server
        .internal_get(&format!("/internal/external-actor?url={}", remote.actor_url))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(by_url["key_id"], remote.key_id);

    let response = server
        .internal_get(&format!(
            "/internal/external-actor?username=nobody&domain={}",
            remote.domain
        ))
        .await;
    assert_eq!(response.status(), 502);

    let response = server.internal_get("/internal/external-actor").await;
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn test_remote_posts_follow_outbox_first_page() {
    let server = TestServer::new().await;
    let remote = MockRemote::start("bob").await;
    remote.publish_note("1", "<p>first</p>");
    remote.publish_note("2", "<p>second</p><script>x</script>");

    let response = server
        .internal_get(&format!("/internal/remote-posts?actor={}", remote.handle()))
        .await;
    assert_eq!(response.status(), 200);

    let body: Value = response.json().await.unwrap();
    let posts = body["posts"].as_array().unwrap();
    assert_eq!(posts.len(), 2);
    assert_eq!(posts[0]["id"], format!("{}/notes/2", remote.actor_url));
    assert_eq!(posts[0]["attributedTo"], remote.actor_url);
    assert!(!posts[0]["content"].as_str().unwrap().contains("script"));
}

#[tokio::test]
async fn test_remote_posts_of_local_actor() {
    let server = TestServer::new().await;
    server.create_actor("alice").await;
    server.create_post("alice", "local words").await;

    let response = server
        .internal_get(&format!(
            "/internal/remote-posts?actor={}",
            server.actor_url("alice")
        ))
        .await;
    assert_eq!(response.status(), 200);

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["posts"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_actor_document_with_foreign_id_is_rejected() {
    let server = TestServer::new().await;
    let remote = MockRemote::start("bob").await;
    remote.claim_actor_id(&format!("{}/users/mallory", remote.addr));

    let response = server
        .internal_get(&format!("/internal/external-actor?url={}", remote.actor_url))
        .await;
    assert_eq!(response.status(), 502);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "federation");
}

#[tokio::test]
async fn test_webfinger_without_self_link_is_rejected() {
    let server = TestServer::new().await;
    let remote = MockRemote::start("bob").await;
    remote.drop_webfinger_self_link();

    let response = server
        .internal_get(&format!(
            "/internal/external-actor?username=bob&domain={}",
            remote.domain
        ))
        .await;
    assert_eq!(response.status(), 502);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "federation");
}
