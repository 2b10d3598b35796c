//! End-to-end forwarding over a three-peer mesh.
//!
//! - Sharing an existing context forwards the backlog to the recipient.
//! - Messages arriving after the share are forwarded live, exactly once.
//! - Messages without a context are never forwarded.
//! - `messages` for an unshared pair fails with `NotShared`.

use std::time::Duration;

use ctx_relay::{Engine, EngineError, Options, ShareRequest};
use relay_test_utils::{wait_for, Mesh, MeshNode};
use serde_json::json;

const SETTLE: Duration = Duration::from_secs(5);

fn engine_on(node: &MeshNode) -> Engine {
    relay_test_utils::init_tracing();
    Engine::open(node, Options::default()).expect("engine open")
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(300)).await;
}

#[tokio::test]
async fn share_existing_context_forwards_backlog() {
    let mesh = Mesh::new().unwrap();
    let alice = mesh.node("alice");
    let bob = mesh.node("bob");
    let carol = mesh.node("carol");
    let _ea = engine_on(&alice);
    let eb = engine_on(&bob);
    let _ec = engine_on(&carol);

    let m1 = alice
        .send_message("bob", json!({ "type": "something", "hey": "ho" }), Some("boo!"))
        .await
        .unwrap();

    eb.share(ShareRequest {
        context: "boo!".to_owned(),
        recipient: "carol".to_owned(),
        seq: 0,
    })
    .await
    .unwrap();

    assert!(
        wait_for(|| !carol.wrappers_of(&m1.link).is_empty(), SETTLE).await,
        "carol never received the forwarded wrapper"
    );
    let wrappers = carol.wrappers_of(&m1.link);
    assert_eq!(wrappers.len(), 1);
    assert_eq!(wrappers[0].objectinfo.as_deref().unwrap().link, m1.link);

    let body = carol.body(&wrappers[0].permalink).unwrap();
    assert_eq!(body["object"]["context"], json!("boo!"));
}

#[tokio::test]
async fn live_messages_are_forwarded_exactly_once() {
    let mesh = Mesh::new().unwrap();
    let alice = mesh.node("alice");
    let bob = mesh.node("bob");
    let carol = mesh.node("carol");
    let _ea = engine_on(&alice);
    let eb = engine_on(&bob);
    let _ec = engine_on(&carol);

    let m1 = alice
        .send_message("bob", json!({ "type": "something", "hey": "ho" }), Some("boo!"))
        .await
        .unwrap();
    eb.share(ShareRequest {
        context: "boo!".to_owned(),
        recipient: "carol".to_owned(),
        seq: 0,
    })
    .await
    .unwrap();
    assert!(wait_for(|| !carol.wrappers_of(&m1.link).is_empty(), SETTLE).await);

    // A second message lands after the share: forwarded live.
    let m2 = alice
        .send_message("bob", json!({ "type": "something", "hey": "ho again" }), Some("boo!"))
        .await
        .unwrap();
    assert!(
        wait_for(|| !carol.wrappers_of(&m2.link).is_empty(), SETTLE).await,
        "carol never received the live-forwarded wrapper"
    );

    // Exactly once: let everything settle, then count.
    settle().await;
    let wrappers = carol.wrappers_of(&m2.link);
    assert_eq!(wrappers.len(), 1, "duplicate forward of the live message");

    // The wrapper's inner body deep-equals the message as bob observed it.
    let wrapper_body = carol.body(&wrappers[0].permalink).unwrap();
    let at_bob = bob.record(&m2.link).unwrap().value.object.unwrap();
    assert_eq!(wrapper_body["object"], at_bob);

    // The first message was not forwarded again either.
    assert_eq!(carol.wrappers_of(&m1.link).len(), 1);
}

#[tokio::test]
async fn message_without_context_is_not_forwarded() {
    let mesh = Mesh::new().unwrap();
    let alice = mesh.node("alice");
    let bob = mesh.node("bob");
    let carol = mesh.node("carol");
    let _ea = engine_on(&alice);
    let eb = engine_on(&bob);
    let _ec = engine_on(&carol);

    eb.share(ShareRequest {
        context: "boo!".to_owned(),
        recipient: "carol".to_owned(),
        seq: 0,
    })
    .await
    .unwrap();

    let bare = bob
        .send_message("alice", json!({ "type": "something", "hey": "ho" }), None)
        .await
        .unwrap();

    settle().await;
    assert!(
        carol.wrappers_of(&bare.link).is_empty(),
        "context-less message reached the share recipient"
    );
}

#[tokio::test]
async fn messages_before_share_fails_not_shared() {
    let mesh = Mesh::new().unwrap();
    let bob = mesh.node("bob");
    let eb = engine_on(&bob);

    let result = eb.messages("x", "someone", false);
    assert!(matches!(result, Err(EngineError::NotShared)));

    let position = eb.position("x", "someone");
    assert!(matches!(position, Err(EngineError::NotShared)));
}
