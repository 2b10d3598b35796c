//! Restart behavior: a reopened engine resumes from its durable cursors
//! and never re-forwards a message whose outbound wrapper it has already
//! observed.

use std::time::Duration;

use ctx_relay::{Engine, Options, ShareRequest};
use futures_util::StreamExt;
use relay_test_utils::{wait_for, Mesh, MeshNode};
use serde_json::json;

const SETTLE: Duration = Duration::from_secs(5);

fn engine_on(node: &MeshNode) -> Engine {
    relay_test_utils::init_tracing();
    Engine::open(node, Options::default()).expect("engine open")
}

#[tokio::test]
async fn reopen_does_not_re_forward_and_reports_no_pending_messages() {
    let mesh = Mesh::new().unwrap();
    let alice = mesh.node("alice");
    let bob = mesh.node("bob");
    let carol = mesh.node("carol");
    let _ea = engine_on(&alice);
    let eb = engine_on(&bob);
    let _ec = engine_on(&carol);

    // Backlog message, then share, then a live message.
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

    let m2 = alice
        .send_message("bob", json!({ "type": "something", "hey": "ho 2" }), Some("boo!"))
        .await
        .unwrap();
    assert!(wait_for(|| !carol.wrappers_of(&m2.link).is_empty(), SETTLE).await);

    // Wait for the outbound wrappers to advance the durable cursor past
    // the second message's observation index at bob.
    let m2_seq = bob.record(&m2.link).unwrap().change;
    assert!(
        wait_for(
            || eb.position("boo!", "carol").map(|seq| seq >= m2_seq).unwrap_or(false),
            SETTLE
        )
        .await,
        "cursor never caught up with the forwarded messages"
    );

    eb.close();
    let eb = engine_on(&bob);

    // Everything observed so far is behind the cursor.
    let pending: Vec<_> = eb
        .messages("boo!", "carol", false)
        .expect("pair is still shared after reopen")
        .collect()
        .await;
    assert!(
        pending.is_empty(),
        "reopened engine reports already-forwarded messages as pending"
    );

    // And nothing is re-forwarded.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(carol.wrappers_of(&m1.link).len(), 1);
    assert_eq!(carol.wrappers_of(&m2.link).len(), 1);
}

#[tokio::test]
async fn close_is_idempotent_and_rejects_further_calls() {
    let mesh = Mesh::new().unwrap();
    let bob = mesh.node("bob");
    let eb = engine_on(&bob);

    eb.close();
    eb.close();
    assert!(eb.is_closed());

    let result = eb
        .share(ShareRequest {
            context: "boo!".to_owned(),
            recipient: "carol".to_owned(),
            seq: 0,
        })
        .await;
    assert!(matches!(result, Err(ctx_relay::EngineError::Closed)));
}

#[tokio::test]
async fn node_destroy_closes_the_engine() {
    let mesh = Mesh::new().unwrap();
    let bob = mesh.node("bob");
    let eb = engine_on(&bob);

    bob.destroy();
    assert!(
        wait_for(|| eb.is_closed(), SETTLE).await,
        "engine did not close on node shutdown"
    );
}
