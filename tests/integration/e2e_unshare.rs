//! Unshare semantics: deactivation stops forwarding and drops the pair
//! from the active set; re-sharing resumes above the preserved cursor
//! without re-forwarding.

use std::time::Duration;

use ctx_relay::{Engine, EngineError, Options, ShareRequest};
use relay_test_utils::{wait_for, Mesh, MeshNode};
use serde_json::json;

const SETTLE: Duration = Duration::from_secs(5);

fn engine_on(node: &MeshNode) -> Engine {
    relay_test_utils::init_tracing();
    Engine::open(node, Options::default()).expect("engine open")
}

fn share_boo(recipient: &str) -> ShareRequest {
    ShareRequest {
        context: "boo!".to_owned(),
        recipient: recipient.to_owned(),
        seq: 0,
    }
}

#[tokio::test]
async fn unshare_stops_forwarding_and_reshare_resumes_above_the_cursor() {
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
    eb.share(share_boo("carol")).await.unwrap();
    assert!(wait_for(|| !carol.wrappers_of(&m1.link).is_empty(), SETTLE).await);

    eb.unshare("boo!", "carol").await.unwrap();
    assert!(
        wait_for(|| eb.position("boo!", "carol").is_err(), SETTLE).await,
        "pair still listed as shared after unshare"
    );
    // Give the controller a beat to tear the session down.
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Traffic while unshared is not forwarded.
    let m2 = alice
        .send_message("bob", json!({ "type": "something", "hey": "ho 2" }), Some("boo!"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(carol.wrappers_of(&m2.link).is_empty());

    // Re-share: forwarding resumes above the preserved cursor, so only the
    // message observed while unshared goes out.
    eb.share(share_boo("carol")).await.unwrap();
    assert!(
        wait_for(|| !carol.wrappers_of(&m2.link).is_empty(), SETTLE).await,
        "re-share did not resume forwarding"
    );
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(carol.wrappers_of(&m1.link).len(), 1, "re-share re-forwarded old traffic");
    assert_eq!(carol.wrappers_of(&m2.link).len(), 1);
}

#[tokio::test]
async fn unshare_before_any_share_leaves_the_pair_unshared() {
    let mesh = Mesh::new().unwrap();
    let bob = mesh.node("bob");
    let eb = engine_on(&bob);

    eb.unshare("boo!", "carol").await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(matches!(
        eb.position("boo!", "carol"),
        Err(EngineError::NotShared)
    ));
}

#[tokio::test]
async fn invalid_requests_are_rejected_synchronously() {
    let mesh = Mesh::new().unwrap();
    let bob = mesh.node("bob");
    let eb = engine_on(&bob);

    let missing_recipient = eb
        .share(ShareRequest {
            context: "boo!".to_owned(),
            recipient: String::new(),
            seq: 0,
        })
        .await;
    assert!(matches!(
        missing_recipient,
        Err(EngineError::InvalidRequest(_))
    ));

    let missing_context = eb.unshare("", "carol").await;
    assert!(matches!(missing_context, Err(EngineError::InvalidRequest(_))));
}

#[tokio::test]
async fn cursor_lists_active_pairs_only() {
    let mesh = Mesh::new().unwrap();
    let bob = mesh.node("bob");
    let eb = engine_on(&bob);

    eb.share(share_boo("carol")).await.unwrap();
    eb.share(ShareRequest {
        context: "other".to_owned(),
        recipient: "dave".to_owned(),
        seq: 0,
    })
    .await
    .unwrap();
    assert!(
        wait_for(|| eb.position("other", "dave").is_ok(), SETTLE).await,
        "shares never became active"
    );

    eb.unshare("boo!", "carol").await.unwrap();
    assert!(wait_for(|| eb.position("boo!", "carol").is_err(), SETTLE).await);

    use futures_util::StreamExt;
    let rows: Vec<_> = eb
        .cursor(false)
        .filter_map(|row| async move { row.ok() })
        .collect()
        .await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].context, "other");
    assert_eq!(rows[0].recipient, "dave");
    assert_eq!(rows[0].active, Some(true));
}
