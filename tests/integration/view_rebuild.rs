//! Both views are pure projections of the feed: wiping their namespaces
//! and replaying from index 0 reproduces byte-identical primary rows and
//! the same cursors.

use std::time::Duration;

use ctx_relay::{Engine, Options, ShareRequest};
use futures_util::StreamExt;
use relay_index::SqliteKv;
use relay_test_utils::{wait_for, Mesh, MeshNode};
use relay_types::kv::{KeyRange, Kv};
use serde_json::json;

const SETTLE: Duration = Duration::from_secs(5);

fn engine_on(node: &MeshNode) -> Engine {
    relay_test_utils::init_tracing();
    Engine::open(node, Options::default()).expect("engine open")
}

/// All primary state rows of a namespace, in key order.
fn primary_rows(path: &std::path::Path) -> Vec<(Vec<u8>, Vec<u8>)> {
    let kv = SqliteKv::open(path).expect("open namespace");
    let range = KeyRange {
        gte: Some(vec![b'r', 0x00]),
        lt: Some(vec![b'r', 0x01]),
        ..KeyRange::default()
    };
    kv.scan(&range, false).expect("scan namespace")
}

#[tokio::test]
async fn replaying_into_empty_namespaces_reproduces_the_views() {
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

    // Let the outbound wrapper advance the cursor, then capture the state.
    let m1_seq = bob.record(&m1.link).unwrap().change;
    assert!(
        wait_for(
            || eb.position("boo!", "carol").map(|seq| seq >= m1_seq).unwrap_or(false),
            SETTLE
        )
        .await
    );
    let position_before = eb.position("boo!", "carol").unwrap();
    eb.close();

    let msg_path = bob.db_path("msg-contexts.db");
    let ctx_path = bob.db_path("ctx-contexts.db");
    let msg_rows = primary_rows(&msg_path);
    let ctx_rows = primary_rows(&ctx_path);
    assert!(!msg_rows.is_empty());
    assert!(!ctx_rows.is_empty());

    // Destroy both namespaces and rebuild from the feed alone. The
    // controller stays off: rebuild equivalence is a statement about the
    // views, not about redelivery.
    bob.wipe_db("msg-contexts.db").unwrap();
    bob.wipe_db("ctx-contexts.db").unwrap();
    let eb = Engine::open(
        bob.as_ref(),
        Options {
            autostart: false,
            ..Options::default()
        },
    )
    .expect("engine reopen");

    assert!(
        wait_for(
            || primary_rows(&msg_path) == msg_rows && primary_rows(&ctx_path) == ctx_rows,
            SETTLE
        )
        .await,
        "replay did not reproduce the namespaces byte-for-byte"
    );

    assert_eq!(eb.position("boo!", "carol").unwrap(), position_before);
    let pending: Vec<_> = eb
        .messages("boo!", "carol", false)
        .unwrap()
        .collect()
        .await;
    assert!(pending.is_empty());
}

#[tokio::test]
async fn context_stream_yields_messages_in_observation_order() {
    let mesh = Mesh::new().unwrap();
    let alice = mesh.node("alice");
    let bob = mesh.node("bob");
    let _ea = engine_on(&alice);
    let eb = engine_on(&bob);

    let mut links = Vec::new();
    for n in 0..4 {
        let sent = alice
            .send_message("bob", json!({ "type": "something", "n": n }), Some("boo!"))
            .await
            .unwrap();
        links.push(sent.link);
    }
    let deadline = tokio::time::Instant::now() + SETTLE;
    loop {
        let n = eb.context_stream("boo!", 0, false).count().await;
        if n == 4 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "message view never caught up"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let rows: Vec<_> = eb
        .context_stream("boo!", 0, false)
        .filter_map(|row| async move { row.ok() })
        .collect()
        .await;
    let got: Vec<&str> = rows.iter().map(|r| r.permalink.as_str()).collect();
    let expected: Vec<&str> = links.iter().map(String::as_str).collect();
    assert_eq!(got, expected);

    // Sequences are strictly increasing within the context.
    for pair in rows.windows(2) {
        assert!(pair[0].seq < pair[1].seq);
    }
}
