//! Custom context extraction: contexts derived from the conversation
//! (sorted author/recipient pair) instead of an explicit body field.
//!
//! Four peers; bob shares his conversation with alice; carol receives
//! exactly the alice<->bob traffic, in bob's observation order, and none
//! of bob's unrelated traffic with dave.

use std::sync::Arc;
use std::time::Duration;

use ctx_relay::{Engine, Options, ShareRequest};
use relay_test_utils::{wait_for, Mesh, MeshNode};
use relay_types::entry::{ObjectValue, Payload, MESSAGE_TYPE};
use serde_json::json;

const SETTLE: Duration = Duration::from_secs(5);

fn conversation(value: &ObjectValue) -> Option<String> {
    let mut pair = [value.author.as_str(), value.recipient.as_str()];
    pair.sort_unstable();
    Some(pair.join(":"))
}

fn engine_with_conversation_contexts(node: &MeshNode) -> Engine {
    relay_test_utils::init_tracing();
    Engine::open(
        node,
        Options {
            get_context: Some(Arc::new(conversation)),
            ..Options::default()
        },
    )
    .expect("engine open")
}

#[tokio::test]
async fn conversation_share_forwards_exactly_that_conversation_in_order() {
    let mesh = Mesh::new().unwrap();
    let alice = mesh.node("alice");
    let bob = mesh.node("bob");
    let carol = mesh.node("carol");
    let _dave = mesh.node("dave");

    let eb = engine_with_conversation_contexts(&bob);

    // Two messages each direction between alice and bob, and unrelated
    // traffic from bob to dave.
    let a1 = alice
        .send_message("bob", json!({ "type": "something", "n": 1 }), None)
        .await
        .unwrap();
    let a2 = alice
        .send_message("bob", json!({ "type": "something", "n": 2 }), None)
        .await
        .unwrap();
    let b1 = bob
        .send_message("alice", json!({ "type": "something", "n": 3 }), None)
        .await
        .unwrap();
    let b2 = bob
        .send_message("alice", json!({ "type": "something", "n": 4 }), None)
        .await
        .unwrap();
    let d1 = bob
        .send_message("dave", json!({ "type": "something", "n": 5 }), None)
        .await
        .unwrap();

    eb.share(ShareRequest {
        context: "alice:bob".to_owned(),
        recipient: "carol".to_owned(),
        seq: 0,
    })
    .await
    .unwrap();

    let conversation_links = [&a1.link, &a2.link, &b1.link, &b2.link];
    assert!(
        wait_for(
            || {
                conversation_links
                    .iter()
                    .all(|link| !carol.wrappers_of(link).is_empty())
            },
            SETTLE
        )
        .await,
        "carol did not receive the whole conversation"
    );
    tokio::time::sleep(Duration::from_millis(300)).await;

    // None of the bob<->dave traffic leaked.
    assert!(carol.wrappers_of(&d1.link).is_empty());

    // Each conversation message arrived exactly once, in bob's
    // observation order.
    let received: Vec<String> = carol
        .observed_entries()
        .into_iter()
        .filter_map(|entry| match entry.value {
            Payload::NewObj(value) => Some(value),
            _ => None,
        })
        .filter_map(|value| {
            let info = value.objectinfo?;
            (info.object_type == MESSAGE_TYPE
                && conversation_links.contains(&&info.link))
            .then_some(info.link)
        })
        .collect();
    let expected: Vec<String> = conversation_links
        .iter()
        .map(|link| (*link).clone())
        .collect();
    assert_eq!(received, expected);
}
