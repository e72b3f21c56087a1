//! End-to-end callback flows between two in-process nodes.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use trustwire::fetch::SubscriptionSnapshot;
use trustwire::sync::{CallbackMessage, CallbackTarget};
use trustwire::{
    ActorId, CallbackEvent, CallbackHandler, CallbackKind, DeliveryOutcome, Node, SubscriptionId,
    TrustwireConfig,
};
use trustwire_testkit::{base_uri, test_config, NodePair};

fn body(sequence: u64, sub: &SubscriptionId, data: Value) -> Vec<u8> {
    let message = CallbackMessage::new(sequence, CallbackKind::Diff, data).for_subscription(sub.clone());
    serde_json::to_vec(&message).unwrap()
}

async fn secret_of(node: &Node, peer: &ActorId) -> String {
    node.trusts()
        .require(node.actor_id(), peer)
        .await
        .unwrap()
        .secret
}

fn recorder() -> (Arc<Mutex<Vec<u64>>>, Arc<dyn CallbackHandler>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let handler = move |event: CallbackEvent| {
        let sink = sink.clone();
        async move {
            sink.lock().unwrap().push(event.sequence);
            Ok::<(), anyhow::Error>(())
        }
    };
    (seen, Arc::new(handler))
}

#[tokio::test]
async fn test_publish_is_applied_and_mirrored() {
    let (seen, handler) = recorder();
    let pair = NodePair::with_bob_handler(test_config(), "friend", handler)
        .await
        .unwrap();
    let alice = pair.alice.actor_id().clone();
    let bob = pair.bob.actor_id().clone();
    let sub = SubscriptionId::new("profile");

    let (seq, outcome) = pair
        .alice
        .publish(&bob, &sub, json!({"public/name": "Alice"}))
        .await
        .unwrap();
    assert_eq!(seq, 1);
    assert_eq!(
        outcome,
        DeliveryOutcome::Delivered {
            status: 204,
            downgraded: false
        }
    );

    let (seq, _) = pair
        .alice
        .publish(&bob, &sub, json!({"public/name": null, "public/status": "away"}))
        .await
        .unwrap();
    assert_eq!(seq, 2);

    let mirrored = pair.bob.mirror().list(&bob, &alice).await.unwrap();
    assert_eq!(mirrored.len(), 1);
    assert_eq!(mirrored["public/status"], json!("away"));
    assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
    assert_eq!(pair.bob.processor().expected_sequence(&alice, &sub).await.unwrap(), 3);

    let sent = pair.network.transport.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].url, format!("{}/callbacks/subscriptions/alice/profile", base_uri("bob")));
}

#[tokio::test]
async fn test_out_of_order_callbacks_apply_in_order() {
    let (seen, handler) = recorder();
    let pair = NodePair::with_bob_handler(test_config(), "friend", handler)
        .await
        .unwrap();
    let alice = pair.alice.actor_id().clone();
    let bob = pair.bob.actor_id().clone();
    let sub = SubscriptionId::new("feed");
    let secret = secret_of(&pair.bob, &alice).await;

    let target = CallbackTarget::Subscriptions;
    let third = pair
        .bob
        .handle_callback(target, &alice, Some(&sub), &secret, &body(3, &sub, json!({"public/c": 3})))
        .await;
    assert_eq!(third.status, 202);

    let second = pair
        .bob
        .handle_callback(target, &alice, Some(&sub), &secret, &body(2, &sub, json!({"public/b": 2})))
        .await;
    assert_eq!(second.status, 202);
    assert!(seen.lock().unwrap().is_empty());

    let first = pair
        .bob
        .handle_callback(target, &alice, Some(&sub), &secret, &body(1, &sub, json!({"public/a": 1})))
        .await;
    assert_eq!(first.status, 204);
    assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);

    let again = pair
        .bob
        .handle_callback(target, &alice, Some(&sub), &secret, &body(2, &sub, json!({"public/b": 20})))
        .await;
    assert_eq!(again.status, 204);
    assert_eq!(seen.lock().unwrap().len(), 3);
    assert_eq!(pair.bob.mirror().get(&bob, &alice, "public/b").await.unwrap(), Some(json!(2)));
}

#[tokio::test]
async fn test_large_payload_is_fetched_by_receiver() {
    let config = TrustwireConfig {
        max_payload_for_high_granularity: 16,
        ..test_config()
    };
    let pair = NodePair::with_config(config, "friend").await.unwrap();
    let alice = pair.alice.actor_id().clone();
    let bob = pair.bob.actor_id().clone();
    let sub = SubscriptionId::new("profile");

    let state = json!({"public/bio": "a biography far longer than sixteen bytes"});
    pair.network.fetcher.set_snapshot(
        &base_uri("alice"),
        &sub,
        SubscriptionSnapshot {
            sequence: 1,
            data: state.clone(),
        },
    );

    let (_, outcome) = pair.alice.publish(&bob, &sub, state).await.unwrap();
    assert_eq!(
        outcome,
        DeliveryOutcome::Delivered {
            status: 204,
            downgraded: true
        }
    );

    let sent = pair.network.transport.sent();
    let message = &sent.last().unwrap().message;
    assert_eq!(message.data, None);
    assert_eq!(
        message.url.as_deref(),
        Some(format!("{}/subscriptions/bob/profile/1", base_uri("alice")).as_str())
    );
    assert_eq!(
        pair.bob.mirror().get(&bob, &alice, "public/bio").await.unwrap(),
        Some(json!("a biography far longer than sixteen bytes"))
    );
}

#[tokio::test]
async fn test_inbound_status_codes() {
    let config = TrustwireConfig {
        max_pending: 1,
        ..test_config()
    };
    let pair = NodePair::with_config(config, "friend").await.unwrap();
    let alice = pair.alice.actor_id().clone();
    let sub = SubscriptionId::new("feed");
    let secret = secret_of(&pair.bob, &alice).await;
    let target = CallbackTarget::Subscriptions;
    let ok_body = body(1, &sub, json!({}));

    let carol = ActorId::from("carol");
    let unknown = pair
        .bob
        .handle_callback(target, &carol, Some(&sub), &secret, &ok_body)
        .await;
    assert_eq!(unknown.status, 404);

    let forged = pair
        .bob
        .handle_callback(target, &alice, Some(&sub), "not-the-secret", &ok_body)
        .await;
    assert_eq!(forged.status, 403);

    let garbage = pair
        .bob
        .handle_callback(target, &alice, Some(&sub), &secret, b"{not json")
        .await;
    assert_eq!(garbage.status, 400);

    let misrouted = CallbackMessage::new(1, CallbackKind::Permission, json!({}));
    let misrouted = pair
        .bob
        .handle_callback(target, &alice, Some(&sub), &secret, &serde_json::to_vec(&misrouted).unwrap())
        .await;
    assert_eq!(misrouted.status, 400);

    let buffered = pair
        .bob
        .handle_callback(target, &alice, Some(&sub), &secret, &body(3, &sub, json!({})))
        .await;
    assert_eq!(buffered.status, 202);

    let rejected = pair
        .bob
        .handle_callback(target, &alice, Some(&sub), &secret, &body(4, &sub, json!({})))
        .await;
    assert_eq!(rejected.status, 429);
    assert_eq!(rejected.retry_after, Some(30));

    use trustwire::sync::CallbackEndpoint;
    assert_eq!(pair.bob.receive("/callbacks/bogus/alice", &secret, &ok_body).await, 404);
}

#[tokio::test]
async fn test_unfilled_gap_resyncs_from_snapshot() {
    let config = TrustwireConfig {
        gap_timeout_seconds: 1,
        ..test_config()
    };
    let pair = NodePair::with_config(config, "friend").await.unwrap();
    let alice = pair.alice.actor_id().clone();
    let bob = pair.bob.actor_id().clone();
    let sub = SubscriptionId::new("feed");
    let secret = secret_of(&pair.bob, &alice).await;
    let target = CallbackTarget::Subscriptions;

    pair.network.fetcher.set_snapshot(
        &base_uri("alice"),
        &sub,
        SubscriptionSnapshot {
            sequence: 5,
            data: json!({"public/total": 5}),
        },
    );

    let early = pair
        .bob
        .handle_callback(target, &alice, Some(&sub), &secret, &body(3, &sub, json!({"public/x": 3})))
        .await;
    assert_eq!(early.status, 202);

    tokio::time::sleep(Duration::from_millis(1_100)).await;

    let late = pair
        .bob
        .handle_callback(target, &alice, Some(&sub), &secret, &body(4, &sub, json!({"public/x": 4})))
        .await;
    assert_eq!(late.status, 202);
    assert_eq!(late.body["status"], json!("resync"));

    assert_eq!(pair.bob.processor().expected_sequence(&alice, &sub).await.unwrap(), 6);
    let mirrored = pair.bob.mirror().list(&bob, &alice).await.unwrap();
    assert_eq!(mirrored.len(), 1);
    assert_eq!(mirrored["public/total"], json!(5));
}

#[tokio::test]
async fn test_maintenance_resyncs_stale_subscriptions() {
    let config = TrustwireConfig {
        gap_timeout_seconds: 1,
        ..test_config()
    };
    let pair = NodePair::with_config(config, "friend").await.unwrap();
    let alice = pair.alice.actor_id().clone();
    let sub = SubscriptionId::new("feed");
    let stuck = SubscriptionId::new("stuck");
    let secret = secret_of(&pair.bob, &alice).await;
    let target = CallbackTarget::Subscriptions;

    pair.network.fetcher.set_snapshot(
        &base_uri("alice"),
        &sub,
        SubscriptionSnapshot {
            sequence: 9,
            data: json!({}),
        },
    );
    for s in [&sub, &stuck] {
        let response = pair
            .bob
            .handle_callback(target, &alice, Some(s), &secret, &body(2, s, json!({})))
            .await;
        assert_eq!(response.status, 202);
    }

    tokio::time::sleep(Duration::from_millis(1_100)).await;

    let report = pair.bob.maintain().await.unwrap();
    assert_eq!(report.resynced, vec![(alice.clone(), sub.clone())]);
    assert_eq!(report.failed, 1);
    assert_eq!(pair.bob.processor().expected_sequence(&alice, &sub).await.unwrap(), 10);
}

#[tokio::test]
async fn test_resync_keeps_other_subscriptions_data() {
    let pair = NodePair::new().await.unwrap();
    let alice = pair.alice.actor_id().clone();
    let bob = pair.bob.actor_id().clone();
    let profile = SubscriptionId::new("profile");
    let status = SubscriptionId::new("status");

    pair.alice
        .publish(&bob, &profile, json!({"public/name": "Alice"}))
        .await
        .unwrap();
    pair.alice
        .publish(&bob, &status, json!({"public/status": "busy", "public/mood": "ok"}))
        .await
        .unwrap();
    pair.alice
        .publish_resync(&bob, &status, json!({"public/status": "away"}))
        .await
        .unwrap();

    let mirrored = pair.bob.mirror().list(&bob, &alice).await.unwrap();
    assert_eq!(mirrored.len(), 2);
    assert_eq!(mirrored["public/name"], json!("Alice"));
    assert_eq!(mirrored["public/status"], json!("away"));
}

#[tokio::test]
async fn test_permissions_subscription_id_is_reserved() {
    let pair = NodePair::new().await.unwrap();
    let alice = pair.alice.actor_id().clone();
    let bob = pair.bob.actor_id().clone();
    let secret = secret_of(&pair.bob, &alice).await;
    let reserved = SubscriptionId::permissions();
    let before = pair.bob.peer_permissions().get(&bob, &alice).await.unwrap();

    let forged = json!({
        "permissions": {"properties": {"patterns": ["*"], "operations": ["read", "write"]}}
    });
    let response = pair
        .bob
        .handle_callback(
            CallbackTarget::Subscriptions,
            &alice,
            Some(&reserved),
            &secret,
            &body(1, &reserved, forged),
        )
        .await;
    assert_eq!(response.status, 400);
    assert_eq!(pair.bob.peer_permissions().get(&bob, &alice).await.unwrap(), before);

    let err = pair
        .alice
        .publish(&bob, &reserved, json!({"public/x": 1}))
        .await
        .unwrap_err();
    assert_eq!(err.status(), 400);
}
