//! Error handling tests.

use state_store::{
    to_path, AccessPolicy, Delta, DeltaUnit, ExtendedPath, Patch, PatchNode, PendingUpdate,
    PrimitiveKind, Protocol, Root, StoreConfig, StoreError, StructSchema, SubscribableStore,
    SubscriptionId, SubscriptionRequest, TraverseResult, TypeDesc,
};
use serde_json::json;
use std::sync::Arc;

fn test_schema() -> Arc<StructSchema> {
    let inner = StructSchema::builder("Inner")
        .field(1, "b", TypeDesc::integer())
        .optional(2, "c", TypeDesc::string())
        .build();
    StructSchema::builder("Root")
        .field(1, "tx", TypeDesc::bool())
        .optional(2, "a", TypeDesc::structure(inner))
        .field(3, "counters", TypeDesc::map(PrimitiveKind::String, TypeDesc::integer()))
        .optional(4, "hops", TypeDesc::list(TypeDesc::integer()))
        .build()
}

fn test_store() -> SubscribableStore {
    SubscribableStore::new(test_schema(), StoreConfig::default())
}

struct Restricted;

impl AccessPolicy for Restricted {
    fn is_publisher_allowed(&self, publisher_id: &str, path: &[String]) -> bool {
        publisher_id != "rogue" && path.first().map(String::as_str) != Some("tx")
    }

    fn is_extended_subscription_allowed(&self, subscriber_id: &str) -> bool {
        subscriber_id != "guest"
    }
}

#[test]
fn test_remove_absent_is_noop() {
    let store = test_store();
    store.set(&["counters", "eth0"], &1).unwrap();
    let before = store.root();

    store.remove(&["counters", "eth1"]).unwrap();

    assert!(store.root().is_same(&before));
    assert_eq!(store.stats().batches_applied, 1);
}

#[test]
fn test_remove_through_missing_intermediate() {
    let store = test_store();
    let result = store.remove(&["a", "c"]);
    assert!(matches!(result, Err(StoreError::InvalidPath { .. })));

    let result = store.remove(&["nope", "c"]);
    assert!(matches!(result, Err(StoreError::InvalidPath { .. })));
}

#[test]
fn test_remove_required_member() {
    let store = test_store();
    store.set(&["a", "b"], &1).unwrap();
    assert!(matches!(
        store.remove(&["a", "b"]),
        Err(StoreError::TypeError(_))
    ));
    // Optional members go away fine.
    store.set(&["a", "c"], "x").unwrap();
    store.remove(&["a", "c"]).unwrap();
    assert!(!store.root().exists(&["a", "c"]));
}

#[test]
fn test_set_invalid_paths() {
    let store = test_store();
    assert!(matches!(
        store.set(&["nope"], &1),
        Err(StoreError::InvalidPath { .. })
    ));
    assert!(matches!(
        store.set(&["tx", "deeper"], &1),
        Err(StoreError::InvalidPath { .. })
    ));
    assert!(matches!(
        store.get::<bool, _>(&["a", "b"]),
        Err(StoreError::InvalidPath { .. })
    ));
}

#[test]
fn test_list_index_past_end() {
    let store = test_store();
    let max = usize::MAX.to_string();
    for index in ["1", "10000000000", max.as_str()] {
        assert_eq!(
            store.set(&["hops", index], &1),
            Err(StoreError::InvalidPath {
                path: format!("hops/{}", index),
                reason: TraverseResult::InvalidArrayIndex,
            })
        );
    }

    // Appending one past the end is fine, and the store keeps writing.
    store.set(&["hops", "0"], &7).unwrap();
    store.set(&["hops", "1"], &8).unwrap();
    store.set(&["tx"], &true).unwrap();
    assert_eq!(store.get::<Vec<i64>, _>(&["hops"]).unwrap(), vec![7, 8]);
    assert!(store.get::<bool, _>(&["tx"]).unwrap());
}

#[test]
fn test_dead_update_loop_fails_writers() {
    let store = test_store();
    store.set(&["tx"], &true).unwrap();

    let other = StructSchema::builder("Other")
        .field(1, "x", TypeDesc::integer())
        .build();
    let result = store.update_blocking(PendingUpdate::new("wrong-schema", move |_| {
        Ok(Some(Root::new(other)))
    }));
    assert_eq!(result, Err(StoreError::Stopped));

    assert_eq!(store.set(&["tx"], &false), Err(StoreError::Stopped));
    assert!(store.get::<bool, _>(&["tx"]).unwrap());
    store.stop();
}

#[test]
fn test_panicking_update_stops_store() {
    let store = test_store();
    let result = store.update_blocking(PendingUpdate::new("explode", |_| {
        panic!("mutation failed hard")
    }));
    assert_eq!(result, Err(StoreError::Stopped));
    assert_eq!(store.set(&["tx"], &true), Err(StoreError::Stopped));
}

#[test]
fn test_set_wrong_type() {
    let store = test_store();
    assert!(matches!(
        store.set(&["tx"], "yes"),
        Err(StoreError::TypeError(_))
    ));
    assert!(matches!(
        store.set(&["counters"], &json!({"eth0": "one"})),
        Err(StoreError::TypeError(_))
    ));
    // Nothing was written.
    assert_eq!(store.stats().batches_applied, 0);
    assert!(!store.get::<bool, _>(&["tx"]).unwrap());
}

#[test]
fn test_decode_garbage() {
    let store = test_store();
    let result = store.set_encoded(&["tx"], b"\xc1\xff", Protocol::MsgPack);
    assert!(matches!(
        result,
        Err(StoreError::Deserialization(_)) | Err(StoreError::TypeError(_))
    ));
}

#[test]
fn test_root_patch_is_strict() {
    let store = test_store();
    let patch = Patch {
        base_path: Vec::new(),
        patch: PatchNode::value(&json!({"tx": true}), Protocol::Json).unwrap(),
    };
    assert!(matches!(store.patch(patch), Err(StoreError::TypeError(_))));

    let patch = Patch {
        base_path: Vec::new(),
        patch: PatchNode::value(&json!({"tx": true, "counters": {}}), Protocol::Json).unwrap(),
    };
    store.patch(patch).unwrap();
    assert!(store.get::<bool, _>(&["tx"]).unwrap());
}

#[test]
fn test_patch_shape_mismatch() {
    let store = test_store();
    let patch = Patch {
        base_path: to_path(&["counters"]),
        patch: PatchNode::StructFields([(1, PatchNode::Delete)].into_iter().collect()),
    };
    assert!(matches!(store.patch(patch), Err(StoreError::TypeError(_))));

    let patch = Patch {
        base_path: to_path(&["a"]),
        patch: PatchNode::StructFields(Default::default()),
    };
    assert!(matches!(
        store.patch(patch),
        Err(StoreError::InvalidPath { .. })
    ));
}

#[test]
fn test_patch_delta_is_not_atomic() {
    let store = test_store();
    let delta = Delta {
        changes: vec![
            DeltaUnit::set(&["counters", "x"], b"1".to_vec()),
            DeltaUnit::set(&["nope"], b"1".to_vec()),
            DeltaUnit::set(&["counters", "y"], b"2".to_vec()),
        ],
        protocol: Protocol::Json,
    };
    let result = store.patch_delta(delta);
    assert!(matches!(result, Err(StoreError::InvalidPath { .. })));
    assert_eq!(store.get::<i64, _>(&["counters", "x"]).unwrap(), 1);
    assert_eq!(store.get::<i64, _>(&["counters", "y"]).unwrap(), 2);
}

#[test]
fn test_policy_rejections() {
    let store = SubscribableStore::with_policy(
        Root::new(test_schema()),
        StoreConfig::default(),
        Arc::new(Restricted),
    );

    assert!(matches!(
        store.register_publisher("rogue", &["counters"]),
        Err(StoreError::PublisherNotPermitted { .. })
    ));
    assert!(matches!(
        store.register_publisher("agent", &["tx"]),
        Err(StoreError::PublisherNotPermitted { .. })
    ));
    store.register_publisher("agent", &["counters"]).unwrap();

    let extended = ExtendedPath::new().raw("counters").any();
    assert!(matches!(
        store.subscribe(SubscriptionRequest::new("guest").extended("all", extended.clone())),
        Err(StoreError::SubscriptionNotPermitted(_))
    ));
    // Concrete paths are always allowed.
    store
        .subscribe(SubscriptionRequest::new("guest").path("tx", &["tx"]))
        .unwrap();
    store
        .subscribe(SubscriptionRequest::new("admin").extended("all", extended))
        .unwrap();
    assert_eq!(store.stats().num_subscriptions, 2);
}

#[test]
fn test_publisher_registration_errors() {
    let store = test_store();
    store.register_publisher("agent", &["counters"]).unwrap();
    assert!(matches!(
        store.register_publisher("agent", &["counters"]),
        Err(StoreError::DuplicateRegistration(_))
    ));
    store.register_publisher("agent", &["tx"]).unwrap();
    assert_eq!(store.stats().num_publishers, 2);
    assert!(matches!(
        store.unregister_publisher("ghost", &["counters"], false),
        Err(StoreError::UnknownPublisher(_))
    ));
}

#[test]
fn test_subscription_errors() {
    let store = test_store();
    assert!(matches!(
        store.unsubscribe(SubscriptionId(42)),
        Err(StoreError::UnknownSubscription(42))
    ));
    assert!(matches!(
        store.subscribe(SubscriptionRequest::new("empty")),
        Err(StoreError::InvalidOperation(_))
    ));
    assert!(matches!(
        store.subscribe(
            SubscriptionRequest::new("bad-regex")
                .extended("x", ExtendedPath::new().raw("counters").regex("eth["))
        ),
        Err(StoreError::InvalidRegex { .. })
    ));
    assert!(matches!(
        store.subscribe(SubscriptionRequest::new("bad-path").path("x", &["a", "zz"])),
        Err(StoreError::InvalidPath { .. })
    ));
    assert_eq!(store.stats().num_subscriptions, 0);
    assert_eq!(store.stats().num_path_stores, 1);
}

#[test]
fn test_writes_after_stop() {
    let store = test_store();
    store.set(&["tx"], &true).unwrap();
    store.stop();

    assert_eq!(store.set(&["tx"], &false), Err(StoreError::Stopped));
    assert_eq!(
        store.update(PendingUpdate::new("late", |_| Ok(None))),
        Err(StoreError::Stopped)
    );
    assert!(store.get::<bool, _>(&["tx"]).unwrap());
    // Stopping twice is harmless.
    store.stop();
}
