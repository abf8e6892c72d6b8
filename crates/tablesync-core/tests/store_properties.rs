//! Property-based tests for the table store and the wire decoder.
//!
//! Run with: `cargo test --package tablesync-core --test store_properties`

use std::collections::HashMap;

use proptest::prelude::*;

use tablesync_core::protocol::decode_message;
use tablesync_core::{ChangeKind, TableStore, Value, WriterId};

// =============================================================================
// Strategies
// =============================================================================

/// A small key space so operations collide often.
fn key_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("/a".to_string()),
        Just("/a/b".to_string()),
        Just("/b".to_string()),
        Just("/b/c".to_string()),
        Just("/c".to_string()),
    ]
}

#[derive(Debug, Clone)]
enum Op {
    SetDouble(String, f64),
    SetString(String, String),
    Delete(String),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (key_strategy(), -1e6f64..1e6).prop_map(|(k, v)| Op::SetDouble(k, v)),
        (key_strategy(), "[a-z]{0,8}").prop_map(|(k, v)| Op::SetString(k, v)),
        key_strategy().prop_map(Op::Delete),
    ]
}

fn apply(store: &TableStore, op: &Op, writer: &WriterId) {
    // Type mismatches are expected and leave the store unchanged.
    let _ = match op {
        Op::SetDouble(k, v) => store.set(k, Value::Double(*v), writer).map(|_| ()),
        Op::SetString(k, v) => store.set(k, Value::from(v.as_str()), writer).map(|_| ()),
        Op::Delete(k) => store.delete(k, writer).map(|_| ()),
    };
}

// =============================================================================
// Store properties
// =============================================================================

proptest! {
    /// Versions observed through a stream strictly increase per key, and the
    /// stream's last event per key matches the store's final entry.
    #[test]
    fn versions_strictly_increase_per_key(ops in prop::collection::vec(op_strategy(), 1..200)) {
        let store = TableStore::new();
        let mut stream = store.subscribe("");
        let writer = WriterId::new("prop");

        for op in &ops {
            apply(&store, op, &writer);
        }

        let mut last: HashMap<String, u64> = HashMap::new();
        for event in stream.by_ref() {
            if let Some(prev) = last.get(&event.key) {
                prop_assert!(event.version == prev + 1, "{} jumped {} -> {}", event.key, prev, event.version);
            }
            last.insert(event.key.clone(), event.version);
        }
        for (key, version) in last {
            prop_assert_eq!(store.entry(&key).map(|e| e.version), Some(version));
        }
    }

    /// A prefix stream sees exactly the events under its prefix.
    #[test]
    fn prefix_stream_sees_only_matching_keys(ops in prop::collection::vec(op_strategy(), 1..100)) {
        let store = TableStore::new();
        let mut all = store.subscribe("");
        let mut under_b = store.subscribe("/b");
        let writer = WriterId::new("prop");

        for op in &ops {
            apply(&store, op, &writer);
        }

        let expected: Vec<(String, u64)> = all
            .by_ref()
            .filter(|e| e.key.starts_with("/b"))
            .map(|e| (e.key, e.version))
            .collect();
        let actual: Vec<(String, u64)> = under_b.by_ref().map(|e| (e.key, e.version)).collect();
        prop_assert_eq!(actual, expected);
    }

    /// After resync the live contents equal the authoritative snapshot.
    #[test]
    fn resync_converges(
        local in prop::collection::vec(op_strategy(), 0..50),
        remote in prop::collection::hash_map(key_strategy(), -1e6f64..1e6, 0..5),
    ) {
        let store = TableStore::new();
        let writer = WriterId::new("local");
        for op in &local {
            apply(&store, op, &writer);
        }

        let snapshot: Vec<(String, Value)> =
            remote.iter().map(|(k, v)| (k.clone(), Value::Double(*v))).collect();
        store.resync(snapshot, &WriterId::new("upstream"), |_| false);

        let live: HashMap<String, Value> = store
            .snapshot("")
            .into_iter()
            .filter_map(|e| e.value.map(|v| (e.key, v)))
            .collect();
        let expected: HashMap<String, Value> =
            remote.into_iter().map(|(k, v)| (k, Value::Double(v))).collect();
        prop_assert_eq!(live, expected);
    }

    /// Restarting a stream yields exactly the live snapshot as `Assigned` events.
    #[test]
    fn restart_replays_live_state(ops in prop::collection::vec(op_strategy(), 0..100)) {
        let store = TableStore::new();
        let writer = WriterId::new("prop");
        for op in &ops {
            apply(&store, op, &writer);
        }

        let mut stream = store.subscribe("");
        stream.restart();
        let replayed: Vec<_> = stream.by_ref().collect();

        prop_assert!(replayed.iter().all(|e| e.kind == ChangeKind::Assigned));
        prop_assert_eq!(replayed.len(), store.len());
    }
}

// =============================================================================
// Decoder robustness
// =============================================================================

proptest! {
    /// The decoder never panics on arbitrary bytes.
    #[test]
    fn decode_never_panics_on_random_bytes(bytes in prop::collection::vec(any::<u8>(), 0..512)) {
        let _ = decode_message(&bytes);
    }

    /// The decoder never panics on a valid header followed by garbage.
    #[test]
    fn decode_never_panics_on_garbage_payload(
        msg_type in prop_oneof![Just(0x01u8), Just(0x02), Just(0x03), Just(0x09), Just(0x0A), Just(0x10), Just(0x11)],
        payload in prop::collection::vec(any::<u8>(), 0..256),
    ) {
        let mut bytes = vec![0x01, msg_type, 0, 0];
        bytes.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        bytes.extend_from_slice(&[0u8; 16]);
        bytes.extend_from_slice(&payload);
        let _ = decode_message(&bytes);
    }
}
