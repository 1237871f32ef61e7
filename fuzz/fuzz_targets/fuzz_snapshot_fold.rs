//! Fuzz target for the transformer.
//!
//! Arbitrary change histories must fold into a sorted, duplicate-free
//! snapshot, and deltas must never outgrow their input.

#![no_main]

use libfuzzer_sys::fuzz_target;
use nrtm_engine::changelog::{Operation, SerialEntry};
use nrtm_engine::DeltaTransformer;

fuzz_target!(|raw: Vec<(u8, &str, &str, Option<&str>)>| {
    let entries: Vec<SerialEntry> = raw
        .into_iter()
        .enumerate()
        .map(|(i, (op, object_type, key, payload))| SerialEntry {
            serial_id: i as i64 + 1,
            operation: match op % 3 {
                0 => Operation::Add,
                1 => Operation::Update,
                _ => Operation::Delete,
            },
            object_type: object_type.to_string(),
            primary_key: key.to_string(),
            payload: payload.map(str::to_string),
            committed_at: 0,
        })
        .collect();

    let transformer = DeltaTransformer::default();

    let changes = transformer.to_delta_changes(&entries);
    assert!(changes.len() <= entries.len());

    let objects = transformer.to_snapshot_objects(&entries);
    assert!(objects
        .windows(2)
        .all(|w| (&w[0].object_type, &w[0].primary_key) < (&w[1].object_type, &w[1].primary_key)));
});
