//! Property-based tests using proptest.
//!
//! These tests verify invariants that should hold for all inputs,
//! helping catch edge cases that unit tests might miss.

use nrtm_engine::changelog::{Operation, SerialEntry};
use nrtm_engine::nrtm3::{QueryMode, SerialEnd};
use nrtm_engine::nrtm4::{
    sha256_hex, DeltaChange, NrtmDocumentType, NrtmVersionInfo, PublishableDeltaFile,
};
use nrtm_engine::{
    DeltaFileGenerator, DeltaTransformer, Query, SnapshotFileGenerator, Source, SourceContext,
    SqliteStore,
};
use proptest::prelude::*;
use std::collections::HashSet;

fn context() -> SourceContext {
    SourceContext::new("RIPE").with_non_authoritative("RIPE-NONAUTH")
}

/// Randomly re-case an ASCII string.
fn recase(s: &str, mask: u64) -> String {
    s.chars()
        .enumerate()
        .map(|(i, c)| {
            if mask >> (i % 64) & 1 == 1 {
                c.to_ascii_uppercase()
            } else {
                c.to_ascii_lowercase()
            }
        })
        .collect()
}

fn operation() -> impl Strategy<Value = Operation> {
    prop_oneof![
        Just(Operation::Add),
        Just(Operation::Update),
        Just(Operation::Delete)
    ]
}

fn entries() -> impl Strategy<Value = Vec<SerialEntry>> {
    prop::collection::vec(
        (
            operation(),
            prop_oneof![Just("mntner"), Just("person"), Just("route"), Just("ROLE")],
            0u8..6,
            prop::option::weighted(0.8, "[a-z]{1,12}"),
        ),
        0..40,
    )
    .prop_map(|raw| {
        raw.into_iter()
            .enumerate()
            .map(|(i, (operation, object_type, key, payload))| SerialEntry {
                serial_id: i as i64 + 1,
                operation,
                object_type: object_type.to_string(),
                primary_key: format!("KEY-{}", key),
                payload,
                committed_at: 0,
            })
            .collect()
    })
}

// =============================================================================
// Query Grammar Properties
// =============================================================================

proptest! {
    /// Any well-formed range parses back to the same bounds
    #[test]
    fn mirror_range_roundtrips(begin in 0i64..1_000_000, len in 0i64..1_000_000, keepalive: bool) {
        let end = begin + len;
        let line = if keepalive {
            format!("-k -g RIPE:3:{}-{}", begin, end)
        } else {
            format!("-g RIPE:3:{}-{}", begin, end)
        };
        let query = Query::parse(&context(), &line).unwrap();

        prop_assert_eq!(query.mode, QueryMode::Mirror);
        prop_assert_eq!(query.serial_begin, begin);
        prop_assert_eq!(query.serial_end, SerialEnd::At(end));
        prop_assert_eq!(query.keepalive, keepalive);
    }

    /// Keywords and source names are case-insensitive; the source comes back canonical
    #[test]
    fn keywords_are_case_insensitive(mask: u64, begin in 0i64..1000) {
        let source = recase("ripe-nonauth", mask);
        let last = recase("last", mask.rotate_left(7));
        let line = format!("-g {}:3:{}-{}", source, begin, last);
        let query = Query::parse(&context(), &line).unwrap();

        prop_assert_eq!(query.source, Source::new("RIPE-NONAUTH"));
        prop_assert_eq!(query.serial_end, SerialEnd::Last);
        prop_assert_eq!(query.serial_end.as_legacy(), -1);

        let info = format!("-q {}", recase("sources", mask));
        prop_assert_eq!(Query::parse(&context(), &info).unwrap().mode, QueryMode::Info);
    }

    /// An end before the beginning is always a syntax error
    #[test]
    fn reversed_range_is_rejected(end in 0i64..1_000_000, gap in 1i64..1000) {
        let line = format!("-g RIPE:3:{}-{}", end + gap, end);
        let err = Query::parse(&context(), &line).unwrap_err();
        prop_assert_eq!(err.code().as_u16(), 405);
    }

    /// Unservable sources are rejected before anything else in the -g value is looked at
    #[test]
    fn unknown_source_wins_over_other_errors(
        source in "[A-Z]{1,10}",
        rest in "[0-9a-z:-]{0,20}",
    ) {
        prop_assume!(!source.eq_ignore_ascii_case("RIPE"));
        let line = format!("-g {}:{}", source, rest);
        let err = Query::parse(&context(), &line).unwrap_err();
        prop_assert_eq!(err.code().as_u16(), 403);
    }

    /// Every protocol version but 3 is unsupported
    #[test]
    fn other_versions_are_rejected(version in 0u32..100) {
        prop_assume!(version != 3);
        let line = format!("-g RIPE:{}:1-2", version);
        let err = Query::parse(&context(), &line).unwrap_err();
        prop_assert_eq!(err.code().as_u16(), 406);
    }

    /// The parser never panics and only ever produces known codes
    #[test]
    fn arbitrary_input_never_panics(line in "\\PC{0,80}") {
        if let Err(err) = Query::parse(&context(), &line) {
            prop_assert!([400, 401, 403, 405, 406].contains(&err.code().as_u16()));
            prop_assert!(err.wire_response().starts_with("ERROR:"));
        }
    }

    /// Flag-shaped noise never panics either
    #[test]
    fn flag_soup_never_panics(tokens in prop::collection::vec(
        prop_oneof![
            Just("-q".to_string()),
            Just("-g".to_string()),
            Just("-k".to_string()),
            Just("sources".to_string()),
            Just("RIPE:3:1-LAST".to_string()),
            "[a-z0-9:-]{1,8}",
        ],
        0..8,
    )) {
        let line = tokens.join(" ");
        let _ = Query::parse(&context(), &line);
    }
}

// =============================================================================
// Transformer Properties
// =============================================================================

proptest! {
    /// Delta changes preserve order and never carry excluded types
    #[test]
    fn delta_changes_are_filtered_in_order(entries in entries()) {
        let transformer = DeltaTransformer::default();
        let changes = transformer.to_delta_changes(&entries);

        prop_assert!(changes.len() <= entries.len());
        for change in &changes {
            prop_assert!(transformer.is_publishable(&change.object_type));
            prop_assert_eq!(change.payload.is_none(), change.operation == Operation::Delete);
        }

        // Order preserving: changes are a subsequence of the entries
        let mut remaining = entries.iter();
        for change in &changes {
            prop_assert!(remaining.any(|e| e.primary_key == change.primary_key
                && e.object_type == change.object_type
                && e.operation == change.operation));
        }
    }

    /// Snapshot objects are unique, sorted, and only live objects remain
    #[test]
    fn snapshot_fold_keeps_latest_live_state(entries in entries()) {
        let transformer = DeltaTransformer::default();
        let objects = transformer.to_snapshot_objects(&entries);

        let keys: Vec<_> = objects.iter().map(|o| (o.object_type.clone(), o.primary_key.clone())).collect();
        let unique: HashSet<_> = keys.iter().cloned().collect();
        prop_assert_eq!(unique.len(), keys.len());
        prop_assert!(keys.windows(2).all(|w| w[0] < w[1]));

        for object in &objects {
            prop_assert!(transformer.is_publishable(&object.object_type));
            let last_touch = entries
                .iter()
                .filter(|e| e.object_type == object.object_type
                    && e.primary_key == object.primary_key
                    && (e.operation == Operation::Delete || e.payload.is_some()))
                .last()
                .unwrap();
            prop_assert_ne!(last_touch.operation, Operation::Delete);
            prop_assert_eq!(last_touch.payload.as_deref(), Some(object.payload.as_str()));
        }
    }
}

// =============================================================================
// Document Properties
// =============================================================================

fn version_info(version: i64, last_serial_id: i64) -> NrtmVersionInfo {
    NrtmVersionInfo {
        id: version,
        source: Source::new("RIPE"),
        version,
        kind: NrtmDocumentType::Delta,
        last_serial_id,
        session_id: "0f6a2c1e-1111-2222-3333-444455556666".to_string(),
        created_at: 1_767_225_600_000,
    }
}

proptest! {
    /// Serialization and hashing are deterministic
    #[test]
    fn delta_documents_hash_deterministically(
        version in 2i64..10_000,
        last_serial in 0i64..1_000_000,
        payloads in prop::collection::vec("[ -~]{0,40}", 0..10),
    ) {
        let changes: Vec<DeltaChange> = payloads
            .iter()
            .enumerate()
            .map(|(i, p)| DeltaChange {
                operation: Operation::Add,
                object_type: "mntner".to_string(),
                primary_key: format!("MNT-{}", i),
                payload: Some(p.clone()),
            })
            .collect();

        let a = PublishableDeltaFile::new(version_info(version, last_serial), changes.clone()).to_json().unwrap();
        let b = PublishableDeltaFile::new(version_info(version, last_serial), changes).to_json().unwrap();
        prop_assert_eq!(&a, &b);

        let hash = sha256_hex(&a);
        prop_assert_eq!(hash.len(), 64);
        prop_assert!(hash.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        prop_assert_eq!(hash, sha256_hex(&b));

        let other = PublishableDeltaFile::new(version_info(version + 1, last_serial), vec![]).to_json().unwrap();
        prop_assert_ne!(sha256_hex(&a), sha256_hex(&other));
    }
}

// =============================================================================
// Version Chain Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// Versions grow by one per delta with publishable changes, and never otherwise
    #[test]
    fn versions_are_monotonic_and_gap_free(batches in prop::collection::vec((0usize..4, any::<bool>()), 1..8)) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let store = SqliteStore::in_memory().await.unwrap();
            let ripe = Source::new("RIPE");
            let transformer = DeltaTransformer::default();
            SnapshotFileGenerator::new(&store, transformer.clone())
                .create_snapshot(&ripe)
                .await
                .unwrap();
            let deltas = DeltaFileGenerator::new(&store, transformer);

            let mut expected_version = 1;
            let mut last_serial = 0;
            for (count, publishable) in batches {
                let object_type = if publishable { "mntner" } else { "person" };
                for i in 0..count {
                    store
                        .append(&ripe, Operation::Add, object_type, &format!("K-{}", i), Some("x"))
                        .await
                        .unwrap();
                }

                let result = deltas.create_delta(&ripe).await.unwrap();
                if count > 0 && publishable {
                    expected_version += 1;
                    let delta = result.unwrap();
                    assert_eq!(delta.version_info.version, expected_version);
                    assert!(delta.version_info.last_serial_id > last_serial);
                    last_serial = delta.version_info.last_serial_id;
                } else {
                    assert!(result.is_none());
                }
            }
        });
    }
}
