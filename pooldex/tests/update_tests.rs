//! Integration tests for full and partial pool updates

mod common;

use std::fs;
use std::sync::atomic::Ordering;

use common::*;
use pooldex::prelude::*;
use pooldex::{CollectingSink, Dependency, ItemKey, NullSink, PoolEntry, UpdatePhase};
use uuid::Uuid;

fn total_rows(index: &PoolIndex) -> usize {
    index.counts().unwrap().values().sum()
}

#[test]
fn test_full_update_indexes_fixture_pool() {
    let pool = TestPool::fixture("base");
    let registry = registry(&[&pool]);
    let mut index = PoolIndex::open_in_memory().unwrap();
    let mut sink = CollectingSink::new();

    let report = Updater::new(&mut index, &registry).update_all(&mut sink).unwrap();

    assert!(report.is_clean(), "unexpected failures: {:?}", report.failures);
    assert_eq!(report.files, 9);
    assert_eq!(report.written, 9);
    assert_eq!(total_rows(&index), 9);
    for ty in ObjectType::ALL {
        assert_eq!(index.counts().unwrap()[&ty], 1 + usize::from(ty == ObjectType::Part), "{}", ty);
    }

    let file_events = sink.events.iter().filter(|e| matches!(e, StatusEvent::File { .. })).count();
    assert_eq!(file_events, 9);
    assert!(matches!(sink.events.last(), Some(StatusEvent::Done { errors: 0, .. })));
    assert!(index.dangling_dependencies().unwrap().is_empty());
}

#[test]
fn test_files_reported_in_index_order() {
    let pool = TestPool::fixture("base");
    let registry = registry(&[&pool]);
    let mut index = PoolIndex::open_in_memory().unwrap();
    let mut sink = CollectingSink::new();
    Updater::new(&mut index, &registry).update_all(&mut sink).unwrap();

    let order: Vec<usize> = sink
        .events
        .iter()
        .filter(|e| matches!(e, StatusEvent::File { .. }))
        .map(|e| pooldex::walker::classify(pool.root(), e.path()).unwrap().index_order())
        .collect();
    let mut sorted = order.clone();
    sorted.sort();
    assert_eq!(order, sorted);
}

#[test]
fn test_parts_reported_in_walk_order_unless_base_comes_later() {
    let pool = TestPool::fixture("base");
    let based = fs::read_to_string(pool.root().join("parts/r_0603_10k_1pct.json"))
        .unwrap()
        .replace(BASED_PART, "66666666-6666-4666-8666-000000000003");
    write_file(pool.root(), "parts/a_based.json", &based);
    let plain = fs::read_to_string(pool.root().join("parts/r_0603_10k.json"))
        .unwrap()
        .replace(PART, "66666666-6666-4666-8666-000000000004");
    write_file(pool.root(), "parts/s_0805.json", &plain);
    write_file(pool.root(), "parts/zz_broken.json", "{ not json");
    let registry = registry(&[&pool]);
    let mut index = PoolIndex::open_in_memory().unwrap();
    let mut sink = CollectingSink::new();

    let report = Updater::new(&mut index, &registry).update_all(&mut sink).unwrap();

    assert_eq!(report.error_count(), 1);
    let parts: Vec<String> = sink
        .events
        .iter()
        .filter(|e| e.path().starts_with(pool.root().join("parts")))
        .map(|e| e.path().file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(
        parts,
        vec![
            "r_0603_10k.json",
            "r_0603_10k_1pct.json",
            "s_0805.json",
            "zz_broken.json",
            "a_based.json",
        ]
    );
    let row = index
        .get_item(
            &pool.entry.uuid,
            ObjectType::Part,
            &uuid("66666666-6666-4666-8666-000000000003"),
        )
        .unwrap()
        .unwrap();
    assert_eq!(row.attr_str("value"), Some("10k"));
}

#[test]
fn test_edges_point_to_earlier_or_same_types() {
    let pool = TestPool::fixture("base");
    let registry = registry(&[&pool]);
    let mut index = PoolIndex::open_in_memory().unwrap();
    Updater::new(&mut index, &registry).update_all(&mut NullSink).unwrap();

    let edges = index.all_dependencies().unwrap();
    assert!(!edges.is_empty());
    for edge in edges {
        assert!(
            edge.to.object_type.index_order() <= edge.from.object_type.index_order(),
            "{:?}",
            edge
        );
    }
}

#[test]
fn test_update_is_idempotent() {
    let pool = TestPool::fixture("base");
    let registry = registry(&[&pool]);
    let mut index = PoolIndex::open_in_memory().unwrap();

    let snapshot = |index: &PoolIndex| {
        let rows: Vec<_> = ObjectType::ALL
            .iter()
            .flat_map(|ty| index.items(None, *ty).unwrap())
            .collect();
        let tags: Vec<_> = rows
            .iter()
            .map(|r| index.tags_of(&r.pool_uuid, r.object_type, &r.uuid).unwrap())
            .collect();
        (rows, tags, index.all_dependencies().unwrap())
    };

    Updater::new(&mut index, &registry).update_all(&mut NullSink).unwrap();
    let first = snapshot(&index);
    let report = Updater::new(&mut index, &registry).update_all(&mut NullSink).unwrap();
    let second = snapshot(&index);

    assert_eq!(first, second);
    assert_eq!(report.deleted, 0);
}

#[test]
fn test_malformed_file_is_reported_and_skipped() {
    let pool = TestPool::fixture("base");
    let broken = write_file(pool.root(), "units/broken.json", "{ \"type\": \"unit\", ");
    let registry = registry(&[&pool]);
    let mut index = PoolIndex::open_in_memory().unwrap();
    let mut sink = CollectingSink::new();

    let report = Updater::new(&mut index, &registry).update_all(&mut sink).unwrap();

    assert_eq!(report.files, 10);
    assert_eq!(total_rows(&index), 9);
    let errors: Vec<_> = sink.errors().collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].path(), broken.as_path());
    match sink.done() {
        Some(StatusEvent::Done { errors, .. }) => assert_eq!(*errors, 1),
        other => panic!("expected Done, got {:?}", other),
    }
}

#[test]
fn test_unsupported_schema_version_rejected() {
    let pool = TestPool::empty("base");
    write_file(
        pool.root(),
        "symbols/future.json",
        &format!(
            r#"{{"type": "symbol", "version": 2, "uuid": "{}", "name": "Future", "unit": "{}"}}"#,
            SYMBOL, UNIT
        ),
    );
    let registry = registry(&[&pool]);
    let mut index = PoolIndex::open_in_memory().unwrap();
    let mut sink = CollectingSink::new();

    Updater::new(&mut index, &registry).update_all(&mut sink).unwrap();

    assert_eq!(total_rows(&index), 0);
    let errors: Vec<_> = sink.errors().collect();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].message().contains("schema version 2"), "{}", errors[0].message());
}

#[test]
fn test_deleted_files_are_removed() {
    let pool = TestPool::fixture("base");
    let registry = registry(&[&pool]);
    let mut index = PoolIndex::open_in_memory().unwrap();
    Updater::new(&mut index, &registry).update_all(&mut NullSink).unwrap();

    fs::remove_file(pool.root().join("frames/a4.json")).unwrap();
    let report = Updater::new(&mut index, &registry).update_all(&mut NullSink).unwrap();

    assert_eq!(report.deleted, 1);
    assert!(!index.exists(&pool.entry.uuid, ObjectType::Frame, &uuid(FRAME)).unwrap());
    assert!(index.tags_of(&pool.entry.uuid, ObjectType::Frame, &uuid(FRAME)).unwrap().is_empty());
    assert_eq!(total_rows(&index), 8);
}

#[test]
fn test_deleting_symbol_file_removes_its_edges() {
    let pool = TestPool::empty("base");
    let fixture = fixture_path("pool");
    for rel in ["units/resistor.json", "symbols/resistor.json"] {
        write_file(pool.root(), rel, &fs::read_to_string(fixture.join(rel)).unwrap());
    }
    let registry = registry(&[&pool]);
    let mut index = PoolIndex::open_in_memory().unwrap();
    Updater::new(&mut index, &registry).update_all(&mut NullSink).unwrap();

    let edges = index.all_dependencies().unwrap();
    assert_eq!(edges.len(), 1);
    assert_eq!(edges[0].from, ItemKey::new(ObjectType::Symbol, uuid(SYMBOL), pool.entry.uuid));
    assert_eq!(edges[0].to, Dependency::new(ObjectType::Unit, uuid(UNIT)));

    fs::remove_file(pool.root().join("symbols/resistor.json")).unwrap();
    let report = Updater::new(&mut index, &registry).update_all(&mut NullSink).unwrap();

    assert!(report.is_clean());
    assert_eq!(report.deleted, 1);
    let counts = index.counts().unwrap();
    assert_eq!(counts[&ObjectType::Symbol], 0);
    assert_eq!(counts[&ObjectType::Unit], 1);
    assert!(index.exists(&pool.entry.uuid, ObjectType::Unit, &uuid(UNIT)).unwrap());
    assert!(index.all_dependencies().unwrap().is_empty());
}

#[test]
fn test_failed_stale_delete_is_reported_and_run_continues() {
    let pool = TestPool::fixture("base");
    let registry = registry(&[&pool]);
    let db_dir = tempfile::TempDir::new().unwrap();
    let db_path = db_dir.path().join("pool.db");
    let mut index = PoolIndex::open(&db_path).unwrap();
    Updater::new(&mut index, &registry).update_all(&mut NullSink).unwrap();

    let other = rusqlite::Connection::open(&db_path).unwrap();
    other
        .execute_batch(
            "CREATE TRIGGER keep_frames BEFORE DELETE ON frames
             BEGIN SELECT RAISE(ABORT, 'frames are locked'); END;",
        )
        .unwrap();
    drop(other);

    fs::remove_file(pool.root().join("frames/a4.json")).unwrap();
    fs::remove_file(pool.root().join("decals/logo.json")).unwrap();
    let mut sink = CollectingSink::new();
    let report = Updater::new(&mut index, &registry).update_all(&mut sink).unwrap();

    assert_eq!(report.error_count(), 1);
    assert!(report.failures[0].message.contains("frames are locked"), "{}", report.failures[0].message);
    assert_eq!(report.deleted, 1);
    assert!(index.exists(&pool.entry.uuid, ObjectType::Frame, &uuid(FRAME)).unwrap());
    assert_eq!(index.counts().unwrap()[&ObjectType::Decal], 0);
    assert!(matches!(sink.done(), Some(StatusEvent::Done { errors: 1, .. })));
    assert_eq!(sink.errors().count(), 1);
}

#[test]
fn test_deleting_unit_leaves_dangling_edge() {
    let pool = TestPool::fixture("base");
    let registry = registry(&[&pool]);
    let mut index = PoolIndex::open_in_memory().unwrap();
    Updater::new(&mut index, &registry).update_all(&mut NullSink).unwrap();

    fs::remove_file(pool.root().join("units/resistor.json")).unwrap();
    let report = Updater::new(&mut index, &registry).update_all(&mut NullSink).unwrap();

    assert!(report.is_clean());
    assert!(index.exists(&pool.entry.uuid, ObjectType::Symbol, &uuid(SYMBOL)).unwrap());
    let dangling: Vec<_> = index.dangling_dependencies().unwrap().into_iter().map(|e| e.to).collect();
    assert!(dangling.contains(&Dependency::new(ObjectType::Unit, uuid(UNIT))));
}

#[test]
fn test_cascade_delete_removes_dependents() {
    let pool = TestPool::fixture("base");
    let registry = registry(&[&pool]);
    let mut index = PoolIndex::open_in_memory().unwrap();
    Updater::new(&mut index, &registry).update_all(&mut NullSink).unwrap();

    let options = UpdateOptions {
        cascade_delete: true,
        ..UpdateOptions::default()
    };
    let path = pool.root().join("units/resistor.json");
    fs::remove_file(&path).unwrap();
    Updater::new(&mut index, &registry)
        .with_options(options)
        .update_file(&path, &mut NullSink)
        .unwrap();

    assert!(!index.exists(&pool.entry.uuid, ObjectType::Symbol, &uuid(SYMBOL)).unwrap());
    assert!(!index.exists(&pool.entry.uuid, ObjectType::Entity, &uuid(ENTITY)).unwrap());
    assert!(index.exists(&pool.entry.uuid, ObjectType::Padstack, &uuid(PADSTACK)).unwrap());
}

#[test]
fn test_symbol_before_unit_then_partial_update() {
    let pool = TestPool::empty("base");
    let fixture = fixture_path("pool");
    write_file(
        pool.root(),
        "symbols/resistor.json",
        &fs::read_to_string(fixture.join("symbols/resistor.json")).unwrap(),
    );
    let registry = registry(&[&pool]);
    let mut index = PoolIndex::open_in_memory().unwrap();

    let report = Updater::new(&mut index, &registry).update_all(&mut NullSink).unwrap();
    assert!(report.is_clean());
    assert_eq!(index.dangling_dependencies().unwrap().len(), 1);

    let unit = write_file(
        pool.root(),
        "units/resistor.json",
        &fs::read_to_string(fixture.join("units/resistor.json")).unwrap(),
    );
    let mut sink = CollectingSink::new();
    let report = Updater::new(&mut index, &registry).update_file(&unit, &mut sink).unwrap();

    assert!(report.is_clean());
    assert!(index.dangling_dependencies().unwrap().is_empty());
    let dependents = index.dependents_of(ObjectType::Unit, &uuid(UNIT)).unwrap();
    assert_eq!(
        dependents,
        vec![ItemKey::new(ObjectType::Symbol, uuid(SYMBOL), pool.entry.uuid)]
    );
    assert!(matches!(sink.done(), Some(StatusEvent::Done { errors: 0, .. })));
}

#[test]
fn test_based_part_inherits_from_base() {
    let pool = TestPool::fixture("base");
    let registry = registry(&[&pool]);
    let mut index = PoolIndex::open_in_memory().unwrap();
    Updater::new(&mut index, &registry).update_all(&mut NullSink).unwrap();

    let row = index
        .get_item(&pool.entry.uuid, ObjectType::Part, &uuid(BASED_PART))
        .unwrap()
        .unwrap();
    assert_eq!(row.name, "RC0603FR-0710KL");
    assert_eq!(row.attr_str("manufacturer"), Some("Yageo"));
    assert_eq!(row.attr_str("value"), Some("10k"));
    assert_eq!(row.attr_str("description"), Some("Thick film resistor 1%"));
    assert_eq!(row.attr_uuid("entity"), Some(uuid(ENTITY)));
    assert_eq!(row.attr_uuid("package"), Some(uuid(PACKAGE)));

    let tags = index.tags_of(&pool.entry.uuid, ObjectType::Part, &uuid(BASED_PART)).unwrap();
    assert_eq!(tags, vec!["precision", "resistor", "smd"]);

    let deps = index
        .dependencies_of(&pool.entry.uuid, ObjectType::Part, &uuid(BASED_PART))
        .unwrap();
    assert!(deps.contains(&Dependency::new(ObjectType::Part, uuid(PART))));
    assert!(deps.contains(&Dependency::new(ObjectType::Entity, uuid(ENTITY))));
    assert!(deps.contains(&Dependency::new(ObjectType::Package, uuid(PACKAGE))));
}

#[test]
fn test_based_part_without_base_fails() {
    let pool = TestPool::fixture("base");
    fs::remove_file(pool.root().join("parts/r_0603_10k.json")).unwrap();
    let registry = registry(&[&pool]);
    let mut index = PoolIndex::open_in_memory().unwrap();
    let mut sink = CollectingSink::new();

    let report = Updater::new(&mut index, &registry).update_all(&mut sink).unwrap();

    assert_eq!(report.error_count(), 1);
    assert!(report.failures[0].message.starts_with("Reference error"));
    assert_eq!(index.counts().unwrap()[&ObjectType::Part], 0);
}

#[test]
fn test_removed_base_is_not_inherited_from_stale_row() {
    let pool = TestPool::fixture("base");
    let registry = registry(&[&pool]);
    let mut index = PoolIndex::open_in_memory().unwrap();
    Updater::new(&mut index, &registry).update_all(&mut NullSink).unwrap();

    fs::remove_file(pool.root().join("parts/r_0603_10k.json")).unwrap();
    let report = Updater::new(&mut index, &registry).update_all(&mut NullSink).unwrap();

    assert_eq!(report.error_count(), 1);
    assert_eq!(index.counts().unwrap()[&ObjectType::Part], 0);
}

#[test]
fn test_partial_update_refreshes_dependents() {
    let pool = TestPool::fixture("base");
    let registry = registry(&[&pool]);
    let mut index = PoolIndex::open_in_memory().unwrap();
    Updater::new(&mut index, &registry).update_all(&mut NullSink).unwrap();

    let path = pool.root().join("parts/r_0603_10k.json");
    let content = fs::read_to_string(&path).unwrap().replace("\"10k\"", "\"22k\"");
    fs::write(&path, content).unwrap();

    let mut sink = CollectingSink::new();
    let report = Updater::new(&mut index, &registry).update_file(&path, &mut sink).unwrap();

    assert!(report.is_clean());
    assert_eq!(report.written, 2);
    let based = index
        .get_item(&pool.entry.uuid, ObjectType::Part, &uuid(BASED_PART))
        .unwrap()
        .unwrap();
    assert_eq!(based.attr_str("value"), Some("22k"));
}

#[test]
fn test_partial_update_of_changed_uuid_replaces_row() {
    let pool = TestPool::fixture("base");
    let registry = registry(&[&pool]);
    let mut index = PoolIndex::open_in_memory().unwrap();
    Updater::new(&mut index, &registry).update_all(&mut NullSink).unwrap();

    let new_uuid = "77777777-7777-4777-8777-000000000002";
    let path = write_file(
        pool.root(),
        "frames/a4.json",
        &format!(r#"{{"type": "frame", "uuid": "{}", "name": "A4 portrait"}}"#, new_uuid),
    );
    Updater::new(&mut index, &registry).update_file(&path, &mut NullSink).unwrap();

    let frames = index.items(Some(&pool.entry.uuid), ObjectType::Frame).unwrap();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].uuid, uuid(new_uuid));
}

#[test]
fn test_partial_update_skips_hidden_directories() {
    let pool = TestPool::fixture("base");
    let registry = registry(&[&pool]);
    let mut index = PoolIndex::open_in_memory().unwrap();
    Updater::new(&mut index, &registry).update_all(&mut NullSink).unwrap();

    let draft = fs::read_to_string(pool.root().join("frames/a4.json"))
        .unwrap()
        .replace(FRAME, "77777777-7777-4777-8777-000000000002");
    let path = write_file(pool.root(), "frames/.drafts/a3.json", &draft);
    let mut sink = CollectingSink::new();
    let report = Updater::new(&mut index, &registry).update_file(&path, &mut sink).unwrap();

    assert_eq!(report.error_count(), 1);
    assert_eq!(report.written, 0);
    assert_eq!(index.counts().unwrap()[&ObjectType::Frame], 1);
    assert!(matches!(sink.errors().next(), Some(StatusEvent::FileError { .. })));
}

#[test]
fn test_partial_update_outside_pool_is_config_error() {
    let pool = TestPool::fixture("base");
    let other = tempfile::TempDir::new().unwrap();
    let path = write_file(other.path(), "units/x.json", "{}");
    let registry = registry(&[&pool]);
    let mut index = PoolIndex::open_in_memory().unwrap();
    let mut sink = CollectingSink::new();

    let result = Updater::new(&mut index, &registry).update_file(&path, &mut sink);

    assert!(matches!(result, Err(PoolError::Config(_))));
    assert_eq!(sink.errors().count(), 1);
    assert!(matches!(sink.done(), Some(StatusEvent::Done { errors: 1, .. })));
}

#[test]
fn test_missing_pool_root_is_config_error() {
    let pool = TestPool::fixture("base");
    let mut registry_entries = vec![pool.entry.clone()];
    registry_entries.push(PoolEntry::new(
        Uuid::new_v4(),
        "gone",
        pool.root().join("does-not-exist"),
    ));
    let registry = PoolRegistry::new(registry_entries).unwrap();
    let mut index = PoolIndex::open_in_memory().unwrap();
    let mut sink = CollectingSink::new();

    let result = Updater::new(&mut index, &registry).update_all(&mut sink);

    assert!(matches!(result, Err(PoolError::Config(_))));
    assert!(sink.done().is_some());
    assert_eq!(total_rows(&index), 0);
}

#[test]
fn test_cancelled_run_keeps_existing_rows() {
    let pool = TestPool::fixture("base");
    let registry = registry(&[&pool]);
    let mut index = PoolIndex::open_in_memory().unwrap();
    Updater::new(&mut index, &registry).update_all(&mut NullSink).unwrap();
    fs::remove_file(pool.root().join("frames/a4.json")).unwrap();

    let options = UpdateOptions::default();
    options.cancel.store(true, Ordering::Relaxed);
    let mut sink = CollectingSink::new();
    let report = Updater::new(&mut index, &registry)
        .with_options(options)
        .update_all(&mut sink)
        .unwrap();

    assert!(report.cancelled);
    assert_eq!(report.files, 0);
    assert_eq!(total_rows(&index), 9);
    assert!(sink.done().is_some());
}

#[test]
fn test_updater_phase_ends_done() {
    let pool = TestPool::fixture("base");
    let registry = registry(&[&pool]);
    let mut index = PoolIndex::open_in_memory().unwrap();
    let mut updater = Updater::new(&mut index, &registry);
    assert_eq!(updater.phase(), UpdatePhase::Idle);
    updater.update_pool(&pool.entry.uuid, &mut NullSink).unwrap();
    assert_eq!(updater.phase(), UpdatePhase::Done);
}

#[test]
fn test_index_file_survives_reopen() {
    let pool = TestPool::fixture("base");
    let registry = registry(&[&pool]);
    let db_dir = tempfile::TempDir::new().unwrap();
    let db_path = db_dir.path().join("pool.db");
    {
        let mut index = PoolIndex::open(&db_path).unwrap();
        Updater::new(&mut index, &registry).update_all(&mut NullSink).unwrap();
    }
    let reader = PoolIndex::open_read_only(&db_path).unwrap();
    assert_eq!(total_rows(&reader), 9);
}
