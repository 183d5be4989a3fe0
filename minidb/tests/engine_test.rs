use minidb::{CancelToken, Column, DataType, Engine, EngineConfig, Rid, Schema, Value};
use strata::wal::SyncPolicy;
use tempfile::tempdir;

fn users_schema() -> Schema {
    Schema::new(vec![
        Column::new("id", DataType::Int, false),
        Column::new("name", DataType::String, true),
    ])
}

fn open_engine(dir: &tempfile::TempDir) -> Engine {
    Engine::open(EngineConfig::new(dir.path()).wal_sync(SyncPolicy::Commit)).unwrap()
}

fn row(id: i32, name: &str) -> Vec<Value> {
    vec![Value::Int(id), Value::Str(name.to_string())]
}

fn collect_ids(engine: &Engine, txn: u32, table: &str) -> Vec<i32> {
    let mut ids: Vec<i32> = engine
        .scan(txn, table)
        .unwrap()
        .map(|r| match &r.unwrap().1[0] {
            Value::Int(v) => *v,
            other => panic!("unexpected {other:?}"),
        })
        .collect();
    ids.sort_unstable();
    ids
}

#[test]
fn heap_round_trip_with_slot_reuse() {
    let dir = tempdir().unwrap();
    let engine = open_engine(&dir);
    engine.create_table("t", users_schema()).unwrap();

    let txn = engine.begin();
    engine.insert(txn, "t", &row(1, "a")).unwrap();
    let rid_b = engine.insert(txn, "t", &row(2, "b")).unwrap();
    engine.insert(txn, "t", &row(3, "c")).unwrap();
    assert_eq!(rid_b, Rid::new(1, 1));

    engine.delete(txn, "t", rid_b).unwrap();
    let rid_d = engine.insert(txn, "t", &row(4, "d")).unwrap();
    assert_eq!(rid_d, Rid::new(1, 1), "freed slot 1 on page 1 is reused");

    assert_eq!(collect_ids(&engine, txn, "t"), vec![1, 3, 4]);
    engine.commit(txn).unwrap();

    let txn = engine.begin();
    assert_eq!(collect_ids(&engine, txn, "t"), vec![1, 3, 4]);
    engine.commit(txn).unwrap();
}

#[test]
fn get_update_delete_by_rid() {
    let dir = tempdir().unwrap();
    let engine = open_engine(&dir);
    engine.create_table("t", users_schema()).unwrap();

    let txn = engine.begin();
    let rid = engine.insert(txn, "t", &row(1, "before")).unwrap();
    assert_eq!(engine.get(txn, "t", rid).unwrap().unwrap(), row(1, "before"));

    let same = engine.update(txn, "t", rid, &row(1, "after")).unwrap();
    assert_eq!(same, rid);
    assert_eq!(engine.get(txn, "t", rid).unwrap().unwrap(), row(1, "after"));

    engine.delete(txn, "t", rid).unwrap();
    assert!(engine.get(txn, "t", rid).unwrap().is_none());
    assert!(matches!(
        engine.delete(txn, "t", rid),
        Err(minidb::DbError::RowNotFound(_))
    ));
    engine.commit(txn).unwrap();
}

#[test]
fn schema_violations_are_rejected() {
    let dir = tempdir().unwrap();
    let engine = open_engine(&dir);
    engine.create_table("t", users_schema()).unwrap();

    let txn = engine.begin();
    assert!(matches!(
        engine.insert(txn, "t", &[Value::Null, Value::Null]),
        Err(minidb::DbError::NullViolation(_))
    ));
    assert!(matches!(
        engine.insert(txn, "t", &[Value::Int(1)]),
        Err(minidb::DbError::ArityMismatch { .. })
    ));
    assert!(matches!(
        engine.insert(txn, "t", &[Value::Str("x".into()), Value::Null]),
        Err(minidb::DbError::TypeMismatch { .. })
    ));
    engine.rollback(txn).unwrap();

    assert!(matches!(
        engine.create_table("t", users_schema()),
        Err(minidb::DbError::DuplicateTable(_))
    ));
}

#[test]
fn index_point_lookup_and_range() {
    let dir = tempdir().unwrap();
    let engine = open_engine(&dir);
    engine.create_table("t", users_schema()).unwrap();

    let txn = engine.begin();
    for id in 1..=1000 {
        engine.insert(txn, "t", &row(id, &format!("row{id}"))).unwrap();
    }
    engine.commit(txn).unwrap();

    engine.create_index("ix_t_id", "t", "id", false).unwrap();

    let txn = engine.begin();
    let hits = engine.index_search(txn, "ix_t_id", &Value::Int(3)).unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(
        engine.get(txn, "t", hits[0]).unwrap().unwrap(),
        row(3, "row3")
    );

    let between = engine
        .index_range(
            txn,
            "ix_t_id",
            Some((&Value::Int(100), true)),
            Some((&Value::Int(105), true)),
        )
        .unwrap();
    let keys: Vec<i32> = between
        .iter()
        .map(|(v, _)| match v {
            Value::Int(i) => *i,
            other => panic!("unexpected {other:?}"),
        })
        .collect();
    assert_eq!(keys, vec![100, 101, 102, 103, 104, 105]);

    let unbounded_low = engine
        .index_range(txn, "ix_t_id", None, Some((&Value::Int(3), false)))
        .unwrap();
    assert_eq!(unbounded_low.len(), 2);
    engine.commit(txn).unwrap();
}

#[test]
fn indexes_follow_inserts_updates_and_deletes() {
    let dir = tempdir().unwrap();
    let engine = open_engine(&dir);
    engine.create_table("t", users_schema()).unwrap();
    engine.create_index("ix_t_id", "t", "id", false).unwrap();

    let txn = engine.begin();
    let rid = engine.insert(txn, "t", &row(7, "seven")).unwrap();
    assert_eq!(
        engine.index_search(txn, "ix_t_id", &Value::Int(7)).unwrap(),
        vec![rid]
    );

    engine.update(txn, "t", rid, &row(8, "eight")).unwrap();
    assert!(engine.index_search(txn, "ix_t_id", &Value::Int(7)).unwrap().is_empty());
    let hits = engine.index_search(txn, "ix_t_id", &Value::Int(8)).unwrap();
    assert_eq!(hits.len(), 1);

    engine.delete(txn, "t", hits[0]).unwrap();
    assert!(engine.index_search(txn, "ix_t_id", &Value::Int(8)).unwrap().is_empty());
    engine.commit(txn).unwrap();
}

#[test]
fn index_tracks_rid_when_update_moves_the_row() {
    let dir = tempdir().unwrap();
    let engine = open_engine(&dir);
    engine.create_table("t", users_schema()).unwrap();
    engine.create_index("ix_t_id", "t", "id", false).unwrap();

    let txn = engine.begin();
    // Fill page 1 so a grown row has to move.
    let filler = "x".repeat(1200);
    let victim = engine.insert(txn, "t", &row(1, &filler)).unwrap();
    engine.insert(txn, "t", &row(2, &filler)).unwrap();
    engine.insert(txn, "t", &row(3, &filler)).unwrap();

    let grown = "y".repeat(2600);
    let new_rid = engine.update(txn, "t", victim, &row(1, &grown)).unwrap();
    assert_ne!(new_rid, victim, "row moved to another page");

    let hits = engine.index_search(txn, "ix_t_id", &Value::Int(1)).unwrap();
    assert_eq!(hits, vec![new_rid]);
    assert_eq!(
        engine.get(txn, "t", new_rid).unwrap().unwrap(),
        row(1, &grown)
    );
    engine.commit(txn).unwrap();
}

#[test]
fn unique_index_rejects_duplicates() {
    let dir = tempdir().unwrap();
    let engine = open_engine(&dir);
    engine.create_table("t", users_schema()).unwrap();
    engine.create_index("ux_t_id", "t", "id", true).unwrap();

    let txn = engine.begin();
    engine.insert(txn, "t", &row(1, "first")).unwrap();
    let err = engine.insert(txn, "t", &row(1, "second")).unwrap_err();
    assert!(matches!(
        err,
        minidb::DbError::Index(strata::errors::IndexError::DuplicateKey)
    ));
    // The rejected row leaves no trace.
    assert_eq!(collect_ids(&engine, txn, "t"), vec![1]);
    engine.commit(txn).unwrap();
}

#[test]
fn create_index_backfills_and_rejects_existing_duplicates() {
    let dir = tempdir().unwrap();
    let engine = open_engine(&dir);
    engine.create_table("t", users_schema()).unwrap();

    let txn = engine.begin();
    engine.insert(txn, "t", &row(5, "a")).unwrap();
    engine.insert(txn, "t", &row(5, "b")).unwrap();
    engine.commit(txn).unwrap();

    // Existing duplicate values abort a UNIQUE index build.
    assert!(engine.create_index("ux_t_id", "t", "id", true).is_err());
    assert!(engine.catalog().get_index("ux_t_id").is_err());

    // A non-unique index over the same data is fine.
    engine.create_index("ix_t_id", "t", "id", false).unwrap();
    let txn = engine.begin();
    assert_eq!(
        engine.index_search(txn, "ix_t_id", &Value::Int(5)).unwrap().len(),
        2
    );
    engine.commit(txn).unwrap();
}

#[test]
fn drop_table_removes_files_and_indexes() {
    let dir = tempdir().unwrap();
    let engine = open_engine(&dir);
    engine.create_table("t", users_schema()).unwrap();
    engine.create_index("ix_t_id", "t", "id", false).unwrap();

    engine.drop_table("t").unwrap();
    assert!(!dir.path().join("t.tbl").exists());
    assert!(!dir.path().join("ix_t_id.idx").exists());

    let txn = engine.begin();
    assert!(matches!(
        engine.insert(txn, "t", &row(1, "x")),
        Err(minidb::DbError::UnknownTable(_))
    ));
    engine.rollback(txn).unwrap();

    // The name is free again.
    engine.create_table("t", users_schema()).unwrap();
}

#[test]
fn scan_honors_cancellation() {
    let dir = tempdir().unwrap();
    let engine = open_engine(&dir);
    engine.create_table("t", users_schema()).unwrap();

    let txn = engine.begin();
    for id in 0..50 {
        engine.insert(txn, "t", &row(id, "r")).unwrap();
    }

    let token = CancelToken::new();
    let mut scan = engine.scan(txn, "t").unwrap().with_cancel(token.clone());
    assert!(scan.next().unwrap().is_ok());
    token.cancel();
    assert!(matches!(
        scan.next().unwrap(),
        Err(minidb::DbError::Cancelled)
    ));
    assert!(scan.next().is_none(), "a cancelled scan stays closed");
    engine.rollback(txn).unwrap();
}

#[test]
fn closed_transactions_reject_operations() {
    let dir = tempdir().unwrap();
    let engine = open_engine(&dir);
    engine.create_table("t", users_schema()).unwrap();

    let txn = engine.begin();
    engine.insert(txn, "t", &row(1, "x")).unwrap();
    engine.commit(txn).unwrap();

    assert!(matches!(
        engine.insert(txn, "t", &row(2, "y")),
        Err(minidb::DbError::Txn(strata::transaction::TxnError::Closed(_)))
    ));
    assert!(engine.commit(txn).is_err());
    assert!(engine.rollback(txn).is_err());
}
