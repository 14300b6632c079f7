//! Crash-recovery scenarios, exercised across two separate
//! `Engine` instances sharing one data directory, the way an embedder would
//! see a process restart.

use anchordb::{EngineConfig, Engine, Key, KeyType};
use bson::doc;
use tempfile::tempdir;

fn doc_bytes(id: i64) -> Vec<u8> {
    bson::to_vec(&doc! { "id": id }).unwrap()
}

#[test]
fn test_recovery_from_wal_alone() {
    #[cfg(feature = "testing")]
    anchordb::logger::init_for_tests();

    let dir = tempdir().unwrap();
    {
        let engine = Engine::open(EngineConfig::new(dir.path())).unwrap();
        engine.create_table("t", "id", KeyType::Int64).unwrap();
        for i in 1..=5 {
            engine.put("t", "id", Key::Int64(i), doc_bytes(i)).unwrap();
        }
    }

    let engine = Engine::open(EngineConfig::new(dir.path())).unwrap();
    engine.create_table("t", "id", KeyType::Int64).unwrap();
    engine.recover().unwrap();

    for i in 1..=5 {
        assert_eq!(engine.get("t", "id", &Key::Int64(i)).unwrap(), Some(doc_bytes(i)));
    }
}

#[test]
fn test_recovery_from_checkpoint_plus_wal_delta() {
    let dir = tempdir().unwrap();
    {
        let engine = Engine::open(EngineConfig::new(dir.path())).unwrap();
        engine.create_table("t", "id", KeyType::Int64).unwrap();
        for i in 1..=5 {
            engine.put("t", "id", Key::Int64(i), doc_bytes(i)).unwrap();
        }
        engine.checkpoint_table("t").unwrap();
        engine.put("t", "id", Key::Int64(6), doc_bytes(6)).unwrap();
        engine.put("t", "id", Key::Int64(1), doc_bytes(100)).unwrap();
        engine.del("t", "id", &Key::Int64(3)).unwrap();
    }

    let engine = Engine::open(EngineConfig::new(dir.path())).unwrap();
    engine.create_table("t", "id", KeyType::Int64).unwrap();
    engine.recover().unwrap();

    assert_eq!(engine.get("t", "id", &Key::Int64(1)).unwrap(), Some(doc_bytes(100)));
    assert_eq!(engine.get("t", "id", &Key::Int64(2)).unwrap(), Some(doc_bytes(2)));
    assert_eq!(engine.get("t", "id", &Key::Int64(3)).unwrap(), None);
    assert_eq!(engine.get("t", "id", &Key::Int64(4)).unwrap(), Some(doc_bytes(4)));
    assert_eq!(engine.get("t", "id", &Key::Int64(5)).unwrap(), Some(doc_bytes(5)));
    assert_eq!(engine.get("t", "id", &Key::Int64(6)).unwrap(), Some(doc_bytes(6)));
}

#[test]
fn test_recovery_replays_a_committed_write_transaction_and_drops_an_aborted_one() {
    let dir = tempdir().unwrap();
    {
        let engine = Engine::open(EngineConfig::new(dir.path())).unwrap();
        engine.create_table("t", "id", KeyType::Int64).unwrap();

        let mut committed = engine.begin_write();
        committed.put("t", "id", Key::Int64(1), doc_bytes(1)).unwrap();
        committed.put("t", "id", Key::Int64(2), doc_bytes(2)).unwrap();
        committed.commit().unwrap();

        let mut aborted = engine.begin_write();
        aborted.put("t", "id", Key::Int64(3), doc_bytes(3)).unwrap();
        aborted.rollback().unwrap();
    }

    let engine = Engine::open(EngineConfig::new(dir.path())).unwrap();
    engine.create_table("t", "id", KeyType::Int64).unwrap();
    engine.recover().unwrap();

    assert_eq!(engine.get("t", "id", &Key::Int64(1)).unwrap(), Some(doc_bytes(1)));
    assert_eq!(engine.get("t", "id", &Key::Int64(2)).unwrap(), Some(doc_bytes(2)));
    assert_eq!(engine.get("t", "id", &Key::Int64(3)).unwrap(), None);
}
