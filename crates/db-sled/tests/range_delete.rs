use rollup_db::util::{delete_from_range, delete_starting_at};
use rollup_db::{is_not_found, Database};
use rollup_db_sled::SledDb;

const PREFIX: &[u8] = b"t";

fn key(i: u64) -> Vec<u8> {
    let mut k = PREFIX.to_vec();
    k.extend_from_slice(&i.to_be_bytes());
    k
}

fn populated(dir: &std::path::Path, n: u64) -> SledDb {
    let db = SledDb::open(dir.to_str().unwrap()).unwrap();
    for i in 0..n {
        db.put(&key(i), &[i as u8]).unwrap();
    }
    db
}

#[test]
fn get_missing_key_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let db = SledDb::open(dir.path().to_str().unwrap()).unwrap();
    let err = db.get(b"nope").unwrap_err();
    assert!(is_not_found(&err));
}

#[test]
fn delete_starting_at_stages_suffix_into_batch() {
    let dir = tempfile::tempdir().unwrap();
    let db = populated(dir.path(), 10);

    let mut batch = db.new_batch();
    delete_starting_at(&db, batch.as_mut(), PREFIX, &4u64.to_be_bytes()).unwrap();
    // Nothing visible until the batch commits.
    assert!(db.has(&key(7)).unwrap());
    batch.write().unwrap();

    for i in 0..4 {
        assert!(db.has(&key(i)).unwrap());
    }
    for i in 4..10 {
        assert!(!db.has(&key(i)).unwrap());
    }
}

#[test]
fn delete_from_range_reports_pruned_bounds() {
    let dir = tempfile::tempdir().unwrap();
    let db = populated(dir.path(), 20);

    let pruned = delete_from_range(&db, PREFIX, 5, 15).unwrap();
    assert_eq!(pruned, vec![5, 14]);
    assert!(db.has(&key(4)).unwrap());
    assert!(!db.has(&key(5)).unwrap());
    assert!(!db.has(&key(14)).unwrap());
    assert!(db.has(&key(15)).unwrap());
}

#[test]
fn delete_from_range_empty_when_nothing_matches() {
    let dir = tempfile::tempdir().unwrap();
    let db = populated(dir.path(), 3);
    let pruned = delete_from_range(&db, PREFIX, 10, 20).unwrap();
    assert!(pruned.is_empty());
}

#[test]
fn iterator_stays_within_prefix() {
    let dir = tempfile::tempdir().unwrap();
    let db = populated(dir.path(), 3);
    db.put(b"u\x00\x00\x00\x00\x00\x00\x00\x00", &[0xff]).unwrap();

    let mut it = db.new_iterator(PREFIX, &0u64.to_be_bytes());
    let mut seen = 0;
    while it.next() {
        assert!(it.key().starts_with(PREFIX));
        seen += 1;
    }
    assert!(it.error().is_none());
    it.release();
    assert_eq!(seen, 3);
}
