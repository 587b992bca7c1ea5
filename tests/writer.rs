use std::sync::{Arc, Mutex};

use siphon::{BoxError, Cache, CacheBuilder, CacheError, CacheWriter};

#[derive(Clone, Debug, PartialEq, Eq)]
enum WriteOp {
    Write(u32, u32),
    Delete(u32),
}

struct RecordingWriter {
    ops: Arc<Mutex<Vec<WriteOp>>>,
    fail: Arc<Mutex<bool>>,
}

impl CacheWriter<u32, u32> for RecordingWriter {
    fn write(&self, key: &u32, value: &u32) -> Result<(), BoxError> {
        if *self.fail.lock().unwrap() {
            return Err("store unavailable".into());
        }
        self.ops.lock().unwrap().push(WriteOp::Write(*key, *value));
        Ok(())
    }

    fn delete(&self, key: &u32) -> Result<(), BoxError> {
        if *self.fail.lock().unwrap() {
            return Err("store unavailable".into());
        }
        self.ops.lock().unwrap().push(WriteOp::Delete(*key));
        Ok(())
    }
}

fn writer_cache() -> (Cache<u32, u32>, Arc<Mutex<Vec<WriteOp>>>, Arc<Mutex<bool>>) {
    let ops = Arc::new(Mutex::new(Vec::new()));
    let fail = Arc::new(Mutex::new(false));
    let cache = CacheBuilder::new()
        .name("writer-test")
        .writer(RecordingWriter {
            ops: Arc::clone(&ops),
            fail: Arc::clone(&fail),
        })
        .build();
    (cache, ops, fail)
}

#[test]
fn mutations_are_written_through() {
    let (cache, ops, _) = writer_cache();
    cache.put(1, 10).unwrap();
    cache.put(1, 11).unwrap();
    cache.remove(&1).unwrap();
    assert_eq!(
        *ops.lock().unwrap(),
        vec![
            WriteOp::Write(1, 10),
            WriteOp::Write(1, 11),
            WriteOp::Delete(1),
        ]
    );
}

#[test]
fn removing_an_absent_entry_skips_the_writer() {
    let (cache, ops, _) = writer_cache();
    cache.remove(&5).unwrap();
    assert!(ops.lock().unwrap().is_empty());
}

#[test]
fn a_writer_failure_aborts_the_mutation() {
    let (cache, ops, fail) = writer_cache();
    cache.put(1, 10).unwrap();
    *fail.lock().unwrap() = true;

    assert!(matches!(cache.put(1, 11), Err(CacheError::Writer { .. })));
    // The entry is unchanged.
    assert_eq!(cache.peek(&1).unwrap(), Some(10));

    assert!(matches!(cache.remove(&1), Err(CacheError::Writer { .. })));
    assert_eq!(cache.peek(&1).unwrap(), Some(10));

    *fail.lock().unwrap() = false;
    cache.put(1, 12).unwrap();
    assert_eq!(cache.peek(&1).unwrap(), Some(12));
    assert_eq!(ops.lock().unwrap().len(), 2);
}

#[test]
fn processor_mutations_go_through_the_writer() {
    let (cache, ops, _) = writer_cache();
    cache
        .invoke(&1, |e| {
            e.set_value(42);
            Ok(())
        })
        .unwrap();
    assert_eq!(*ops.lock().unwrap(), vec![WriteOp::Write(1, 42)]);
}

#[test]
fn loads_are_not_written_back() {
    let ops = Arc::new(Mutex::new(Vec::new()));
    let cache: Cache<u32, u32> = CacheBuilder::new()
        .loader_fn(|key: &u32| Ok(*key))
        .writer(RecordingWriter {
            ops: Arc::clone(&ops),
            fail: Arc::new(Mutex::new(false)),
        })
        .build();
    assert_eq!(cache.get(&1).unwrap(), Some(1));
    assert!(ops.lock().unwrap().is_empty());
}
