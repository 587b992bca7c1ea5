use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Barrier,
    },
    thread,
};

use siphon::{Cache, CacheBuilder, CacheError};

fn cache() -> Cache<u32, u32> {
    CacheBuilder::new().name("processor-test").build()
}

#[test]
fn processor_reads_and_writes_atomically() {
    let cache = cache();
    cache.put(1, 1).unwrap();
    let previous = cache
        .invoke(&1, |e| {
            let v = e.value()?.unwrap();
            e.set_value(v + 1);
            Ok(v)
        })
        .unwrap();
    assert_eq!(previous, 1);
    assert_eq!(cache.get(&1).unwrap(), Some(2));
}

#[test]
fn concurrent_increments_lose_no_update() {
    // 10 threads, 100 increments each: the counter must land exactly on
    // 1_001.
    let cache = Arc::new(cache());
    cache.put(7, 1).unwrap();
    let barrier = Arc::new(Barrier::new(10));
    let handles: Vec<_> = (0..10)
        .map(|_| {
            let cache = Arc::clone(&cache);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for _ in 0..100 {
                    cache
                        .invoke(&7, |e| {
                            let v = e.value()?.unwrap();
                            e.set_value(v + 1);
                            Ok(())
                        })
                        .unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(cache.get(&7).unwrap(), Some(1_001));
}

#[test]
fn processor_observes_absence_and_can_insert() {
    let cache = cache();
    let existed = cache
        .invoke(&1, |e| {
            let existed = e.exists();
            e.set_value(5);
            Ok(existed)
        })
        .unwrap();
    assert!(!existed);
    assert_eq!(cache.get(&1).unwrap(), Some(5));
}

#[test]
fn processor_can_remove() {
    let cache = cache();
    cache.put(1, 1).unwrap();
    cache
        .invoke(&1, |e| {
            e.remove();
            Ok(())
        })
        .unwrap();
    assert!(!cache.contains_key(&1).unwrap());
}

#[test]
fn processor_without_mutation_changes_nothing() {
    let cache = cache();
    cache.put(1, 10).unwrap();
    let value = cache.invoke(&1, |e| Ok(e.value()?.unwrap())).unwrap();
    assert_eq!(value, 10);
    assert_eq!(cache.get(&1).unwrap(), Some(10));
}

#[test]
fn processor_errors_are_wrapped_per_key() {
    let cache = cache();
    let err = cache
        .invoke(&1, |_| Err::<(), _>("processor broke".into()))
        .unwrap_err();
    match err {
        CacheError::Processor { key, .. } => assert_eq!(key, "1"),
        other => panic!("unexpected: {other:?}"),
    }
    // A failing processor leaves no trace.
    assert!(!cache.contains_key(&1).unwrap());
}

#[test]
fn processor_exception_is_served_to_readers() {
    let cache = cache();
    cache.put(1, 1).unwrap();
    cache
        .invoke(&1, |e| {
            e.set_exception("poisoned".into());
            e.set_expiry_time(siphon::expiry_values::ETERNAL);
            Ok(())
        })
        .unwrap();
    let err = cache.get(&1).unwrap_err();
    assert!(matches!(err, CacheError::Loader { .. }));
    assert!(err.to_string().contains("poisoned"));
    assert_eq!(cache.peek(&1).unwrap(), None);
    assert!(cache.contains_key(&1).unwrap());
}

#[test]
fn processor_controls_the_expiry_time() {
    let cache = cache();
    cache.put(1, 1).unwrap();
    cache
        .invoke(&1, |e| {
            e.set_expiry_time(siphon::expiry_values::NO_CACHE);
            Ok(())
        })
        .unwrap();
    assert!(!cache.contains_key(&1).unwrap());
}

#[test]
fn read_through_processor_loads_and_restarts() {
    let loads = Arc::new(AtomicUsize::new(0));
    let cache: Cache<u32, u32> = {
        let loads = Arc::clone(&loads);
        CacheBuilder::new()
            .loader_fn(move |key: &u32| {
                loads.fetch_add(1, Ordering::SeqCst);
                Ok(key * 10)
            })
            .build()
    };
    let value = cache
        .invoke(&3, |e| {
            let v = e.value()?.unwrap();
            e.set_value(v + 1);
            Ok(v)
        })
        .unwrap();
    assert_eq!(value, 30);
    assert_eq!(loads.load(Ordering::SeqCst), 1);
    assert_eq!(cache.get(&3).unwrap(), Some(31));
}

#[test]
fn invoke_all_reports_results_per_key() {
    let cache = cache();
    cache.put(2, 2).unwrap();
    let results = cache.invoke_all(vec![1, 2], |e| {
        if e.exists() {
            Ok(e.value()?.unwrap())
        } else {
            Err("missing".into())
        }
    });
    assert_eq!(results.len(), 2);
    let (key1, r1) = &results[0];
    assert_eq!(*key1, 1);
    assert!(matches!(r1, Err(CacheError::Processor { .. })));
    let (key2, r2) = &results[1];
    assert_eq!(*key2, 2);
    assert_eq!(*r2.as_ref().unwrap(), 2);
}

#[test]
fn was_existing_reflects_the_state_before_the_processor() {
    let cache = cache();
    cache.put(1, 1).unwrap();
    cache
        .invoke(&1, |e| {
            assert!(e.was_existing());
            assert_eq!(e.old_value()?, Some(1));
            e.set_value(2);
            assert_eq!(e.old_value()?, Some(1));
            assert_eq!(e.value()?, Some(2));
            Ok(())
        })
        .unwrap();
}
