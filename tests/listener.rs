use std::{
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use siphon::{expiry_values, Cache, CacheBuilder, CacheError, Executor};

#[derive(Clone, Debug, PartialEq, Eq)]
enum Event {
    Created(u32, u32),
    Updated(u32, u32, u32),
    Removed(u32, u32),
    Expired(u32, u32),
}

type Log = Arc<Mutex<Vec<Event>>>;

fn listening_cache(log: &Log) -> Cache<u32, u32> {
    let created = Arc::clone(log);
    let updated = Arc::clone(log);
    let removed = Arc::clone(log);
    let expired = Arc::clone(log);
    CacheBuilder::new()
        .name("listener-test")
        .on_entry_created(Arc::new(move |e| {
            created
                .lock()
                .unwrap()
                .push(Event::Created(*e.key(), e.value().unwrap().copied().unwrap()));
        }))
        .on_entry_updated(Arc::new(move |old, new| {
            updated.lock().unwrap().push(Event::Updated(
                *new.key(),
                old.value().unwrap().copied().unwrap(),
                new.value().unwrap().copied().unwrap(),
            ));
        }))
        .on_entry_removed(Arc::new(move |e| {
            removed
                .lock()
                .unwrap()
                .push(Event::Removed(*e.key(), e.value().unwrap().copied().unwrap()));
        }))
        .on_entry_expired(Arc::new(move |e| {
            expired
                .lock()
                .unwrap()
                .push(Event::Expired(*e.key(), e.value().unwrap().copied().unwrap()));
        }))
        .build()
}

#[test]
fn lifecycle_events_fire_in_order() {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let cache = listening_cache(&log);

    cache.put(1, 10).unwrap();
    cache.put(1, 11).unwrap();
    cache.remove(&1).unwrap();
    // Removing an absent entry fires nothing.
    cache.remove(&1).unwrap();

    assert_eq!(
        *log.lock().unwrap(),
        vec![
            Event::Created(1, 10),
            Event::Updated(1, 10, 11),
            Event::Removed(1, 11),
        ]
    );
}

#[test]
fn expiry_fires_the_expired_listener() {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let cache = listening_cache(&log);
    cache.put(2, 20).unwrap();
    log.lock().unwrap().clear();
    cache.expire_at(&2, expiry_values::NOW).unwrap();
    assert_eq!(*log.lock().unwrap(), vec![Event::Expired(2, 20)]);
    assert_eq!(cache.len(), 0);
}

#[test]
fn a_loader_triggers_created_events() {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let events = Arc::clone(&log);
    let cache: Cache<u32, u32> = CacheBuilder::new()
        .loader_fn(|key: &u32| Ok(key + 1))
        .on_entry_created(Arc::new(move |e| {
            events
                .lock()
                .unwrap()
                .push(Event::Created(*e.key(), e.value().unwrap().copied().unwrap()));
        }))
        .build();
    assert_eq!(cache.get(&1).unwrap(), Some(2));
    assert_eq!(*log.lock().unwrap(), vec![Event::Created(1, 2)]);
}

#[test]
fn async_listeners_receive_their_own_event_copy() {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let events = Arc::clone(&log);
    let cache: Cache<u32, u32> = CacheBuilder::new()
        .on_entry_created_async(Arc::new(move |e| {
            events
                .lock()
                .unwrap()
                .push(Event::Created(*e.key(), e.value().unwrap().copied().unwrap()));
        }))
        .build();
    cache.put(1, 10).unwrap();
    // The mutation returned already; the event arrives on the listener
    // executor.
    let deadline = Instant::now() + Duration::from_secs(2);
    while log.lock().unwrap().is_empty() {
        assert!(Instant::now() < deadline, "async listener never fired");
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(*log.lock().unwrap(), vec![Event::Created(1, 10)]);
}

#[test]
fn a_panicking_listener_surfaces_but_the_mutation_sticks() {
    let cache: Cache<u32, u32> = CacheBuilder::new()
        .on_entry_created(Arc::new(|_| panic!("listener exploded")))
        .build();
    match cache.put(1, 10) {
        Err(CacheError::Listener { detail, .. }) => {
            assert_eq!(detail, "listener exploded");
        }
        other => panic!("unexpected: {other:?}"),
    }
    // The value was published before the listener ran.
    assert_eq!(cache.get(&1).unwrap(), Some(10));
}

#[test]
fn all_listeners_run_despite_an_earlier_failure() {
    let seen: Log = Arc::new(Mutex::new(Vec::new()));
    let events = Arc::clone(&seen);
    let cache: Cache<u32, u32> = CacheBuilder::new()
        .on_entry_created(Arc::new(|_| panic!("first")))
        .on_entry_created(Arc::new(move |e| {
            events
                .lock()
                .unwrap()
                .push(Event::Created(*e.key(), e.value().unwrap().copied().unwrap()));
        }))
        .build();
    assert!(matches!(
        cache.put(1, 10),
        Err(CacheError::Listener { .. })
    ));
    assert_eq!(*seen.lock().unwrap(), vec![Event::Created(1, 10)]);
}

#[test]
fn a_custom_listener_executor_is_used() {
    let dispatched = Arc::new(Mutex::new(0u32));
    let executor = {
        let dispatched = Arc::clone(&dispatched);
        Executor::custom(move |job| {
            *dispatched.lock().unwrap() += 1;
            job();
        })
    };
    let fired: Log = Arc::new(Mutex::new(Vec::new()));
    let events = Arc::clone(&fired);
    let cache: Cache<u32, u32> = CacheBuilder::new()
        .listener_executor(executor)
        .on_entry_created_async(Arc::new(move |e| {
            events
                .lock()
                .unwrap()
                .push(Event::Created(*e.key(), e.value().unwrap().copied().unwrap()));
        }))
        .build();
    cache.put(1, 10).unwrap();
    assert_eq!(*dispatched.lock().unwrap(), 1);
    assert_eq!(*fired.lock().unwrap(), vec![Event::Created(1, 10)]);
}
