use std::{
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use siphon::{expiry_values, Cache, CacheBuilder, CacheEntry, Clock};

fn wait_for(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(3);
    while !check() {
        assert!(Instant::now() < deadline, "timeout waiting for {what}");
        thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn entries_expire_after_the_write_ttl() {
    let (clock, mock) = Clock::mock();
    let cache: Cache<u32, u32> = CacheBuilder::new()
        .expire_after_write(Duration::from_millis(100))
        .clock(clock)
        .build();
    cache.put(1, 1).unwrap();
    mock.advance(99);
    assert_eq!(cache.get(&1).unwrap(), Some(1));
    assert!(cache.contains_key(&1).unwrap());
    mock.advance(1);
    assert_eq!(cache.get(&1).unwrap(), None);
    assert!(!cache.contains_key(&1).unwrap());
    assert_eq!(cache.peek(&1).unwrap(), None);
}

#[test]
fn an_update_restarts_the_ttl() {
    let (clock, mock) = Clock::mock();
    let cache: Cache<u32, u32> = CacheBuilder::new()
        .expire_after_write(Duration::from_millis(100))
        .clock(clock)
        .build();
    cache.put(1, 1).unwrap();
    mock.advance(80);
    cache.put(1, 2).unwrap();
    mock.advance(80);
    assert_eq!(cache.get(&1).unwrap(), Some(2));
}

#[test]
fn expired_entries_are_reloaded() {
    let (clock, mock) = Clock::mock();
    let generation = Arc::new(AtomicU32::new(0));
    let cache: Cache<u32, u32> = {
        let generation = Arc::clone(&generation);
        CacheBuilder::new()
            .expire_after_write(Duration::from_millis(100))
            .clock(clock)
            .loader_fn(move |_: &u32| Ok(generation.fetch_add(1, Ordering::SeqCst)))
            .build()
    };
    assert_eq!(cache.get(&1).unwrap(), Some(0));
    mock.advance(150);
    assert_eq!(cache.get(&1).unwrap(), Some(1));
    let stats = cache.statistics().unwrap();
    assert_eq!(stats.load_count(), 1);
    assert_eq!(stats.reload_count(), 1);
}

#[test]
fn a_dynamic_policy_controls_expiry_per_entry() {
    let (clock, mock) = Clock::mock();
    let cache: Cache<u32, u32> = CacheBuilder::new()
        .expiry_policy(
            |key: &u32, _: Option<&u32>, load_time: i64, _: Option<&CacheEntry<u32, u32>>| {
                if *key == 1 {
                    load_time + 50
                } else {
                    expiry_values::ETERNAL
                }
            },
        )
        .clock(clock)
        .build();
    cache.put(1, 1).unwrap();
    cache.put(2, 2).unwrap();
    mock.advance(60);
    assert_eq!(cache.peek(&1).unwrap(), None);
    assert_eq!(cache.peek(&2).unwrap(), Some(2));
}

#[test]
fn no_cache_policy_result_drops_the_value() {
    let cache: Cache<u32, u32> = CacheBuilder::new()
        .expiry_policy(
            |_: &u32, _: Option<&u32>, _: i64, _: Option<&CacheEntry<u32, u32>>| {
                expiry_values::NO_CACHE
            },
        )
        .build();
    cache.put(1, 1).unwrap();
    assert_eq!(cache.peek(&1).unwrap(), None);
    assert_eq!(cache.len(), 0);
}

#[test]
fn sharp_expiry_cuts_off_at_the_exact_time() {
    let (clock, mock) = Clock::mock();
    let now = mock.now();
    let cutoff = now + 5_000;
    let cache: Cache<u32, u32> = CacheBuilder::new()
        .expiry_policy(
            move |_: &u32, _: Option<&u32>, _: i64, _: Option<&CacheEntry<u32, u32>>| -cutoff,
        )
        .clock(clock)
        .build();
    cache.put(1, 1).unwrap();
    mock.advance(4_999);
    assert_eq!(cache.peek(&1).unwrap(), Some(1));
    mock.advance(1);
    assert_eq!(cache.peek(&1).unwrap(), None);
    assert!(!cache.contains_key(&1).unwrap());
}

#[test]
fn expire_at_now_removes_the_entry() {
    let cache: Cache<u32, u32> = CacheBuilder::new().build();
    cache.put(1, 1).unwrap();
    cache.expire_at(&1, expiry_values::NOW).unwrap();
    assert_eq!(cache.peek(&1).unwrap(), None);
    assert_eq!(cache.len(), 0);
    // Expiring an absent entry is a no-op.
    cache.expire_at(&1, expiry_values::NOW).unwrap();
}

#[test]
fn expire_at_a_future_time() {
    let (clock, mock) = Clock::mock();
    let now = mock.now();
    let cache: Cache<u32, u32> = CacheBuilder::new().clock(clock).build();
    cache.put(1, 1).unwrap();
    cache.expire_at(&1, now + 100).unwrap();
    mock.advance(99);
    assert_eq!(cache.peek(&1).unwrap(), Some(1));
    mock.advance(1);
    assert_eq!(cache.peek(&1).unwrap(), None);
}

#[test]
fn expire_at_eternal_pins_the_entry() {
    let (clock, mock) = Clock::mock();
    let cache: Cache<u32, u32> = CacheBuilder::new()
        .expire_after_write(Duration::from_millis(50))
        .clock(clock)
        .build();
    cache.put(1, 1).unwrap();
    cache.expire_at(&1, expiry_values::ETERNAL).unwrap();
    mock.advance(10_000);
    assert_eq!(cache.peek(&1).unwrap(), Some(1));
}

#[test]
fn expired_data_can_be_kept() {
    let (clock, mock) = Clock::mock();
    let cache: Cache<u32, u32> = CacheBuilder::new()
        .expire_after_write(Duration::from_millis(50))
        .keep_data_after_expired(true)
        .clock(clock)
        .build();
    cache.put(1, 1).unwrap();
    cache.expire_at(&1, expiry_values::NOW).unwrap();
    // The entry object stays, served as not-fresh.
    assert_eq!(cache.len(), 1);
    assert!(!cache.contains_key(&1).unwrap());
    assert_eq!(cache.peek(&1).unwrap(), None);
    assert!(cache.statistics().unwrap().expired_kept_count() >= 1);
    let _ = mock;
}

#[test]
fn refresh_ahead_reloads_in_the_background() {
    let generation = Arc::new(AtomicU32::new(0));
    let cache: Cache<u32, u32> = {
        let generation = Arc::clone(&generation);
        CacheBuilder::new()
            .expire_after_write(Duration::from_millis(60))
            .refresh_ahead(true)
            .loader_fn(move |_: &u32| Ok(generation.fetch_add(1, Ordering::SeqCst)))
            .build()
    };
    assert_eq!(cache.get(&1).unwrap(), Some(0));

    // The refresh timer reloads the entry without any access.
    wait_for("background refresh", || {
        generation.load(Ordering::SeqCst) >= 2
    });

    // A read after the refresh serves a refreshed value without error.
    let value = cache.get(&1).unwrap();
    assert!(value.is_some());
    assert!(value.unwrap() >= 1);

    let stats = cache.statistics().unwrap();
    assert!(stats.refresh_count() >= 1, "stats: {stats:?}");
}

#[test]
fn probation_access_revives_the_refreshed_entry() {
    let generation = Arc::new(AtomicU32::new(0));
    let cache: Cache<u32, u32> = {
        let generation = Arc::clone(&generation);
        CacheBuilder::new()
            .expire_after_write(Duration::from_millis(60))
            .refresh_ahead(true)
            .loader_fn(move |_: &u32| Ok(generation.fetch_add(1, Ordering::SeqCst)))
            .build()
    };
    assert_eq!(cache.get(&1).unwrap(), Some(0));
    wait_for("first refresh", || generation.load(Ordering::SeqCst) >= 2);
    // An access inside the probation window revives the refreshed entry
    // without a loader call and counts a refreshed hit.
    wait_for("refreshed hit", || {
        let value = cache.get(&1).unwrap();
        assert!(value.is_some());
        cache.statistics().unwrap().refreshed_hit_count() >= 1
    });
}

#[test]
fn timer_events_are_counted_with_expiry_listeners() {
    let cache: Cache<u32, u32> = CacheBuilder::new()
        .expire_after_write(Duration::from_millis(40))
        .on_entry_expired(Arc::new(|_| {}))
        .build();
    cache.put(1, 1).unwrap();
    wait_for("expiry timer", || {
        cache.statistics().unwrap().timer_event_count() >= 1
    });
    wait_for("entry removal", || cache.len() == 0);
}
