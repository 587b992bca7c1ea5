use crossbeam_utils::{atomic::AtomicCell, CachePadded};

pub(crate) fn saturating_add(counter: &AtomicCell<u64>, value: u64) {
    let mut v0 = counter.load();
    loop {
        let v1 = v0.saturating_add(value);
        match counter.compare_exchange(v0, v1) {
            Ok(_) => break,
            Err(v2) => v0 = v2,
        }
    }
}

/// Operation counters of one cache. The counters are dirty: increments may
/// race and a small undercount is acceptable. Externally reported snapshots
/// are taken under the global structure lock.
///
/// All counting is compiled down to no-ops when statistics are disabled for
/// the cache.
pub(crate) struct Metrics {
    cells: Option<Box<Cells>>,
}

#[derive(Default)]
struct Cells {
    hit: CachePadded<AtomicCell<u64>>,
    miss: CachePadded<AtomicCell<u64>>,
    load: CachePadded<AtomicCell<u64>>,
    reload: CachePadded<AtomicCell<u64>>,
    refresh: CachePadded<AtomicCell<u64>>,
    load_millis: CachePadded<AtomicCell<u64>>,
    load_exception: CachePadded<AtomicCell<u64>>,
    suppressed_exception: CachePadded<AtomicCell<u64>>,
    put_new_entry: CachePadded<AtomicCell<u64>>,
    put_hit: CachePadded<AtomicCell<u64>>,
    remove: CachePadded<AtomicCell<u64>>,
    expired_kept: CachePadded<AtomicCell<u64>>,
    refreshed_hit: CachePadded<AtomicCell<u64>>,
    timer_event: CachePadded<AtomicCell<u64>>,
    gone_spin: CachePadded<AtomicCell<u64>>,
}

macro_rules! count {
    ($name:ident) => {
        #[inline]
        pub(crate) fn $name(&self) {
            if let Some(cells) = &self.cells {
                saturating_add(&cells.$name, 1);
            }
        }
    };
}

impl Metrics {
    pub(crate) fn new(enabled: bool) -> Self {
        Self {
            cells: enabled.then(|| Box::new(Cells::default())),
        }
    }

    pub(crate) fn is_disabled(&self) -> bool {
        self.cells.is_none()
    }

    count!(hit);
    count!(miss);
    count!(load_exception);
    count!(suppressed_exception);
    count!(put_new_entry);
    count!(put_hit);
    count!(remove);
    count!(expired_kept);
    count!(refreshed_hit);
    count!(timer_event);
    count!(gone_spin);

    pub(crate) fn load(&self, millis: u64) {
        if let Some(cells) = &self.cells {
            saturating_add(&cells.load, 1);
            saturating_add(&cells.load_millis, millis);
        }
    }

    pub(crate) fn reload(&self, millis: u64) {
        if let Some(cells) = &self.cells {
            saturating_add(&cells.reload, 1);
            saturating_add(&cells.load_millis, millis);
        }
    }

    pub(crate) fn refresh(&self, millis: u64) {
        if let Some(cells) = &self.cells {
            saturating_add(&cells.refresh, 1);
            saturating_add(&cells.load_millis, millis);
        }
    }

    pub(crate) fn snapshot(&self) -> MetricsSnapshot {
        match &self.cells {
            None => MetricsSnapshot::default(),
            Some(cells) => MetricsSnapshot {
                hit_count: cells.hit.load(),
                miss_count: cells.miss.load(),
                load_count: cells.load.load(),
                reload_count: cells.reload.load(),
                refresh_count: cells.refresh.load(),
                load_millis: cells.load_millis.load(),
                load_exception_count: cells.load_exception.load(),
                suppressed_exception_count: cells.suppressed_exception.load(),
                put_count: cells.put_new_entry.load() + cells.put_hit.load(),
                remove_count: cells.remove.load(),
                expired_kept_count: cells.expired_kept.load(),
                refreshed_hit_count: cells.refreshed_hit.load(),
                timer_event_count: cells.timer_event.load(),
                gone_spin_count: cells.gone_spin.load(),
            },
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct MetricsSnapshot {
    pub hit_count: u64,
    pub miss_count: u64,
    pub load_count: u64,
    pub reload_count: u64,
    pub refresh_count: u64,
    pub load_millis: u64,
    pub load_exception_count: u64,
    pub suppressed_exception_count: u64,
    pub put_count: u64,
    pub remove_count: u64,
    pub expired_kept_count: u64,
    pub refreshed_hit_count: u64,
    pub timer_event_count: u64,
    pub gone_spin_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_metrics_count_nothing() {
        let m = Metrics::new(false);
        assert!(m.is_disabled());
        m.hit();
        m.load(5);
        assert_eq!(m.snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn counters_accumulate() {
        let m = Metrics::new(true);
        m.hit();
        m.hit();
        m.miss();
        m.load(3);
        m.reload(4);
        m.refresh(5);
        m.put_new_entry();
        m.put_hit();
        let s = m.snapshot();
        assert_eq!(s.hit_count, 2);
        assert_eq!(s.miss_count, 1);
        assert_eq!(s.load_count, 1);
        assert_eq!(s.reload_count, 1);
        assert_eq!(s.refresh_count, 1);
        assert_eq!(s.load_millis, 12);
        assert_eq!(s.put_count, 2);
    }

    #[test]
    fn saturating_add_stops_at_max() {
        let cell = AtomicCell::new(u64::MAX - 1);
        saturating_add(&cell, 5);
        assert_eq!(cell.load(), u64::MAX);
    }
}
