use std::{
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use parking_lot::RwLock;

/// A source of wall-clock time in milliseconds.
///
/// All expiry and refresh times in this crate are absolute millisecond
/// timestamps produced by a `Clock`. The default clock reads the system
/// time. A mocked clock can be installed through the builder for tests
/// that need to control the passage of time.
#[derive(Clone, Default)]
pub struct Clock {
    ty: ClockType,
}

#[derive(Clone)]
enum ClockType {
    /// A clock backed by `std::time::SystemTime`.
    System,
    /// A clock driven manually through a [`MockClock`] handle.
    Mocked { mock: Arc<MockClock> },
}

impl Default for ClockType {
    fn default() -> Self {
        ClockType::System
    }
}

impl Clock {
    /// Creates a `Clock` driven by a [`MockClock`] handle. Time starts at
    /// an arbitrary positive origin and only advances via
    /// [`MockClock::advance`].
    pub fn mock() -> (Clock, Arc<MockClock>) {
        let mock = Arc::new(MockClock::default());
        let clock = Clock {
            ty: ClockType::Mocked {
                mock: Arc::clone(&mock),
            },
        };
        (clock, mock)
    }

    /// Returns the current time in milliseconds.
    pub fn millis(&self) -> i64 {
        match &self.ty {
            ClockType::System => {
                let elapsed = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or(Duration::ZERO);
                elapsed.as_millis() as i64
            }
            ClockType::Mocked { mock } => mock.now(),
        }
    }

    /// Blocks the calling thread for the given number of milliseconds.
    /// A mocked clock does not sleep; it advances its own time instead.
    pub fn sleep(&self, millis: u64) {
        match &self.ty {
            ClockType::System => std::thread::sleep(Duration::from_millis(millis)),
            ClockType::Mocked { mock } => mock.advance(millis),
        }
    }
}

/// Handle to drive a mocked [`Clock`].
pub struct MockClock {
    now: RwLock<i64>,
}

// The origin is well above the reserved sentinel range of entry timestamps,
// so mocked time can never be mistaken for a lifecycle sentinel.
const MOCK_ORIGIN_MILLIS: i64 = 1_000_000;

impl Default for MockClock {
    fn default() -> Self {
        Self {
            now: RwLock::new(MOCK_ORIGIN_MILLIS),
        }
    }
}

impl MockClock {
    /// Moves the mocked time forward.
    pub fn advance(&self, millis: u64) {
        *self.now.write() += millis as i64;
    }

    /// The current mocked time in milliseconds.
    pub fn now(&self) -> i64 {
        *self.now.read()
    }
}

#[cfg(test)]
mod tests {
    use super::Clock;

    #[test]
    fn system_clock_is_monotonic_enough() {
        let clock = Clock::default();
        let t0 = clock.millis();
        let t1 = clock.millis();
        assert!(t1 >= t0);
        assert!(t0 > 0);
    }

    #[test]
    fn mocked_clock_advances_only_on_demand() {
        let (clock, mock) = Clock::mock();
        let t0 = clock.millis();
        assert_eq!(clock.millis(), t0);
        mock.advance(250);
        assert_eq!(clock.millis(), t0 + 250);
        clock.sleep(50);
        assert_eq!(clock.millis(), t0 + 300);
    }
}
