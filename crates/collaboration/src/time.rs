/// Wall-clock source for operation timestamps
///
/// Wall-clock time is only a tie-break and recency heuristic; causal
/// truth lives in the vector clock. Abstracting it lets tests pin and
/// advance time deterministically.
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::fmt::Debug;

pub trait TimeSource: Send + Sync + Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// Production time source backed by the system clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven time source for tests and simulations
#[derive(Debug)]
pub struct ManualTimeSource {
    now: Mutex<DateTime<Utc>>,
}

impl ManualTimeSource {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Start at the Unix epoch plus `millis`
    pub fn from_millis(millis: i64) -> Self {
        Self::new(DateTime::<Utc>::UNIX_EPOCH + Duration::milliseconds(millis))
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }

    pub fn advance_millis(&self, millis: i64) {
        self.advance(Duration::milliseconds(millis));
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock() = to;
    }
}

impl TimeSource for ManualTimeSource {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_time_holds_until_advanced() {
        let time = ManualTimeSource::from_millis(1_000);
        let t0 = time.now();
        assert_eq!(time.now(), t0);

        time.advance_millis(250);
        assert_eq!(time.now() - t0, Duration::milliseconds(250));
    }
}
