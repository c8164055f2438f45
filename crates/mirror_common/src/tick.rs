use std::ops::{Add, AddAssign, Neg, Sub, SubAssign};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// Monotonic time in microseconds. All deadlines in the pipeline are
/// expressed with this type, device PTS values convert into it 1:1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Tick(pub i64);

fn epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

impl Tick {
    pub const ZERO: Tick = Tick(0);

    /// Current monotonic time. The origin is the first call in the process.
    pub fn now() -> Tick {
        // Instant is monotonic on every supported platform
        Tick(epoch().elapsed().as_micros() as i64)
    }

    pub const fn from_micros(us: i64) -> Tick {
        Tick(us)
    }

    pub const fn from_millis(ms: i64) -> Tick {
        Tick(ms * 1_000)
    }

    pub const fn from_secs(sec: i64) -> Tick {
        Tick(sec * 1_000_000)
    }

    pub const fn as_micros(self) -> i64 {
        self.0
    }

    pub const fn as_millis(self) -> i64 {
        self.0 / 1_000
    }

    /// Time left until `self`, as a Duration suitable for a condvar wait.
    /// Returns `None` when the deadline is already reached.
    pub fn time_until(self) -> Option<Duration> {
        let diff = self.0 - Tick::now().0;
        if diff <= 0 {
            return None;
        }

        Some(Duration::from_micros(diff as u64))
    }
}

impl Add for Tick {
    type Output = Tick;

    fn add(self, rhs: Tick) -> Tick {
        Tick(self.0 + rhs.0)
    }
}

impl Sub for Tick {
    type Output = Tick;

    fn sub(self, rhs: Tick) -> Tick {
        Tick(self.0 - rhs.0)
    }
}

impl AddAssign for Tick {
    fn add_assign(&mut self, rhs: Tick) {
        self.0 += rhs.0;
    }
}

impl SubAssign for Tick {
    fn sub_assign(&mut self, rhs: Tick) {
        self.0 -= rhs.0;
    }
}

impl Neg for Tick {
    type Output = Tick;

    fn neg(self) -> Tick {
        Tick(-self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_arithmetic() {
        let a = Tick::from_millis(3);
        let b = Tick::from_micros(500);

        assert_eq!(a + b, Tick::from_micros(3_500));
        assert_eq!(a - b, Tick::from_micros(2_500));
        assert_eq!(Tick::from_secs(2).as_millis(), 2_000);
    }

    #[test]
    fn test_tick_now_is_monotonic() {
        let a = Tick::now();
        let b = Tick::now();
        assert!(b >= a);
    }

    #[test]
    fn test_time_until_past_deadline() {
        let past = Tick::now() - Tick::from_secs(1);
        assert!(past.time_until().is_none());
    }
}
