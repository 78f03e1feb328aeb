use core::fmt;
use core::ops::{Add, Sub};
use core::time::Duration;

pub const MICROS_PER_SEC: u32 = 1_000_000;

/// Kernel time representation: seconds plus microseconds since boot, with
/// the microsecond part always normalized below one million.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct TimePoint {
    secs: u64,
    micros: u32,
}

impl TimePoint {
    pub const ZERO: TimePoint = TimePoint { secs: 0, micros: 0 };

    pub const fn new(secs: u64, micros: u32) -> TimePoint {
        TimePoint {
            secs: secs + (micros / MICROS_PER_SEC) as u64,
            micros: micros % MICROS_PER_SEC,
        }
    }

    pub const fn from_micros(micros: u64) -> TimePoint {
        TimePoint {
            secs: micros / MICROS_PER_SEC as u64,
            micros: (micros % MICROS_PER_SEC as u64) as u32,
        }
    }

    pub const fn secs(self) -> u64 {
        self.secs
    }

    pub const fn subsec_micros(self) -> u32 {
        self.micros
    }

    pub const fn as_micros(self) -> u64 {
        self.secs * MICROS_PER_SEC as u64 + self.micros as u64
    }

    /// Time elapsed from `earlier` to `self`, clamped to zero if `earlier`
    /// is in the future.
    pub fn saturating_since(self, earlier: TimePoint) -> Duration {
        if self <= earlier {
            return Duration::ZERO;
        }
        Duration::from_micros(self.as_micros() - earlier.as_micros())
    }
}

impl Add<Duration> for TimePoint {
    type Output = TimePoint;

    fn add(self, rhs: Duration) -> TimePoint {
        let micros = self.micros + rhs.subsec_micros();
        TimePoint {
            secs: self.secs + rhs.as_secs() + (micros / MICROS_PER_SEC) as u64,
            micros: micros % MICROS_PER_SEC,
        }
    }
}

impl Sub<TimePoint> for TimePoint {
    type Output = Duration;

    fn sub(self, rhs: TimePoint) -> Duration {
        self.saturating_since(rhs)
    }
}

impl fmt::Display for TimePoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:06}s", self.secs, self.micros)
    }
}

#[cfg(test)]
mod test {
    use super::TimePoint;
    use core::time::Duration;

    #[test]
    fn normalizes_micros() {
        let t = TimePoint::new(1, 2_500_000);
        assert_eq!(t.secs(), 3);
        assert_eq!(t.subsec_micros(), 500_000);
    }

    #[test]
    fn add_duration_carries() {
        let t = TimePoint::new(1, 900_000) + Duration::from_micros(200_000);
        assert_eq!(t, TimePoint::new(2, 100_000));
    }

    #[test]
    fn difference_saturates() {
        let early = TimePoint::new(1, 0);
        let late = TimePoint::new(2, 250_000);
        assert_eq!(late - early, Duration::from_micros(1_250_000));
        assert_eq!(early - late, Duration::ZERO);
    }

    #[test]
    fn ordering_is_lexicographic() {
        assert!(TimePoint::new(1, 999_999) < TimePoint::new(2, 0));
        assert!(TimePoint::new(2, 1) > TimePoint::new(2, 0));
    }
}
