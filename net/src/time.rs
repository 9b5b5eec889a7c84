//! Local time and durations, with millisecond precision.
use std::time::{SystemTime, UNIX_EPOCH};

/// Local time, in milliseconds since Epoch.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Ord, PartialOrd, Default)]
pub struct LocalTime {
    millis: u128,
}

impl std::fmt::Display for LocalTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_secs())
    }
}

impl LocalTime {
    /// Construct a local time from the current system time.
    pub fn now() -> Self {
        Self::from(SystemTime::now())
    }

    /// Construct a local time from whole seconds since Epoch.
    pub const fn from_secs(secs: u64) -> Self {
        Self {
            millis: secs as u128 * 1000,
        }
    }

    /// Construct a local time from a block header timestamp.
    pub const fn from_block_time(time: u32) -> Self {
        Self::from_secs(time as u64)
    }

    /// Return the local time as whole seconds since Epoch.
    pub fn as_secs(&self) -> u64 {
        (self.millis / 1000) as u64
    }

    /// Elapse time by the given duration.
    pub fn elapse(&mut self, duration: LocalDuration) {
        self.millis += duration.as_millis()
    }
}

impl From<SystemTime> for LocalTime {
    fn from(system: SystemTime) -> Self {
        let millis = system
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();

        Self { millis }
    }
}

/// Subtract two local times. Yields a duration, saturating at zero.
impl std::ops::Sub<LocalTime> for LocalTime {
    type Output = LocalDuration;

    fn sub(self, other: LocalTime) -> LocalDuration {
        LocalDuration(self.millis.saturating_sub(other.millis))
    }
}

/// Add a duration to a local time. Yields a local time.
impl std::ops::Add<LocalDuration> for LocalTime {
    type Output = LocalTime;

    fn add(self, other: LocalDuration) -> LocalTime {
        LocalTime {
            millis: self.millis + other.0,
        }
    }
}

/// Time duration as measured locally.
#[derive(Debug, Copy, Clone, PartialOrd, Ord, PartialEq, Eq, Default)]
pub struct LocalDuration(u128);

impl LocalDuration {
    /// The time interval between blocks. The "block time".
    pub const BLOCK_INTERVAL: LocalDuration = Self::from_mins(10);

    /// Create a new duration from whole seconds.
    pub const fn from_secs(secs: u64) -> Self {
        Self(secs as u128 * 1000)
    }

    /// Create a new duration from whole minutes.
    pub const fn from_mins(mins: u64) -> Self {
        Self::from_secs(mins * 60)
    }

    /// Construct a new duration from milliseconds.
    pub const fn from_millis(millis: u128) -> Self {
        Self(millis)
    }

    /// Return the number of seconds in this duration.
    pub const fn as_secs(&self) -> u64 {
        (self.0 / 1000) as u64
    }

    /// Return the number of milliseconds in this duration.
    pub const fn as_millis(&self) -> u128 {
        self.0
    }
}

impl std::fmt::Display for LocalDuration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.as_millis() < 1000 {
            write!(f, "{} millisecond(s)", self.as_millis())
        } else {
            write!(f, "{} second(s)", self.as_secs())
        }
    }
}

impl From<LocalDuration> for std::time::Duration {
    fn from(other: LocalDuration) -> Self {
        std::time::Duration::from_millis(other.0 as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    #[quickcheck]
    fn prop_elapse(secs: u32, elapsed: u32) -> bool {
        let start = LocalTime::from_secs(secs as u64);
        let mut time = start;

        time.elapse(LocalDuration::from_secs(elapsed as u64));

        time - start == LocalDuration::from_secs(elapsed as u64)
            && time == start + LocalDuration::from_secs(elapsed as u64)
    }

    #[test]
    fn test_sub_saturates() {
        let earlier = LocalTime::from_secs(10);
        let later = LocalTime::from_secs(20);

        assert_eq!(earlier - later, LocalDuration::default());
        assert_eq!(later - earlier, LocalDuration::from_secs(10));
    }
}
