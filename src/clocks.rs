use crate::abi::Clockid;
use crate::error::{Error, WasiResult};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Per-process clock state. Created once when the process is assembled and
/// shared by every thread's syscall service; the cputime clocks measure
/// from `start`.
pub struct Clocks {
    start: Instant,
}

impl Clocks {
    pub fn new() -> Clocks {
        Clocks {
            start: Instant::now(),
        }
    }

    /// Current value of the clock, in nanoseconds.
    pub fn now(&self, id: Clockid) -> WasiResult<u64> {
        match id {
            Clockid::Realtime => {
                let since_epoch = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map_err(|_| Error::inval())?;
                Ok(u64::try_from(since_epoch.as_nanos())?)
            }
            Clockid::Monotonic => Ok(u64::try_from(self.start.elapsed().as_nanos())?),
            // Wall time since process start stands in for consumed cpu
            // time; the host has no per-thread accounting.
            Clockid::ProcessCputimeId | Clockid::ThreadCputimeId => {
                Ok(u64::try_from(self.start.elapsed().as_nanos())?)
            }
        }
    }

    /// Clock resolution in nanoseconds.
    pub fn resolution(&self, id: Clockid) -> WasiResult<u64> {
        match id {
            Clockid::Realtime | Clockid::Monotonic => Ok(1),
            Clockid::ProcessCputimeId | Clockid::ThreadCputimeId => Ok(1),
        }
    }

    /// Nanoseconds until `deadline` on the monotonic clock; zero if it has
    /// already passed.
    pub fn until_monotonic(&self, deadline: u64) -> WasiResult<u64> {
        let now = self.now(Clockid::Monotonic)?;
        Ok(deadline.saturating_sub(now))
    }
}

impl Default for Clocks {
    fn default() -> Clocks {
        Clocks::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn monotonic_advances() {
        let clocks = Clocks::new();
        let a = clocks.now(Clockid::Monotonic).unwrap();
        let b = clocks.now(Clockid::Monotonic).unwrap();
        assert!(b >= a);
    }

    #[test]
    fn realtime_is_after_2020() {
        let clocks = Clocks::new();
        let now = clocks.now(Clockid::Realtime).unwrap();
        // 2020-01-01 in nanoseconds since the epoch.
        assert!(now > 1_577_836_800_000_000_000);
    }

    #[test]
    fn until_monotonic_saturates() {
        let clocks = Clocks::new();
        assert_eq!(clocks.until_monotonic(0).unwrap(), 0);
        let far = clocks.now(Clockid::Monotonic).unwrap() + 1_000_000_000;
        assert!(clocks.until_monotonic(far).unwrap() > 0);
    }
}
