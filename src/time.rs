//! Microsecond-resolution timestamps, ordered the way the timer queue needs
//! them, with a `localtime_r`-based human-readable rendering for logging.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

pub const MICROS_PER_SECOND: i64 = 1_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp {
    micros_since_epoch: i64,
}

impl Timestamp {
    pub fn new(micros_since_epoch: i64) -> Timestamp {
        Timestamp {
            micros_since_epoch,
        }
    }

    pub fn now() -> Timestamp {
        let dur = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before unix epoch");
        Timestamp::new(dur.as_secs() as i64 * MICROS_PER_SECOND + dur.subsec_micros() as i64)
    }

    pub fn micros_since_epoch(self) -> i64 {
        self.micros_since_epoch
    }

    pub fn valid(self) -> bool {
        self.micros_since_epoch > 0
    }

    pub fn add_seconds(self, seconds: f64) -> Timestamp {
        let delta = (seconds * MICROS_PER_SECOND as f64) as i64;
        Timestamp::new(self.micros_since_epoch + delta)
    }

    /// `YYYY-MM-DD HH:MM:SS,ffffff` in local time, the exact format the
    /// original's `toLocalTime` produces for its log lines.
    pub fn to_local_time(self, with_micros: bool) -> String {
        let secs = self.micros_since_epoch.div_euclid(MICROS_PER_SECOND);
        let micros = self.micros_since_epoch.rem_euclid(MICROS_PER_SECOND);

        let mut tm: libc::tm = unsafe { std::mem::zeroed() };
        let time = secs as libc::time_t;
        unsafe {
            libc::localtime_r(&time, &mut tm);
        }

        if with_micros {
            format!(
                "{:04}-{:02}-{:02} {:02}:{:02}:{:02},{:06}",
                tm.tm_year + 1900,
                tm.tm_mon + 1,
                tm.tm_mday,
                tm.tm_hour,
                tm.tm_min,
                tm.tm_sec,
                micros
            )
        } else {
            format!(
                "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
                tm.tm_year + 1900,
                tm.tm_mon + 1,
                tm.tm_mday,
                tm.tm_hour,
                tm.tm_min,
                tm.tm_sec
            )
        }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.to_local_time(true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_follows_micros() {
        let a = Timestamp::new(1);
        let b = Timestamp::new(2);
        assert!(a < b);
    }

    #[test]
    fn add_seconds_converts_to_micros() {
        let t = Timestamp::new(0).add_seconds(1.5);
        assert_eq!(t.micros_since_epoch(), 1_500_000);
    }

    #[test]
    fn valid_requires_positive_micros() {
        assert!(!Timestamp::new(0).valid());
        assert!(Timestamp::new(1).valid());
    }
}
