use std::convert::TryInto;
use std::io::Read;
use std::mem;
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd};
use std::time::Duration;
use std::{fmt, io};

use super::fd::FileDesc;

#[derive(Clone, Copy)]
#[repr(i32)]
pub enum Clock {
    Realtime = libc::CLOCK_REALTIME,
    Monotonic = libc::CLOCK_MONOTONIC,
}

impl fmt::Debug for Clock {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Clock::Realtime => write!(f, "CLOCK_REALTIME"),
            Clock::Monotonic => write!(f, "CLOCK_MONOTONIC"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetTimeFlags {
    Default,
    Abstime,
}

pub const TFD_CLOEXEC: i32 = libc::TFD_CLOEXEC;
pub const TFD_NONBLOCK: i32 = libc::TFD_NONBLOCK;
const TFD_TIMER_ABSTIME: i32 = libc::TFD_TIMER_ABSTIME;

/// A `timerfd_create(2)` handle, one per `EventLoop`, registered with the
/// loop's own demultiplexer like any other channel.
#[derive(Debug)]
pub struct TimerFd {
    inner: FileDesc,
}

#[derive(Debug, Clone)]
pub struct TimerSpec {
    pub interval: Duration,
    pub value: Duration,
}

impl TimerFd {
    /// `CLOCK_REALTIME`, `TFD_CLOEXEC | TFD_NONBLOCK` -- matches the clock
    /// the timer queue sequences its expirations against.
    pub fn new() -> io::Result<TimerFd> {
        TimerFd::create(Clock::Realtime, TFD_CLOEXEC | TFD_NONBLOCK)
    }

    pub fn create(clock: Clock, flags: i32) -> io::Result<TimerFd> {
        let fd = crate::sys::syscall!(timerfd_create(clock as i32, flags))?;
        Ok(TimerFd {
            inner: unsafe { FileDesc::new(fd) },
        })
    }

    pub fn settime(&self, value: TimerSpec, flags: SetTimeFlags) -> io::Result<TimerSpec> {
        let new_value = libc::itimerspec {
            it_interval: duration_to_timespec(value.interval),
            it_value: duration_to_timespec(value.value),
        };
        let mut old_value: libc::itimerspec = unsafe { mem::zeroed() };

        let flags = match flags {
            SetTimeFlags::Default => 0,
            SetTimeFlags::Abstime => TFD_TIMER_ABSTIME,
        };

        crate::sys::syscall!(timerfd_settime(
            self.inner.as_raw_fd(),
            flags,
            &new_value,
            &mut old_value
        ))?;

        Ok(TimerSpec {
            interval: timespec_to_duration(old_value.it_interval),
            value: timespec_to_duration(old_value.it_value),
        })
    }

    /// Reads and clears the expiration counter. Returns the number of
    /// expirations since the last read -- normally 1, but can be >1 under
    /// load since the loop only reads once per wakeup.
    pub fn read(&self) -> io::Result<u64> {
        let mut buf = [0u8; 8];
        (&self.inner).read_exact(&mut buf)?;
        Ok(u64::from_ne_bytes(buf))
    }
}

fn duration_to_timespec(duration: Duration) -> libc::timespec {
    libc::timespec {
        tv_sec: duration.as_secs().try_into().unwrap_or(i64::MAX),
        tv_nsec: duration.subsec_nanos().try_into().unwrap(),
    }
}

fn timespec_to_duration(timespec: libc::timespec) -> Duration {
    Duration::new(timespec.tv_sec as u64, timespec.tv_nsec as u32)
}

impl FromRawFd for TimerFd {
    unsafe fn from_raw_fd(fd: RawFd) -> Self {
        TimerFd {
            inner: FileDesc::new(fd),
        }
    }
}

impl IntoRawFd for TimerFd {
    fn into_raw_fd(self) -> RawFd {
        self.inner.into_raw_fd()
    }
}

impl AsRawFd for TimerFd {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}
