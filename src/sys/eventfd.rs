use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd};

use super::fd::FileDesc;

pub const EFD_CLOEXEC: i32 = libc::EFD_CLOEXEC;
pub const EFD_NONBLOCK: i32 = libc::EFD_NONBLOCK;

/// The wakeup primitive behind the cross-thread pending-task queue and the
/// event loop's own self-pipe. One eventfd per `EventLoop`.
#[derive(Debug)]
pub struct EventFd {
    inner: FileDesc,
}

impl EventFd {
    /// Create an eventfd with initval 0 and `EFD_CLOEXEC | EFD_NONBLOCK`.
    pub fn new() -> io::Result<EventFd> {
        Self::with_options(0, EFD_CLOEXEC | EFD_NONBLOCK)
    }

    pub fn with_options(initval: u32, flags: i32) -> io::Result<EventFd> {
        let fd = crate::sys::syscall!(eventfd(initval, flags))?;
        Ok(EventFd {
            inner: unsafe { FileDesc::new(fd) },
        })
    }

    pub fn read(&self) -> io::Result<u64> {
        let mut buf = [0u8; 8];
        (&self.inner).read_exact(&mut buf)?;
        Ok(u64::from_ne_bytes(buf))
    }

    pub fn write(&self, val: u64) -> io::Result<()> {
        let buf = val.to_ne_bytes();
        (&self.inner).write_all(&buf)?;
        Ok(())
    }
}

impl FromRawFd for EventFd {
    unsafe fn from_raw_fd(fd: RawFd) -> Self {
        EventFd {
            inner: FileDesc::new(fd),
        }
    }
}

impl IntoRawFd for EventFd {
    fn into_raw_fd(self) -> RawFd {
        self.inner.into_raw_fd()
    }
}

impl AsRawFd for EventFd {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

#[cfg(test)]
mod test {
    use super::EventFd;

    #[test]
    fn write_and_read() {
        let eventfd = EventFd::new().unwrap();
        eventfd.write(123).unwrap();
        let count = eventfd.read().unwrap();
        assert_eq!(123, count);
    }

    #[test]
    fn write_saturates_rather_than_overflows() {
        let eventfd = EventFd::new().unwrap();
        assert!(eventfd.write(0xffff_ffff_ffff_fffe).is_ok());
        assert!(eventfd.write(0xffff_ffff_ffff_fffe).is_err());
    }
}
