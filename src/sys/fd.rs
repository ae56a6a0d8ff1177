//! RAII wrapper around a raw file descriptor.
//!
//! Every owned descriptor in the crate -- sockets, the wakeup eventfd, the
//! per-loop timerfd, the acceptor's idle fd -- goes through this type so that
//! `close(2)` happens exactly once, on drop, regardless of which path tears
//! the owner down.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd};

#[derive(Debug)]
pub struct FileDesc(File);

impl FileDesc {
    /// # Safety
    /// `fd` must be a valid, open, uniquely-owned file descriptor.
    pub unsafe fn new(fd: RawFd) -> Self {
        FileDesc(File::from_raw_fd(fd))
    }

    pub fn try_clone(&self) -> io::Result<FileDesc> {
        Ok(FileDesc(self.0.try_clone()?))
    }

    pub fn set_cloexec(&self) -> io::Result<()> {
        let fd = self.0.as_raw_fd();
        let flags = syscall!(fcntl(fd, libc::F_GETFD))?;
        syscall!(fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC))?;
        Ok(())
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        let fd = self.0.as_raw_fd();
        let flags = syscall!(fcntl(fd, libc::F_GETFL))?;
        let flags = if nonblocking {
            flags | libc::O_NONBLOCK
        } else {
            flags & !libc::O_NONBLOCK
        };
        syscall!(fcntl(fd, libc::F_SETFL, flags))?;
        Ok(())
    }
}

impl FromRawFd for FileDesc {
    unsafe fn from_raw_fd(fd: RawFd) -> Self {
        FileDesc(File::from_raw_fd(fd))
    }
}

impl AsRawFd for FileDesc {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

impl IntoRawFd for FileDesc {
    fn into_raw_fd(self) -> RawFd {
        self.0.into_raw_fd()
    }
}

impl Read for FileDesc {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

impl Read for &FileDesc {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.0).read(buf)
    }
}

impl Write for FileDesc {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Write for &FileDesc {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (&self.0).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
