use std::io::{self, Error, ErrorKind};
use std::mem;
use std::net::{Shutdown, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd};

use libc::{c_int, c_void, sockaddr, socklen_t, SOCK_CLOEXEC};

use super::commom::{FromInner, IntoInner};
use super::fd::FileDesc;

pub fn setsockopt<T>(sock: &Socket, opt: c_int, val: c_int, payload: T) -> io::Result<()> {
    let payload = &payload as *const T as *const c_void;
    crate::sys::syscall!(setsockopt(
        sock.as_raw_fd(),
        opt,
        val,
        payload,
        mem::size_of::<T>() as socklen_t
    ))?;
    Ok(())
}

pub fn getsockopt<T: Copy>(sock: &Socket, opt: c_int, val: c_int) -> io::Result<T> {
    let mut slot: T = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<T>() as socklen_t;
    crate::sys::syscall!(getsockopt(
        sock.as_raw_fd(),
        opt,
        val,
        &mut slot as *mut _ as *mut _,
        &mut len
    ))?;
    assert_eq!(len as usize, mem::size_of::<T>());
    Ok(slot)
}

pub fn sockname<F>(f: F) -> io::Result<SocketAddr>
where
    F: FnOnce(*mut sockaddr, *mut socklen_t) -> c_int,
{
    unsafe {
        let mut storage: libc::sockaddr_storage = mem::zeroed();
        let mut len = mem::size_of_val(&storage) as socklen_t;
        crate::sys::cvt(f(&mut storage as *mut _ as *mut _, &mut len))?;
        sockaddr_to_addr(&storage, len as usize)
    }
}

struct _SocketAddrV4 {
    pub inner: libc::sockaddr_in,
}

struct _SocketAddrV6 {
    pub inner: libc::sockaddr_in6,
}

impl FromInner<libc::sockaddr_in> for SocketAddrV4 {
    fn from_inner(addr: libc::sockaddr_in) -> SocketAddrV4 {
        unsafe { mem::transmute(_SocketAddrV4 { inner: addr }) }
    }
}

impl FromInner<libc::sockaddr_in6> for SocketAddrV6 {
    fn from_inner(addr: libc::sockaddr_in6) -> SocketAddrV6 {
        unsafe { mem::transmute(_SocketAddrV6 { inner: addr }) }
    }
}

impl<'a> IntoInner<(*const sockaddr, socklen_t)> for &'a SocketAddr {
    fn into_inner(self) -> (*const sockaddr, socklen_t) {
        match *self {
            SocketAddr::V4(ref a) => (a as *const _ as *const _, mem::size_of_val(a) as socklen_t),
            SocketAddr::V6(ref a) => (a as *const _ as *const _, mem::size_of_val(a) as socklen_t),
        }
    }
}

pub fn sockaddr_to_addr(storage: &libc::sockaddr_storage, len: usize) -> io::Result<SocketAddr> {
    match storage.ss_family as c_int {
        libc::AF_INET => {
            assert!(len >= mem::size_of::<libc::sockaddr_in>());
            Ok(SocketAddr::V4(FromInner::from_inner(unsafe {
                *(storage as *const _ as *const libc::sockaddr_in)
            })))
        }
        libc::AF_INET6 => {
            assert!(len >= mem::size_of::<libc::sockaddr_in6>());
            Ok(SocketAddr::V6(FromInner::from_inner(unsafe {
                *(storage as *const _ as *const libc::sockaddr_in6)
            })))
        }
        _ => Err(Error::new(ErrorKind::InvalidInput, "invalid argument")),
    }
}

/// A raw, owning socket fd. TCP-only -- the runtime never speaks UDP, so
/// this strips queen-io's `Socket` down to the accept/read/write/shutdown
/// surface the acceptor and connection layers actually use.
pub struct Socket(FileDesc);

impl Socket {
    pub fn new(addr: &SocketAddr, ty: c_int) -> io::Result<Socket> {
        let fam = match *addr {
            SocketAddr::V4(..) => libc::AF_INET,
            SocketAddr::V6(..) => libc::AF_INET6,
        };
        Socket::new_raw(fam, ty)
    }

    pub fn new_raw(fam: c_int, ty: c_int) -> io::Result<Socket> {
        match crate::sys::syscall!(socket(fam, ty | SOCK_CLOEXEC, 0)) {
            Ok(fd) => return Ok(Socket(unsafe { FileDesc::new(fd) })),
            Err(ref e) if e.raw_os_error() == Some(libc::EINVAL) => {}
            Err(e) => return Err(e),
        }

        let fd = crate::sys::syscall!(socket(fam, ty, 0))?;
        let fd = unsafe { FileDesc::new(fd) };
        fd.set_cloexec()?;
        Ok(Socket(fd))
    }

    /// Accepts with `accept4(..., SOCK_NONBLOCK | SOCK_CLOEXEC)`, falling
    /// back to `accept` + a manual `fcntl` dance on kernels old enough to
    /// return `ENOSYS` for `accept4`.
    pub fn accept(&self, storage: *mut sockaddr, len: *mut socklen_t) -> io::Result<Socket> {
        let res = loop {
            match crate::sys::syscall!(accept4(
                self.0.as_raw_fd(),
                storage,
                len,
                SOCK_CLOEXEC | libc::SOCK_NONBLOCK
            )) {
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                other => break other,
            };
        };

        match res {
            Ok(fd) => return Ok(Socket(unsafe { FileDesc::new(fd) })),
            Err(ref e) if e.raw_os_error() == Some(libc::ENOSYS) => {}
            Err(e) => return Err(e),
        }

        let fd = loop {
            match crate::sys::syscall!(accept(self.0.as_raw_fd(), storage, len)) {
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                other => break other,
            };
        }?;

        let fd = unsafe { FileDesc::new(fd) };
        fd.set_cloexec()?;
        fd.set_nonblocking(true)?;
        Ok(Socket(fd))
    }

    pub fn try_clone(&self) -> io::Result<Socket> {
        self.0.try_clone().map(Socket)
    }

    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let ret = crate::sys::syscall!(recv(
            self.0.as_raw_fd(),
            buf.as_mut_ptr() as *mut c_void,
            buf.len(),
            0
        ))?;
        Ok(ret as usize)
    }

    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let ret = crate::sys::syscall!(send(
            self.0.as_raw_fd(),
            buf.as_ptr() as *const c_void,
            buf.len(),
            libc::MSG_NOSIGNAL
        ))?;
        Ok(ret as usize)
    }

    pub fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        let how = match how {
            Shutdown::Write => libc::SHUT_WR,
            Shutdown::Read => libc::SHUT_RD,
            Shutdown::Both => libc::SHUT_RDWR,
        };
        crate::sys::syscall!(shutdown(self.0.as_raw_fd(), how))?;
        Ok(())
    }

    pub fn set_nodelay(&self, nodelay: bool) -> io::Result<()> {
        setsockopt(self, libc::IPPROTO_TCP, libc::TCP_NODELAY, nodelay as c_int)
    }

    pub fn set_reuseaddr(&self, reuse: bool) -> io::Result<()> {
        setsockopt(self, libc::SOL_SOCKET, libc::SO_REUSEADDR, reuse as c_int)
    }

    pub fn set_reuseport(&self, reuse: bool) -> io::Result<()> {
        setsockopt(self, libc::SOL_SOCKET, libc::SO_REUSEPORT, reuse as c_int)
    }

    pub fn set_keepalive(&self, keepalive: bool) -> io::Result<()> {
        setsockopt(self, libc::SOL_SOCKET, libc::SO_KEEPALIVE, keepalive as c_int)
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        self.0.set_nonblocking(nonblocking)
    }

    pub fn bind(&self, addr: &SocketAddr) -> io::Result<()> {
        let (addr, len) = addr.into_inner();
        crate::sys::syscall!(bind(self.0.as_raw_fd(), addr, len))?;
        Ok(())
    }

    pub fn listen(&self, backlog: c_int) -> io::Result<()> {
        crate::sys::syscall!(listen(self.0.as_raw_fd(), backlog))?;
        Ok(())
    }

    pub fn take_error(&self) -> io::Result<Option<io::Error>> {
        let raw: c_int = getsockopt(self, libc::SOL_SOCKET, libc::SO_ERROR)?;
        if raw == 0 {
            Ok(None)
        } else {
            Ok(Some(io::Error::from_raw_os_error(raw)))
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        sockname(|storage, len| unsafe { libc::getsockname(self.0.as_raw_fd(), storage, len) })
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

impl FromRawFd for Socket {
    unsafe fn from_raw_fd(fd: RawFd) -> Socket {
        Socket(FileDesc::new(fd))
    }
}

impl IntoRawFd for Socket {
    fn into_raw_fd(self) -> RawFd {
        self.0.into_raw_fd()
    }
}
