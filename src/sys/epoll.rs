use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;
use std::{cmp, i32};

use libc::{c_int, EPOLLERR, EPOLLET, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLPRI, EPOLLRDHUP};

use crate::interest::Ready;
use crate::token::Token;

/// Raw `epoll_create1`/`epoll_wait`/`epoll_ctl` wrapper. Always level
/// triggered -- `EPOLLET` is never set, matching `EpollPoller`'s choice to
/// let every fd re-report until handled.
pub struct Epoll {
    epfd: RawFd,
}

impl Epoll {
    pub fn new() -> io::Result<Epoll> {
        let epfd = crate::sys::syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;
        Ok(Epoll { epfd })
    }

    pub fn wait(&self, evts: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        let timeout = timeout
            .map(|to| cmp::min(to.as_millis(), i32::MAX as u128) as c_int)
            .unwrap_or(-1);

        let cnt = crate::sys::syscall!(epoll_wait(
            self.epfd,
            evts.events.as_mut_ptr(),
            evts.events.capacity() as i32,
            timeout
        ))?;

        unsafe { evts.events.set_len(cnt as usize) };

        Ok(())
    }

    pub fn add(&self, fd: RawFd, token: Token, interests: Ready) -> io::Result<()> {
        let mut info = libc::epoll_event {
            events: ioevent_to_epoll(interests),
            u64: usize::from(token) as u64,
        };
        crate::sys::syscall!(epoll_ctl(self.epfd, libc::EPOLL_CTL_ADD, fd, &mut info))?;
        Ok(())
    }

    pub fn modify(&self, fd: RawFd, token: Token, interests: Ready) -> io::Result<()> {
        let mut info = libc::epoll_event {
            events: ioevent_to_epoll(interests),
            u64: usize::from(token) as u64,
        };
        crate::sys::syscall!(epoll_ctl(self.epfd, libc::EPOLL_CTL_MOD, fd, &mut info))?;
        Ok(())
    }

    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        let mut info = libc::epoll_event { events: 0, u64: 0 };
        crate::sys::syscall!(epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, &mut info))?;
        Ok(())
    }
}

fn ioevent_to_epoll(interest: Ready) -> u32 {
    let mut kind = 0;

    if interest.is_readable() {
        kind |= EPOLLIN;
    }
    if interest.is_writable() {
        kind |= EPOLLOUT;
    }
    kind &= !EPOLLET;

    kind as u32
}

impl AsRawFd for Epoll {
    fn as_raw_fd(&self) -> RawFd {
        self.epfd
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        unsafe {
            let _ = libc::close(self.epfd);
        }
    }
}

/// Ready-event buffer. Starts at 16 entries and doubles whenever a wait
/// fills it completely, matching `EpollPoller::poll`'s growth rule.
pub struct Events {
    events: Vec<libc::epoll_event>,
}

impl Events {
    pub fn with_capacity(cap: usize) -> Events {
        Events {
            events: Vec::with_capacity(cap),
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.events.capacity()
    }

    pub fn reserve_double(&mut self) {
        let cap = self.events.capacity();
        self.events.reserve(cap);
    }

    pub fn get(&self, idx: usize) -> Option<(Token, Ready)> {
        self.events.get(idx).map(|event| {
            let epoll = event.events as c_int;
            let mut ready = Ready::empty();

            if epoll & EPOLLIN != 0 || epoll & EPOLLPRI != 0 {
                ready.insert(Ready::readable());
            }
            if epoll & EPOLLOUT != 0 {
                ready.insert(Ready::writable());
            }
            if epoll & EPOLLERR != 0 {
                ready.insert(Ready::error());
            }
            if epoll & EPOLLHUP != 0 {
                ready.insert(Ready::hup());
            }
            if epoll & EPOLLRDHUP != 0 {
                ready.insert(Ready::rdhup());
            }

            (Token(event.u64 as usize), ready)
        })
    }
}
