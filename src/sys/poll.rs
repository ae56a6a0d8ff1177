use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;
use std::{cmp, i32};

use libc::{pollfd, POLLERR, POLLHUP, POLLIN, POLLNVAL, POLLOUT, POLLPRI, POLLRDHUP};

use crate::interest::Ready;
use crate::token::Token;

/// `poll(2)`-backed fallback demultiplexer, selected when `USE_POLL` is set.
/// Unlike epoll this has no persistent kernel-side interest set: the whole
/// pollfd array is rebuilt from the channel map on every `wait`, the same
/// tradeoff `PollPoller::poll` makes (O(n) per wait, no `poll_ctl`-style
/// incremental registration).
pub struct Poll {
    fds: Vec<(RawFd, Token)>,
}

impl Poll {
    pub fn new() -> io::Result<Poll> {
        Ok(Poll { fds: Vec::new() })
    }

    pub fn add(&mut self, fd: RawFd, token: Token) {
        self.fds.retain(|&(f, _)| f != fd);
        self.fds.push((fd, token));
    }

    pub fn modify(&mut self, fd: RawFd, token: Token) {
        self.add(fd, token);
    }

    pub fn delete(&mut self, fd: RawFd) {
        self.fds.retain(|&(f, _)| f != fd);
    }

    pub fn wait(
        &self,
        interests: impl Fn(Token) -> Ready,
        timeout: Option<Duration>,
    ) -> io::Result<Vec<(Token, Ready)>> {
        if self.fds.is_empty() {
            if let Some(to) = timeout {
                std::thread::sleep(to);
            }
            return Ok(Vec::new());
        }

        let mut pollfds: Vec<pollfd> = self
            .fds
            .iter()
            .map(|&(fd, token)| {
                let interest = interests(token);
                let mut events = 0;
                if interest.is_readable() {
                    events |= POLLIN;
                }
                if interest.is_writable() {
                    events |= POLLOUT;
                }
                pollfd {
                    fd,
                    events,
                    revents: 0,
                }
            })
            .collect();

        let timeout = timeout
            .map(|to| cmp::min(to.as_millis(), i32::MAX as u128) as i32)
            .unwrap_or(-1);

        let n = crate::sys::syscall!(poll(
            pollfds.as_mut_ptr(),
            pollfds.len() as libc::nfds_t,
            timeout
        ))?;

        let mut ready = Vec::with_capacity(n as usize);
        for (pfd, &(_, token)) in pollfds.iter().zip(self.fds.iter()) {
            if pfd.revents == 0 {
                continue;
            }
            let mut r = Ready::empty();
            if pfd.revents & (POLLIN | POLLPRI) != 0 {
                r.insert(Ready::readable());
            }
            if pfd.revents & POLLOUT != 0 {
                r.insert(Ready::writable());
            }
            if pfd.revents & POLLERR != 0 {
                r.insert(Ready::error());
            }
            if pfd.revents & POLLNVAL != 0 {
                r.insert(Ready::invalid());
            }
            if pfd.revents & POLLHUP != 0 {
                r.insert(Ready::hup());
            }
            if pfd.revents & POLLRDHUP != 0 {
                r.insert(Ready::rdhup());
            }
            if !r.is_empty() {
                ready.push((token, r));
            }
        }
        Ok(ready)
    }
}
