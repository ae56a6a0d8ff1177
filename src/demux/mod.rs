//! Readiness demultiplexer: wraps the epoll or poll backend behind one
//! contract and keeps the fd-to-channel map the backends are blind to.
//!
//! Selection mirrors `Poller::newDefaultPoller`: `USE_POLL` in the
//! environment selects the poll(2) fallback, otherwise epoll. Every
//! registered channel sits in exactly one of the `KNEW`/`KADDED`/`KDELETED`
//! states tracked on the channel itself; `update_channel`/`remove_channel`
//! reconcile that state with both the map here and the kernel side.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};
use std::time::Duration;

use crate::channel::{Channel, KADDED, KDELETED, KNEW};
use crate::interest::Ready;
use crate::sys::epoll::{Epoll, Events};
use crate::sys::poll::Poll;
use crate::time::Timestamp;
use crate::token::Token;

const INITIAL_EVENTS_CAPACITY: usize = 16;

enum Backend {
    Epoll(Epoll, Events),
    Poll(Poll),
}

pub struct Demultiplexer {
    backend: Backend,
    channels: HashMap<RawFd, Weak<RefCell<Channel>>>,
}

impl Demultiplexer {
    pub fn new() -> io::Result<Demultiplexer> {
        let backend = if std::env::var_os("USE_POLL").is_some() {
            tracing::info!("USE_POLL set, falling back to poll(2) demultiplexer");
            Backend::Poll(Poll::new()?)
        } else {
            Backend::Epoll(Epoll::new()?, Events::with_capacity(INITIAL_EVENTS_CAPACITY))
        };
        Ok(Demultiplexer {
            backend,
            channels: HashMap::new(),
        })
    }

    pub fn has_channel(&self, fd: RawFd) -> bool {
        self.channels.contains_key(&fd)
    }

    /// Waits for readiness, level-triggered, up to `timeout`. A `poll`/
    /// `epoll_wait` failure other than `EINTR` is logged once and treated as
    /// an empty wake-up rather than propagated -- the loop keeps running.
    pub fn wait(&mut self, timeout: Option<Duration>) -> io::Result<(Timestamp, Vec<Rc<RefCell<Channel>>>)> {
        let Demultiplexer { backend, channels } = self;

        match backend {
            Backend::Epoll(epoll, events) => {
                match epoll.wait(events, timeout) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                        return Ok((Timestamp::now(), Vec::new()));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "epoll_wait failed");
                        return Ok((Timestamp::now(), Vec::new()));
                    }
                }

                let now = Timestamp::now();
                if events.len() > 0 {
                    tracing::trace!(count = events.len(), "events happened");
                } else {
                    tracing::trace!("nothing happened");
                }

                let mut active = Vec::with_capacity(events.len());
                for idx in 0..events.len() {
                    if let Some((token, ready)) = events.get(idx) {
                        let fd = usize::from(token) as RawFd;
                        if let Some(channel) = channels.get(&fd).and_then(Weak::upgrade) {
                            channel.borrow_mut().set_revents(ready);
                            active.push(channel);
                        }
                    }
                }

                if events.len() == events.capacity() {
                    events.reserve_double();
                }

                Ok((now, active))
            }
            Backend::Poll(poll) => {
                let ready_list = match poll.wait(
                    |token| {
                        let fd = usize::from(token) as RawFd;
                        channels
                            .get(&fd)
                            .and_then(Weak::upgrade)
                            .map(|c| c.borrow().events())
                            .unwrap_or_else(Ready::empty)
                    },
                    timeout,
                ) {
                    Ok(list) => list,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                        return Ok((Timestamp::now(), Vec::new()));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "poll() failed");
                        return Ok((Timestamp::now(), Vec::new()));
                    }
                };

                let now = Timestamp::now();
                let mut active = Vec::with_capacity(ready_list.len());
                for (token, ready) in ready_list {
                    let fd = usize::from(token) as RawFd;
                    if let Some(channel) = channels.get(&fd).and_then(Weak::upgrade) {
                        channel.borrow_mut().set_revents(ready);
                        active.push(channel);
                    }
                }
                Ok((now, active))
            }
        }
    }

    pub fn update_channel(&mut self, channel: &Rc<RefCell<Channel>>) -> io::Result<()> {
        let (fd, index, events) = {
            let c = channel.borrow();
            (c.fd(), c.index(), c.events())
        };
        let token = Token(fd as usize);

        if index == KNEW || index == KDELETED {
            debug_assert!(index != KNEW || !self.channels.contains_key(&fd));
            self.channels.insert(fd, Rc::downgrade(channel));
            self.add_to_backend(fd, token, events)?;
            channel.borrow_mut().set_index(KADDED);
        } else {
            debug_assert!(self.channels.contains_key(&fd));
            if channel.borrow().is_none_event() {
                self.delete_from_backend(fd)?;
                channel.borrow_mut().set_index(KDELETED);
            } else {
                self.modify_in_backend(fd, token, events)?;
            }
        }
        Ok(())
    }

    pub fn remove_channel(&mut self, channel: &Rc<RefCell<Channel>>) -> io::Result<()> {
        let (fd, index) = {
            let c = channel.borrow();
            (c.fd(), c.index())
        };
        debug_assert!(channel.borrow().is_none_event());
        if index == KADDED {
            self.delete_from_backend(fd)?;
        }
        self.channels.remove(&fd);
        channel.borrow_mut().set_index(KNEW);
        Ok(())
    }

    fn add_to_backend(&mut self, fd: RawFd, token: Token, events: Ready) -> io::Result<()> {
        match &mut self.backend {
            Backend::Epoll(epoll, _) => epoll.add(fd, token, events),
            Backend::Poll(poll) => {
                poll.add(fd, token);
                Ok(())
            }
        }
    }

    fn modify_in_backend(&mut self, fd: RawFd, token: Token, events: Ready) -> io::Result<()> {
        match &mut self.backend {
            Backend::Epoll(epoll, _) => epoll.modify(fd, token, events),
            Backend::Poll(poll) => {
                poll.modify(fd, token);
                Ok(())
            }
        }
    }

    fn delete_from_backend(&mut self, fd: RawFd) -> io::Result<()> {
        match &mut self.backend {
            Backend::Epoll(epoll, _) => epoll.delete(fd),
            Backend::Poll(poll) => {
                poll.delete(fd);
                Ok(())
            }
        }
    }
}
