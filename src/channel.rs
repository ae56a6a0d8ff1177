//! One `Channel` per registered fd: owns its interest set and the four
//! read/write/close/error callbacks, and knows how to demultiplex a single
//! readiness notification into the right callback call.
//!
//! Channels are owned by whoever opened the fd (`TcpConnection`, `Acceptor`,
//! the loop's own timerfd and wakeup eventfd) and only *referenced* by the
//! `EventLoop`'s channel map -- the inverse of the channel's back-reference
//! to the loop, which is also non-owning. Neither side keeps the other
//! alive, matching the raw, non-owning pointers the original wires together
//! and trusting the same lifetime discipline: a channel is always removed
//! from its loop before it is dropped.

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};

use crate::event_loop::EventLoopInner;
use crate::interest::Ready;
use crate::time::Timestamp;

pub const KNEW: i32 = -1;
pub const KADDED: i32 = 1;
pub const KDELETED: i32 = 2;

pub type ReadCallback = Box<dyn FnMut(Timestamp)>;
pub type EventCallback = Box<dyn FnMut()>;

pub struct Channel {
    loop_: Weak<RefCell<EventLoopInner>>,
    fd: RawFd,
    events: Ready,
    revents: Ready,
    index: i32,
    added_to_loop: bool,
    event_handling: bool,
    tie: Option<Weak<RefCell<dyn Any>>>,
    tied: bool,

    read_callback: Option<ReadCallback>,
    write_callback: Option<EventCallback>,
    close_callback: Option<EventCallback>,
    error_callback: Option<EventCallback>,
}

impl Channel {
    pub fn new(loop_: Weak<RefCell<EventLoopInner>>, fd: RawFd) -> Rc<RefCell<Channel>> {
        Rc::new(RefCell::new(Channel {
            loop_,
            fd,
            events: Ready::empty(),
            revents: Ready::empty(),
            index: KNEW,
            added_to_loop: false,
            event_handling: false,
            tie: None,
            tied: false,
            read_callback: None,
            write_callback: None,
            close_callback: None,
            error_callback: None,
        }))
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn events(&self) -> Ready {
        self.events
    }

    pub fn set_revents(&mut self, revents: Ready) {
        self.revents = revents;
    }

    pub fn is_none_event(&self) -> bool {
        self.events.is_empty()
    }

    pub fn index(&self) -> i32 {
        self.index
    }

    pub fn set_index(&mut self, idx: i32) {
        self.index = idx;
    }

    pub fn set_read_callback(&mut self, cb: ReadCallback) {
        self.read_callback = Some(cb);
    }

    pub fn set_write_callback(&mut self, cb: EventCallback) {
        self.write_callback = Some(cb);
    }

    pub fn set_close_callback(&mut self, cb: EventCallback) {
        self.close_callback = Some(cb);
    }

    pub fn set_error_callback(&mut self, cb: EventCallback) {
        self.error_callback = Some(cb);
    }

    /// Ties the channel's lifetime to `owner`: `handle_event` becomes a
    /// no-op once `owner` has been dropped, preventing callbacks from
    /// firing into a half-destroyed `TcpConnection`.
    pub fn tie(&mut self, owner: Weak<RefCell<dyn Any>>) {
        self.tie = Some(owner);
        self.tied = true;
    }
}

/// Free functions taking the channel's own `Rc` handle, since enabling an
/// interest must reach back into the owning loop to re-arm the
/// demultiplexer -- the Rust analogue of `Channel::update()` calling through
/// a raw `loop_` pointer.
pub fn enable_reading(this: &Rc<RefCell<Channel>>) {
    this.borrow_mut().events.insert(Ready::readable());
    update(this);
}

pub fn disable_reading(this: &Rc<RefCell<Channel>>) {
    this.borrow_mut().events.remove(Ready::readable());
    update(this);
}

pub fn enable_writing(this: &Rc<RefCell<Channel>>) {
    this.borrow_mut().events.insert(Ready::writable());
    update(this);
}

pub fn disable_writing(this: &Rc<RefCell<Channel>>) {
    this.borrow_mut().events.remove(Ready::writable());
    update(this);
}

pub fn disable_all(this: &Rc<RefCell<Channel>>) {
    this.borrow_mut().events = Ready::empty();
    update(this);
}

pub fn is_writing(this: &Rc<RefCell<Channel>>) -> bool {
    this.borrow().events.is_writable()
}

fn update(this: &Rc<RefCell<Channel>>) {
    this.borrow_mut().added_to_loop = true;
    let loop_ = this.borrow().loop_.clone();
    if let Some(loop_) = loop_.upgrade() {
        EventLoopInner::update_channel(&loop_, this);
    }
}

pub fn remove(this: &Rc<RefCell<Channel>>) {
    assert!(this.borrow().is_none_event());
    let loop_ = this.borrow().loop_.clone();
    if let Some(loop_) = loop_.upgrade() {
        EventLoopInner::remove_channel(&loop_, this);
    }
    this.borrow_mut().added_to_loop = false;
}

/// Dispatches a readiness notification to the registered callbacks, in the
/// order POLLNVAL (warn only) -> HUP-without-IN (close) -> ERR|NVAL (error)
/// -> IN|PRI|RDHUP (read) -> OUT (write).
pub fn handle_event(this: &Rc<RefCell<Channel>>, receive_time: Timestamp) {
    let tied = this.borrow().tied;
    if tied {
        let guard = this.borrow().tie.as_ref().and_then(Weak::upgrade);
        if let Some(guard) = guard {
            handle_event_with_guard(this, receive_time);
            drop(guard);
        }
    } else {
        handle_event_with_guard(this, receive_time);
    }
}

fn handle_event_with_guard(this: &Rc<RefCell<Channel>>, receive_time: Timestamp) {
    this.borrow_mut().event_handling = true;

    let revents = this.borrow().revents;

    if revents.is_invalid() {
        tracing::warn!(fd = this.borrow().fd, "Channel::handle_event() POLLNVAL");
    }

    if revents.is_hup() && !revents.is_readable() {
        let cb = this.borrow_mut().close_callback.take();
        if let Some(mut cb) = cb {
            cb();
            this.borrow_mut().close_callback = Some(cb);
        }
    }

    if revents.is_error() || revents.is_invalid() {
        let cb = this.borrow_mut().error_callback.take();
        if let Some(mut cb) = cb {
            cb();
            this.borrow_mut().error_callback = Some(cb);
        }
    }

    if revents.is_readable() || revents.is_rdhup() {
        let cb = this.borrow_mut().read_callback.take();
        if let Some(mut cb) = cb {
            cb(receive_time);
            this.borrow_mut().read_callback = Some(cb);
        }
    }

    if revents.is_writable() {
        let cb = this.borrow_mut().write_callback.take();
        if let Some(mut cb) = cb {
            cb();
            this.borrow_mut().write_callback = Some(cb);
        }
    }

    this.borrow_mut().event_handling = false;
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Channel")
            .field("fd", &self.fd)
            .field("events", &self.events)
            .field("index", &self.index)
            .finish()
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        debug_assert!(!self.added_to_loop, "channel dropped while still registered");
    }
}
