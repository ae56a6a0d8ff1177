//! The per-thread reactor: owns the demultiplexer, the timer queue, and the
//! pending-task queue that lets other threads schedule work here.
//!
//! Exactly one loop may run per OS thread, tracked the way `t_loopInThisThread`
//! tracks it, via a thread-local slot set by `EventLoopInner::new` and
//! cleared when the owning `EventLoop` drops. `EventLoopInner` itself is
//! only ever reached through the `Rc<RefCell<_>>` its own thread holds --
//! other threads reach it only through a [`LoopHandle`], built from nothing
//! but an `Arc<TaskQueue>`, so scheduling from elsewhere never shares the
//! `Rc`'s refcount across threads.

use std::cell::RefCell;
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::Duration;

use crate::channel::{self, Channel};
use crate::demux::Demultiplexer;
use crate::sys::eventfd::EventFd;
use crate::task_queue::{Task, TaskQueue};
use crate::time::Timestamp;
use crate::timer::{TimerCallback, TimerId, TimerQueue, TimerRecord};

const POLL_TIME: Duration = Duration::from_millis(10_000);

thread_local! {
    static CURRENT_LOOP: RefCell<Option<Rc<RefCell<EventLoopInner>>>> = RefCell::new(None);
}

pub struct EventLoopInner {
    thread_id: ThreadId,
    looping: bool,
    event_handling: bool,
    demux: Demultiplexer,
    active_channels: Vec<Rc<RefCell<Channel>>>,
    tasks: Arc<TaskQueue>,
    wakeup: EventFd,
    wakeup_channel: Rc<RefCell<Channel>>,
    timer_queue: TimerQueue,
}

impl EventLoopInner {
    /// Builds a new loop on the calling thread, aborting the process if any
    /// of the foundational syscalls (epoll/poll setup, the wakeup eventfd,
    /// the per-loop timerfd) fail -- the same `LOG_SYSFATAL` treatment the
    /// constructor gives them.
    pub fn new() -> Rc<RefCell<EventLoopInner>> {
        let thread_id = std::thread::current().id();
        let demux = Demultiplexer::new().unwrap_or_else(|e| crate::error::fatal("creating demultiplexer", &e));
        let wakeup = EventFd::new().unwrap_or_else(|e| crate::error::fatal("creating wakeup eventfd", &e));
        let wakeup_fd = wakeup.as_raw_fd();
        let tasks = Arc::new(TaskQueue::new(wakeup_fd, thread_id));

        let loop_rc = Rc::new_cyclic(|weak: &Weak<RefCell<EventLoopInner>>| {
            let wakeup_channel = Channel::new(weak.clone(), wakeup_fd);
            let weak_for_read = weak.clone();
            wakeup_channel.borrow_mut().set_read_callback(Box::new(move |_now| {
                if let Some(loop_rc) = weak_for_read.upgrade() {
                    let _ = loop_rc.borrow().wakeup.read();
                }
            }));

            let timer_queue =
                TimerQueue::new(weak.clone()).unwrap_or_else(|e| crate::error::fatal("creating timerfd", &e));

            RefCell::new(EventLoopInner {
                thread_id,
                looping: false,
                event_handling: false,
                demux,
                active_channels: Vec::new(),
                tasks,
                wakeup,
                wakeup_channel,
                timer_queue,
            })
        });

        // `weak.upgrade()` inside `new_cyclic` always fails, so registering
        // either channel for reading has to wait until the `Rc` is live.
        let wakeup_channel = loop_rc.borrow().wakeup_channel.clone();
        channel::enable_reading(&wakeup_channel);
        let timer_channel = loop_rc.borrow().timer_queue.channel().clone();
        channel::enable_reading(&timer_channel);

        CURRENT_LOOP.with(|cur| {
            let mut cur = cur.borrow_mut();
            assert!(cur.is_none(), "an EventLoop already exists on this thread");
            *cur = Some(loop_rc.clone());
        });

        loop_rc
    }

    pub(crate) fn timer_queue_mut(&mut self) -> &mut TimerQueue {
        &mut self.timer_queue
    }

    pub fn is_in_loop_thread(this: &Rc<RefCell<EventLoopInner>>) -> bool {
        this.borrow().thread_id == std::thread::current().id()
    }

    pub fn assert_in_loop_thread(this: &Rc<RefCell<EventLoopInner>>) {
        if !Self::is_in_loop_thread(this) {
            let err = std::io::Error::new(std::io::ErrorKind::Other, "event loop used from non-owning thread");
            crate::error::fatal("thread check", &err);
        }
    }

    pub fn has_channel(this: &Rc<RefCell<EventLoopInner>>, fd: RawFd) -> bool {
        this.borrow().demux.has_channel(fd)
    }

    pub fn update_channel(this: &Rc<RefCell<EventLoopInner>>, channel: &Rc<RefCell<Channel>>) {
        Self::assert_in_loop_thread(this);
        let mut inner = this.borrow_mut();
        if let Err(e) = inner.demux.update_channel(channel) {
            let fd = channel.borrow().fd();
            tracing::error!(error = %e, fd, "failed to update channel registration");
        }
    }

    pub fn remove_channel(this: &Rc<RefCell<EventLoopInner>>, channel: &Rc<RefCell<Channel>>) {
        Self::assert_in_loop_thread(this);
        let mut inner = this.borrow_mut();
        if let Err(e) = inner.demux.remove_channel(channel) {
            let fd = channel.borrow().fd();
            tracing::error!(error = %e, fd, "failed to remove channel registration");
        }
    }

    /// Runs `f` synchronously if already on the loop thread, otherwise
    /// hands it to [`queue_in_loop`].
    pub fn run_in_loop(this: &Rc<RefCell<EventLoopInner>>, f: impl FnOnce(&Rc<RefCell<EventLoopInner>>) + 'static) {
        if Self::is_in_loop_thread(this) {
            f(this);
        } else {
            Self::queue_in_loop(this, f);
        }
    }

    /// Always defers `f` to the next `doPendingFunctors` pass, waking the
    /// loop if it is currently blocked in the demultiplexer wait or already
    /// mid-way through its own pending-task drain.
    pub fn queue_in_loop(this: &Rc<RefCell<EventLoopInner>>, f: impl FnOnce(&Rc<RefCell<EventLoopInner>>) + 'static) {
        let tasks = this.borrow().tasks.clone();
        let calling = tasks.is_calling_pending_functors();
        tasks.push(Task::new(f));
        if !Self::is_in_loop_thread(this) || calling {
            tasks.wake();
        }
    }

    pub fn run_at(this: &Rc<RefCell<EventLoopInner>>, when: Timestamp, cb: TimerCallback) -> TimerId {
        let (record, id) = TimerRecord::new(cb, when, 0.0);
        Self::schedule(this, record);
        id
    }

    pub fn run_after(this: &Rc<RefCell<EventLoopInner>>, delay_secs: f64, cb: TimerCallback) -> TimerId {
        Self::run_at(this, Timestamp::now().add_seconds(delay_secs), cb)
    }

    pub fn run_every(this: &Rc<RefCell<EventLoopInner>>, interval_secs: f64, cb: TimerCallback) -> TimerId {
        let (record, id) = TimerRecord::new(cb, Timestamp::now().add_seconds(interval_secs), interval_secs);
        Self::schedule(this, record);
        id
    }

    pub fn cancel_timer(this: &Rc<RefCell<EventLoopInner>>, id: TimerId) {
        Self::run_in_loop(this, move |loop_rc| {
            loop_rc.borrow_mut().timer_queue_mut().cancel_in_loop(id);
        });
    }

    fn schedule(this: &Rc<RefCell<EventLoopInner>>, record: TimerRecord) {
        Self::run_in_loop(this, move |loop_rc| {
            loop_rc.borrow_mut().timer_queue_mut().add_timer_in_loop(record);
        });
    }

    pub fn quit(this: &Rc<RefCell<EventLoopInner>>) {
        let tasks = this.borrow().tasks.clone();
        tasks.request_quit();
        if !Self::is_in_loop_thread(this) {
            tasks.wake();
        }
    }

    pub fn handle(this: &Rc<RefCell<EventLoopInner>>) -> LoopHandle {
        LoopHandle {
            tasks: this.borrow().tasks.clone(),
        }
    }

    /// The `while(!quit_) { poll; handleEvent*; doPendingFunctors(); }` cycle.
    pub fn run(this: &Rc<RefCell<EventLoopInner>>) {
        {
            let mut inner = this.borrow_mut();
            assert!(!inner.looping, "EventLoop::run called while already looping");
            inner.looping = true;
        }
        Self::assert_in_loop_thread(this);

        while !this.borrow().tasks.quit_requested() {
            let (now, active) = {
                let mut inner = this.borrow_mut();
                inner.active_channels.clear();
                match inner.demux.wait(Some(POLL_TIME)) {
                    Ok(result) => result,
                    Err(e) => {
                        tracing::warn!(error = %e, "demultiplexer wait failed");
                        (Timestamp::now(), Vec::new())
                    }
                }
            };

            {
                let mut inner = this.borrow_mut();
                inner.active_channels = active.clone();
                inner.event_handling = true;
            }
            for ch in &active {
                channel::handle_event(ch, now);
            }
            this.borrow_mut().event_handling = false;

            Self::do_pending_tasks(this);
        }

        this.borrow_mut().looping = false;
    }

    fn do_pending_tasks(this: &Rc<RefCell<EventLoopInner>>) {
        let tasks = this.borrow().tasks.clone();
        tasks.set_calling_pending_functors(true);
        for task in tasks.swap() {
            task.run(this);
        }
        tasks.set_calling_pending_functors(false);
    }
}

impl Drop for EventLoopInner {
    fn drop(&mut self) {
        channel::disable_all(&self.wakeup_channel);
        channel::remove(&self.wakeup_channel);
    }
}

/// `Send`-safe cross-thread scheduling handle. Built only from an
/// `Arc<TaskQueue>`, which in turn holds nothing but a mutex, atomics, and a
/// raw fd number -- never the loop's own `Rc`, so cloning or sending a
/// `LoopHandle` never races with the owning thread over an `Rc`'s refcount.
#[derive(Clone)]
pub struct LoopHandle {
    tasks: Arc<TaskQueue>,
}

impl LoopHandle {
    pub fn is_in_loop_thread(&self) -> bool {
        self.tasks.is_in_loop_thread()
    }

    pub fn queue_in_loop(&self, f: impl FnOnce(&Rc<RefCell<EventLoopInner>>) + 'static) {
        let calling = self.tasks.is_calling_pending_functors();
        self.tasks.push(Task::new(f));
        if !self.is_in_loop_thread() || calling {
            self.tasks.wake();
        }
    }

    pub fn run_at(&self, when: Timestamp, cb: TimerCallback) -> TimerId {
        let (record, id) = TimerRecord::new(cb, when, 0.0);
        self.queue_in_loop(move |loop_rc| {
            loop_rc.borrow_mut().timer_queue_mut().add_timer_in_loop(record);
        });
        id
    }

    pub fn run_after(&self, delay_secs: f64, cb: TimerCallback) -> TimerId {
        self.run_at(Timestamp::now().add_seconds(delay_secs), cb)
    }

    pub fn run_every(&self, interval_secs: f64, cb: TimerCallback) -> TimerId {
        let (record, id) = TimerRecord::new(cb, Timestamp::now().add_seconds(interval_secs), interval_secs);
        self.queue_in_loop(move |loop_rc| {
            loop_rc.borrow_mut().timer_queue_mut().add_timer_in_loop(record);
        });
        id
    }

    pub fn cancel(&self, id: TimerId) {
        self.queue_in_loop(move |loop_rc| {
            loop_rc.borrow_mut().timer_queue_mut().cancel_in_loop(id);
        });
    }

    pub fn quit(&self) {
        self.tasks.request_quit();
        if !self.is_in_loop_thread() {
            self.tasks.wake();
        }
    }
}

/// Public entry point: owns the loop's `Rc` and the thread-local
/// registration, exposing only the operations an application needs.
pub struct EventLoop {
    inner: Rc<RefCell<EventLoopInner>>,
}

impl EventLoop {
    pub fn new() -> EventLoop {
        EventLoop { inner: EventLoopInner::new() }
    }

    pub fn run(&self) {
        EventLoopInner::run(&self.inner)
    }

    pub fn quit(&self) {
        EventLoopInner::quit(&self.inner)
    }

    pub fn handle(&self) -> LoopHandle {
        EventLoopInner::handle(&self.inner)
    }

    pub fn inner(&self) -> &Rc<RefCell<EventLoopInner>> {
        &self.inner
    }

    /// The loop registered on the calling thread, if any -- the Rust analogue
    /// of `EventLoop::getEventLoopOfCurrentThread`.
    pub fn current() -> Option<Rc<RefCell<EventLoopInner>>> {
        CURRENT_LOOP.with(|cur| cur.borrow().clone())
    }
}

impl Default for EventLoop {
    fn default() -> EventLoop {
        EventLoop::new()
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        CURRENT_LOOP.with(|cur| {
            *cur.borrow_mut() = None;
        });
    }
}
