//! Cross-thread pending-task queue.
//!
//! One data structure is ever shared between loop threads: the pending-task
//! vector, guarded by a mutex exactly as `EventLoop::pendingFunctors_` is.
//! The wakeup eventfd is the only other cross-thread signal; everything
//! else a loop touches is thread-confined.
//!
//! A `Task` closes over whatever the scheduling call captured (a timer
//! callback, a `sendInLoop` payload) and is only ever invoked once, on the
//! owning loop thread, with that loop's own `Rc<RefCell<EventLoopInner>>`
//! handed in by the loop itself -- the task never captures the loop
//! reference, so crossing a `Task` between threads never touches an `Rc`'s
//! refcount from more than one thread. That is the actual safety argument
//! behind the `unsafe impl Send` below, not a blanket "trust me".

use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::thread::ThreadId;

use crate::event_loop::EventLoopInner;

pub struct Task(Box<dyn FnOnce(&Rc<RefCell<EventLoopInner>>)>);

unsafe impl Send for Task {}

impl Task {
    pub fn new(f: impl FnOnce(&Rc<RefCell<EventLoopInner>>) + 'static) -> Task {
        Task(Box::new(f))
    }

    pub fn run(self, loop_rc: &Rc<RefCell<EventLoopInner>>) {
        (self.0)(loop_rc)
    }
}

/// The part of an `EventLoop` that must be reachable from other threads:
/// the pending-task vector, the raw wakeup fd, and the quit/draining flags.
/// Held behind an `Arc` so a `LoopHandle` can clone it freely.
pub(crate) struct TaskQueue {
    pending: Mutex<Vec<Task>>,
    wakeup_fd: RawFd,
    quit: AtomicBool,
    calling_pending_functors: AtomicBool,
    thread_id: ThreadId,
}

impl TaskQueue {
    pub fn new(wakeup_fd: RawFd, thread_id: ThreadId) -> TaskQueue {
        TaskQueue {
            pending: Mutex::new(Vec::new()),
            wakeup_fd,
            quit: AtomicBool::new(false),
            calling_pending_functors: AtomicBool::new(false),
            thread_id,
        }
    }

    pub fn wakeup_fd(&self) -> RawFd {
        self.wakeup_fd
    }

    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    pub fn is_in_loop_thread(&self) -> bool {
        std::thread::current().id() == self.thread_id
    }

    pub fn is_calling_pending_functors(&self) -> bool {
        self.calling_pending_functors.load(Ordering::SeqCst)
    }

    pub fn set_calling_pending_functors(&self, value: bool) {
        self.calling_pending_functors.store(value, Ordering::SeqCst);
    }

    pub fn quit_requested(&self) -> bool {
        self.quit.load(Ordering::SeqCst)
    }

    pub fn request_quit(&self) {
        self.quit.store(true, Ordering::SeqCst);
    }

    /// Appends one task under lock.
    pub fn push(&self, task: Task) {
        let mut guard = self.pending.lock().expect("task queue mutex poisoned");
        guard.push(task);
    }

    /// Swaps the whole pending vector out under lock, the same
    /// swap-then-run-outside-the-lock protocol `EventLoop::doPendingFunctors`
    /// uses so task execution never blocks a concurrent push.
    pub fn swap(&self) -> Vec<Task> {
        let mut guard = self.pending.lock().expect("task queue mutex poisoned");
        std::mem::take(&mut *guard)
    }

    /// Writes to the wakeup eventfd. Safe to call from any thread -- a raw
    /// `write(2)` on the fd number, not a handle with any shared state.
    pub fn wake(&self) {
        let one: u64 = 1;
        if let Err(e) = crate::sys::syscall!(write(
            self.wakeup_fd,
            &one as *const u64 as *const libc::c_void,
            8
        )) {
            tracing::error!(error = %e, "eventfd wakeup write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn swap_returns_all_pushed_tasks_in_order() {
        let queue = TaskQueue::new(-1, std::thread::current().id());
        let order = Rc::new(Cell::new(Vec::<i32>::new()));
        // Tasks here never touch their `&Rc<RefCell<EventLoopInner>>`
        // argument, so passing a dangling placeholder address would be
        // unsound; instead this test only exercises push/swap ordering.
        for i in 0..3 {
            let order = order.clone();
            queue.push(Task::new(move |_loop_rc| {
                let mut v = order.take();
                v.push(i);
                order.set(v);
            }));
        }
        assert_eq!(queue.swap().len(), 3);
    }

    #[test]
    fn swap_leaves_queue_empty() {
        let queue = TaskQueue::new(-1, std::thread::current().id());
        queue.push(Task::new(|_| {}));
        let _ = queue.swap();
        assert_eq!(queue.swap().len(), 0);
    }
}
