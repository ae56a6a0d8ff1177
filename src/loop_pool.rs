//! Fixed pool of loop-per-thread workers sitting behind one acceptor loop.
//!
//! Mirrors `EventLoopThreadPool`/`EventLoopThread`: each worker thread
//! constructs its own `EventLoop` -- an `EventLoop` is `!Send`, so it can
//! only ever be built on the thread that runs it -- and reports a
//! [`LoopHandle`] back once alive, the same handoff `EventLoopThread::startLoop`
//! makes with a mutex/condvar pair; a channel plays that role here. Callers
//! only ever get a `LoopHandle` back, never the loop itself, since the pool
//! and its caller typically live on a different thread than the worker.

use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;

use crate::event_loop::{EventLoop, LoopHandle};

pub type ThreadInitCallback = Arc<dyn Fn(&EventLoop) + Send + Sync>;

pub struct LoopPool {
    name: String,
    num_threads: usize,
    started: bool,
    next: usize,
    threads: Vec<JoinHandle<()>>,
    handles: Vec<LoopHandle>,
    base_handle: LoopHandle,
}

impl LoopPool {
    pub fn new(base: &EventLoop, name: impl Into<String>) -> LoopPool {
        LoopPool {
            name: name.into(),
            num_threads: 0,
            started: false,
            next: 0,
            threads: Vec::new(),
            handles: Vec::new(),
            base_handle: base.handle(),
        }
    }

    pub fn set_thread_num(&mut self, n: usize) {
        self.num_threads = n;
    }

    pub fn started(&self) -> bool {
        self.started
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spawns `num_threads` worker threads, each running its own `EventLoop`
    /// to completion; with zero worker threads every connection is handled
    /// on `base` instead, matching the single-threaded collapse the original
    /// makes by calling `cb(baseLoop_)` directly.
    pub fn start(&mut self, base: &EventLoop, init: Option<ThreadInitCallback>) {
        assert!(!self.started, "loop pool already started");
        self.started = true;

        for i in 0..self.num_threads {
            let thread_name = format!("{}{}", self.name, i);
            let init = init.clone();
            let (tx, rx) = mpsc::channel::<LoopHandle>();

            let join = std::thread::Builder::new()
                .name(thread_name.clone())
                .spawn(move || {
                    let event_loop = EventLoop::new();
                    if let Some(init) = &init {
                        init(&event_loop);
                    }
                    tx.send(event_loop.handle())
                        .expect("pool base thread gone before loop started");
                    event_loop.run();
                })
                .unwrap_or_else(|e| crate::error::fatal("spawning event loop thread", &e));

            let handle = rx
                .recv()
                .expect("event loop thread died before reporting its handle");
            self.threads.push(join);
            self.handles.push(handle);
        }

        if self.num_threads == 0 {
            if let Some(init) = init {
                init(base);
            }
        }
    }

    /// Every worker loop's handle, in spawn order; empty if `num_threads`
    /// is zero. Lets a caller that needs its own round-robin cursor (the
    /// server's per-connection dispatch) take a snapshot once instead of
    /// calling `get_next_loop` and reconstructing the set from its output.
    pub fn handles(&self) -> Vec<LoopHandle> {
        self.handles.clone()
    }

    /// Round-robins across worker loops; returns the base loop's handle
    /// untouched when the pool has no workers.
    pub fn get_next_loop(&mut self) -> LoopHandle {
        assert!(self.started, "loop pool not started");
        if self.handles.is_empty() {
            return self.base_handle.clone();
        }
        let handle = self.handles[self.next].clone();
        self.next = (self.next + 1) % self.handles.len();
        handle
    }

    pub fn get_loop_from_hash(&self, hash: usize) -> LoopHandle {
        assert!(self.started, "loop pool not started");
        if self.handles.is_empty() {
            return self.base_handle.clone();
        }
        self.handles[hash % self.handles.len()].clone()
    }
}

impl Drop for LoopPool {
    fn drop(&mut self) {
        for handle in &self.handles {
            handle.quit();
        }
        for join in self.threads.drain(..) {
            let _ = join.join();
        }
    }
}
