//! Event loop properties from the testable-properties list: `run_in_loop`
//! dispatch semantics and bounded-time `quit()` from another thread.

use std::cell::Cell;
use std::rc::Rc;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use reactord::event_loop::EventLoopInner;
use reactord::EventLoop;

#[test]
fn run_in_loop_from_own_thread_executes_synchronously() {
    let event_loop = EventLoop::new();
    let counter = Rc::new(Cell::new(0));

    let c = counter.clone();
    EventLoopInner::run_in_loop(event_loop.inner(), move |_| {
        c.set(c.get() + 1);
    });

    assert_eq!(counter.get(), 1, "same-thread run_in_loop must run before returning");
}

#[test]
fn run_in_loop_from_another_thread_runs_exactly_once() {
    let (tx, rx) = mpsc::channel();
    let handle_thread = std::thread::spawn(move || {
        let event_loop = EventLoop::new();
        tx.send(event_loop.handle()).unwrap();
        event_loop.run();
    });

    let handle = rx.recv().unwrap();
    let calls = Arc::new(Mutex::new(0));
    let calls2 = calls.clone();
    handle.queue_in_loop(move |_| {
        *calls2.lock().unwrap() += 1;
    });

    // Give the worker a chance to drain its pending-task queue, then quit it.
    std::thread::sleep(Duration::from_millis(100));
    handle.quit();
    handle_thread.join().unwrap();

    assert_eq!(*calls.lock().unwrap(), 1);
}

#[test]
fn quit_from_another_thread_returns_in_bounded_time() {
    let (tx, rx) = mpsc::channel();
    let handle_thread = std::thread::spawn(move || {
        let event_loop = EventLoop::new();
        tx.send(event_loop.handle()).unwrap();
        event_loop.run();
    });

    let handle = rx.recv().unwrap();
    std::thread::sleep(Duration::from_millis(20));

    let start = Instant::now();
    handle.quit();
    handle_thread.join().unwrap();

    assert!(start.elapsed() < Duration::from_secs(2), "quit() should wake the loop immediately, not wait out the poll ceiling");
}
