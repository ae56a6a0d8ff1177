//! Timer queue properties: cancel-before-fire, repeat-rate lower bound, and
//! cancel-during-own-callback semantics, all driven by a real `EventLoop`
//! rather than mocked expiration math.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use reactord::event_loop::EventLoopInner;
use reactord::EventLoop;

#[test]
fn cancelling_before_fire_time_prevents_the_callback() {
    let event_loop = EventLoop::new();
    let inner = event_loop.inner();
    let fired = Arc::new(AtomicUsize::new(0));

    let f = fired.clone();
    let id = EventLoopInner::run_after(inner, 0.2, Box::new(move || {
        f.fetch_add(1, Ordering::SeqCst);
    }));
    EventLoopInner::cancel_timer(inner, id);

    EventLoopInner::run_after(inner, 0.05, Box::new({
        let inner = inner.clone();
        move || EventLoopInner::quit(&inner)
    }));
    event_loop.run();

    assert_eq!(fired.load(Ordering::SeqCst), 0);
}

#[test]
fn repeating_timer_fires_at_least_floor_t_over_d_times() {
    let event_loop = EventLoop::new();
    let inner = event_loop.inner();
    let fired = Arc::new(AtomicUsize::new(0));

    let interval = 0.03;
    let window = 0.3;

    let f = fired.clone();
    EventLoopInner::run_every(inner, interval, Box::new(move || {
        f.fetch_add(1, Ordering::SeqCst);
    }));

    EventLoopInner::run_after(inner, window, Box::new({
        let inner = inner.clone();
        move || EventLoopInner::quit(&inner)
    }));
    event_loop.run();

    let expected_min = (window / interval).floor() as usize;
    assert!(
        fired.load(Ordering::SeqCst) + 1 >= expected_min,
        "expected at least {expected_min} fires, got {}",
        fired.load(Ordering::SeqCst)
    );
}

#[test]
fn cancelling_during_its_own_callback_suppresses_the_next_repeat_only() {
    let event_loop = EventLoop::new();
    let inner = event_loop.inner();
    let fired = Rc::new(RefCell::new(0usize));
    let self_id = Rc::new(RefCell::new(None));

    let f = fired.clone();
    let self_id_for_cb = self_id.clone();
    let inner_for_cb = inner.clone();
    let id = EventLoopInner::run_every(inner, 0.03, Box::new(move || {
        *f.borrow_mut() += 1;
        if let Some(id) = *self_id_for_cb.borrow() {
            EventLoopInner::cancel_timer(&inner_for_cb, id);
        }
    }));
    *self_id.borrow_mut() = Some(id);

    EventLoopInner::run_after(inner, 0.2, Box::new({
        let inner = inner.clone();
        move || EventLoopInner::quit(&inner)
    }));
    event_loop.run();

    assert_eq!(*fired.borrow(), 1, "the first firing must complete, but no repeat should follow cancellation");
}
