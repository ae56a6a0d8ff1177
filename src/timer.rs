//! Ordered timer set backed by one `timerfd` per loop.
//!
//! Mirrors `TimerQueue`/`Timer`/`TimerId` closely: an ordered index keyed by
//! `(expiration, sequence)`, a separate active-set for O(log n) cancellation
//! lookup, and a cancelling-set that survives only for the duration of one
//! `handle_read` so a repeat can be suppressed without disturbing the timer
//! that is currently firing.
//!
//! Open Question (recorded in DESIGN.md): the original's `TimerId` pairs a
//! raw `Timer*` with a sequence number because a freed pointer can be reused.
//! Timers here are owned by a `HashMap<i64, TimerRecord>` keyed by that same
//! sequence, so the sequence alone is already a stable, never-reused
//! identity -- the pointer half of the pair has no Rust equivalent worth
//! inventing.

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::os::unix::io::AsRawFd;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicI64, Ordering};

use crate::channel::{self, Channel};
use crate::event_loop::EventLoopInner;
use crate::sys::timerfd::{Clock, SetTimeFlags, TimerFd, TimerSpec, TFD_CLOEXEC, TFD_NONBLOCK};
use crate::time::Timestamp;

static NEXT_SEQUENCE: AtomicI64 = AtomicI64::new(0);

fn next_sequence() -> i64 {
    NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed)
}

pub type TimerCallback = Box<dyn FnMut()>;

/// Opaque handle returned by `add_timer`, needed only to `cancel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(i64);

pub(crate) struct TimerRecord {
    callback: TimerCallback,
    expiration: Timestamp,
    interval: f64,
    repeat: bool,
    sequence: i64,
}

impl TimerRecord {
    /// Builds a record and its caller-facing `TimerId` in one step -- the
    /// scheduling entry points (`EventLoop::run_at` and friends) only ever
    /// need the pair together.
    pub(crate) fn new(callback: TimerCallback, expiration: Timestamp, interval: f64) -> (TimerRecord, TimerId) {
        let sequence = next_sequence();
        let record = TimerRecord {
            callback,
            expiration,
            interval,
            repeat: interval > 0.0,
            sequence,
        };
        (record, TimerId(sequence))
    }

    fn restart(&mut self, now: Timestamp) {
        if self.repeat {
            self.expiration = now.add_seconds(self.interval);
        } else {
            self.expiration = Timestamp::new(0);
        }
    }
}

pub struct TimerQueue {
    timerfd: TimerFd,
    channel: Rc<RefCell<Channel>>,
    ordered: BTreeSet<(Timestamp, i64)>,
    entries: HashMap<i64, TimerRecord>,
    active: HashSet<i64>,
    cancelling: HashSet<i64>,
    calling_expired: bool,
    pending_expired: Vec<i64>,
}

impl TimerQueue {
    pub fn new(loop_: Weak<RefCell<EventLoopInner>>) -> std::io::Result<TimerQueue> {
        let timerfd = TimerFd::create(Clock::Monotonic, TFD_CLOEXEC | TFD_NONBLOCK)?;
        let channel = Channel::new(loop_.clone(), timerfd.as_raw_fd());

        // Split in two so no expired callback runs while `EventLoopInner`'s
        // `RefCell` is borrowed -- a callback that cancels its own repeat
        // (or schedules a new timer) needs to reach the loop itself, and a
        // borrow held across the callback would make that a double
        // mutable borrow. `TcpConnection::handle_read` uses the same
        // short-borrow shape for its own message callback.
        let weak_loop = loop_;
        channel.borrow_mut().set_read_callback(Box::new(move |now| {
            if let Some(loop_rc) = weak_loop.upgrade() {
                EventLoopInner::assert_in_loop_thread(&loop_rc);
                let mut callbacks = {
                    let mut inner = loop_rc.borrow_mut();
                    inner.timer_queue_mut().begin_expired(now)
                };
                for (_, cb) in callbacks.iter_mut() {
                    cb();
                }
                let mut inner = loop_rc.borrow_mut();
                inner.timer_queue_mut().finish_expired(now, callbacks);
            }
        }));

        Ok(TimerQueue {
            timerfd,
            channel,
            ordered: BTreeSet::new(),
            entries: HashMap::new(),
            active: HashSet::new(),
            cancelling: HashSet::new(),
            calling_expired: false,
            pending_expired: Vec::new(),
        })
    }

    /// The timerfd's channel, registered for reading once the owning loop
    /// is fully constructed -- `new` itself cannot do this, since the
    /// `Weak` it holds cannot yet be upgraded.
    pub fn channel(&self) -> &Rc<RefCell<Channel>> {
        &self.channel
    }

    /// Inserts `record`, reprogramming the timerfd if it is now the
    /// earliest entry. Must run on the owning loop thread.
    pub(crate) fn add_timer_in_loop(&mut self, record: TimerRecord) {
        let earliest_changed = self.insert(record);
        if earliest_changed {
            if let Some(&(expiration, _)) = self.ordered.iter().next() {
                self.reset_timerfd(expiration);
            }
        }
    }

    pub(crate) fn cancel_in_loop(&mut self, id: TimerId) {
        debug_assert_eq!(self.ordered.len(), self.active.len());

        if self.active.remove(&id.0) {
            if let Some(record) = self.entries.get(&id.0) {
                let removed = self.ordered.remove(&(record.expiration, id.0));
                debug_assert!(removed);
            }
            self.entries.remove(&id.0);
        } else if self.calling_expired {
            self.cancelling.insert(id.0);
        }

        debug_assert_eq!(self.ordered.len(), self.active.len());
    }

    fn insert(&mut self, record: TimerRecord) -> bool {
        debug_assert_eq!(self.ordered.len(), self.active.len());

        let when = record.expiration;
        let sequence = record.sequence;
        let earliest_changed = self.ordered.iter().next().map(|&(t, _)| when < t).unwrap_or(true);

        let inserted = self.ordered.insert((when, sequence));
        debug_assert!(inserted);
        let inserted = self.active.insert(sequence);
        debug_assert!(inserted);
        self.entries.insert(sequence, record);

        debug_assert_eq!(self.ordered.len(), self.active.len());
        earliest_changed
    }

    /// Marks the due timers expired and hands their callbacks out for the
    /// caller to run with no borrow of `EventLoopInner` held. Each record
    /// keeps its slot in `entries` (a placeholder no-op callback fills it
    /// meanwhile) so a reentrant `cancel` during the callback still finds
    /// it and can fall through to the `calling_expired` / `cancelling` path.
    pub(crate) fn begin_expired(&mut self, now: Timestamp) -> Vec<(i64, TimerCallback)> {
        self.read_timerfd(now);
        let expired = self.get_expired(now);

        self.calling_expired = true;
        let callbacks = expired
            .iter()
            .filter_map(|sequence| {
                let record = self.entries.get_mut(sequence)?;
                Some((*sequence, std::mem::replace(&mut record.callback, Box::new(|| {}))))
            })
            .collect();
        self.pending_expired = expired;
        callbacks
    }

    /// Restores each callback into its record, then reinserts repeats and
    /// clears the per-firing cancelling set.
    pub(crate) fn finish_expired(&mut self, now: Timestamp, callbacks: Vec<(i64, TimerCallback)>) {
        for (sequence, cb) in callbacks {
            if let Some(record) = self.entries.get_mut(&sequence) {
                record.callback = cb;
            }
        }
        self.calling_expired = false;

        let expired = std::mem::take(&mut self.pending_expired);
        self.reset(expired, now);
        self.cancelling.clear();
    }

    fn get_expired(&mut self, now: Timestamp) -> Vec<i64> {
        debug_assert_eq!(self.ordered.len(), self.active.len());

        let sentry = (now, i64::MAX);
        let expired: Vec<(Timestamp, i64)> = self
            .ordered
            .range(..=sentry)
            .filter(|&&(t, _)| t <= now)
            .cloned()
            .collect();

        for &(t, sequence) in &expired {
            self.ordered.remove(&(t, sequence));
            self.active.remove(&sequence);
        }

        debug_assert_eq!(self.ordered.len(), self.active.len());
        expired.into_iter().map(|(_, seq)| seq).collect()
    }

    fn reset(&mut self, expired: Vec<i64>, now: Timestamp) {
        for sequence in expired {
            let Some(mut record) = self.entries.remove(&sequence) else {
                continue;
            };
            if record.repeat && !self.cancelling.contains(&sequence) {
                record.restart(now);
                self.insert(record);
            }
        }

        if let Some(&(next_expire, _)) = self.ordered.iter().next() {
            self.reset_timerfd(next_expire);
        }
    }

    fn reset_timerfd(&self, expiration: Timestamp) {
        let spec = TimerSpec {
            interval: std::time::Duration::ZERO,
            value: how_much_time_from_now(expiration),
        };
        if let Err(e) = self.timerfd.settime(spec, SetTimeFlags::Default) {
            tracing::error!(error = %e, "timerfd_settime failed");
        }
    }

    fn read_timerfd(&self, now: Timestamp) {
        match self.timerfd.read() {
            Ok(howmany) => tracing::trace!(howmany, at = %now, "timer queue woke up"),
            Err(e) => tracing::error!(error = %e, "timerfd read failed"),
        }
    }
}

impl Drop for TimerQueue {
    fn drop(&mut self) {
        channel::disable_all(&self.channel);
        channel::remove(&self.channel);
    }
}

/// Minimum 100us to-fire, matching `howMuchTimeFromNow`'s floor against the
/// kernel's minimum timer resolution.
fn how_much_time_from_now(expiration: Timestamp) -> std::time::Duration {
    let mut micros = expiration.micros_since_epoch() - Timestamp::now().micros_since_epoch();
    if micros < 100 {
        micros = 100;
    }
    std::time::Duration::from_micros(micros as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn how_much_time_from_now_floors_at_100_micros() {
        let now = Timestamp::now();
        let d = how_much_time_from_now(now);
        assert!(d.as_micros() >= 100);
    }
}
