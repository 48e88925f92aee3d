//! TTL-based context expiry.
//!
//! The [`Reaper`] keeps a time-ordered schedule of context ids. A background
//! thread wakes on a coarse tick, drops bookkeeping for contexts that were
//! already destroyed, and invokes a reap callback for every entry whose
//! expiry has passed.
//!
//! The schedule never holds a reference to a context, only its id. Contexts
//! report their own destruction through [`Reaper::self_reaped`]; those reports
//! are queued under a separate lock so a decode thread can make one while
//! the reaper thread holds the schedule lock.

use std::collections::{BTreeSet, HashMap};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crossbeam::channel::{self, Sender};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::context::ContextId;

/// Source of the current time, in whole seconds.
pub trait Clock: Send + Sync {
    fn now(&self) -> u64;
}

/// Wall-clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

/// A clock that only moves when told to. Used for deterministic expiry.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start: u64) -> Self {
        Self {
            now: AtomicU64::new(start),
        }
    }

    pub fn advance(&self, secs: u64) {
        self.now.fetch_add(secs, Ordering::SeqCst);
    }

    pub fn set(&self, secs: u64) {
        self.now.store(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
struct Schedule {
    expiry: HashMap<ContextId, u64>,
    order: BTreeSet<(u64, ContextId)>,
}

impl Schedule {
    fn remove(&mut self, id: ContextId) {
        if let Some(when) = self.expiry.remove(&id) {
            self.order.remove(&(when, id));
        }
    }

    /// Pop the earliest entry if it is due.
    fn pop_due(&mut self, now: u64) -> Option<ContextId> {
        let &(when, id) = self.order.first()?;
        if when > now {
            return None;
        }
        self.order.remove(&(when, id));
        self.expiry.remove(&id);
        Some(id)
    }
}

/// Expiry scheduler for contexts.
pub struct Reaper {
    clock: Arc<dyn Clock>,
    schedule: Mutex<Schedule>,
    reaped: Mutex<Vec<ContextId>>,
}

impl Reaper {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            schedule: Mutex::new(Schedule::default()),
            reaped: Mutex::new(Vec::new()),
        }
    }

    /// Current time according to this reaper's clock.
    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    /// Schedule (or re-arm) expiry `ttl` seconds from now.
    pub fn set_ttl(&self, id: ContextId, ttl: u64) {
        let when = self.clock.now().saturating_add(ttl);
        let mut schedule = self.schedule.lock();
        schedule.remove(id);
        schedule.expiry.insert(id, when);
        schedule.order.insert((when, id));
    }

    pub fn unset_ttl(&self, id: ContextId) {
        self.schedule.lock().remove(id);
    }

    /// Record that a context has been destroyed.
    pub fn self_reaped(&self, id: ContextId) {
        self.reaped.lock().push(id);
    }

    /// Scheduled expiry time for a context, if any.
    pub fn expiry(&self, id: ContextId) -> Option<u64> {
        self.schedule.lock().expiry.get(&id).copied()
    }

    /// Number of contexts with a scheduled expiry.
    pub fn scheduled(&self) -> usize {
        self.schedule.lock().expiry.len()
    }

    fn drain_reaped(&self) {
        let reaped = std::mem::take(&mut *self.reaped.lock());
        if reaped.is_empty() {
            return;
        }
        let mut schedule = self.schedule.lock();
        for id in reaped {
            schedule.remove(id);
        }
    }

    /// One sweep: expire every due entry, calling `reap` for each.
    ///
    /// The schedule lock is released before each callback, so `reap` may
    /// re-enter the reaper (directly or by destroying contexts).
    pub fn run_once<F>(&self, mut reap: F) -> usize
    where
        F: FnMut(ContextId),
    {
        let mut count = 0;
        loop {
            self.drain_reaped();
            let now = self.clock.now();
            let due = self.schedule.lock().pop_due(now);
            match due {
                Some(id) => {
                    trace!(context = id, "reaping expired context");
                    reap(id);
                    count += 1;
                }
                None => break,
            }
        }
        if count > 0 {
            debug!(reaped = count, "reaper sweep complete");
        }
        count
    }
}

/// Handle to a running reaper thread. The thread stops when the handle is
/// stopped or dropped.
pub struct ReaperHandle {
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl ReaperHandle {
    /// Spawn a thread that calls `sweep` once per `tick`.
    pub fn spawn<F>(tick: Duration, mut sweep: F) -> io::Result<Self>
    where
        F: FnMut() + Send + 'static,
    {
        let (stop_tx, stop_rx) = channel::bounded::<()>(1);
        let ticker = channel::tick(tick);

        let thread = thread::Builder::new()
            .name("flowprobe-reaper".to_string())
            .spawn(move || {
                debug!("reaper thread started");
                loop {
                    crossbeam::select! {
                        recv(stop_rx) -> _ => break,
                        recv(ticker) -> _ => sweep(),
                    }
                }
                debug!("reaper thread exiting");
            })?;

        Ok(Self {
            stop: Some(stop_tx),
            thread: Some(thread),
        })
    }

    /// Stop the thread and wait for it to exit.
    pub fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for ReaperHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn reaper_at(start: u64) -> (Arc<ManualClock>, Reaper) {
        let clock = Arc::new(ManualClock::new(start));
        let reaper = Reaper::new(clock.clone());
        (clock, reaper)
    }

    #[test]
    fn test_expires_after_ttl() {
        let (clock, reaper) = reaper_at(1000);
        reaper.set_ttl(7, 120);

        let mut reaped = Vec::new();
        clock.advance(119);
        assert_eq!(reaper.run_once(|id| reaped.push(id)), 0);

        clock.advance(1);
        assert_eq!(reaper.run_once(|id| reaped.push(id)), 1);
        assert_eq!(reaped, vec![7]);
        assert_eq!(reaper.scheduled(), 0);
    }

    #[test]
    fn test_refresh_keeps_entry_alive() {
        let (clock, reaper) = reaper_at(0);
        reaper.set_ttl(1, 10);

        // Refreshed every half TTL, never due.
        for _ in 0..20 {
            clock.advance(5);
            assert_eq!(reaper.run_once(|_| panic!("should not expire")), 0);
            reaper.set_ttl(1, 10);
        }
        assert_eq!(reaper.scheduled(), 1);
        assert_eq!(reaper.expiry(1), Some(110));
    }

    #[test]
    fn test_set_ttl_replaces_old_entry() {
        let (_clock, reaper) = reaper_at(0);
        reaper.set_ttl(1, 100);
        reaper.set_ttl(1, 2);
        assert_eq!(reaper.scheduled(), 1);
        assert_eq!(reaper.expiry(1), Some(2));
        assert_eq!(reaper.schedule.lock().order.len(), 1);
    }

    #[test]
    fn test_unset_ttl() {
        let (clock, reaper) = reaper_at(0);
        reaper.set_ttl(3, 1);
        reaper.unset_ttl(3);
        clock.advance(10);
        assert_eq!(reaper.run_once(|_| panic!("unset entry reaped")), 0);
    }

    #[test]
    fn test_self_reaped_entries_are_dropped_first() {
        let (clock, reaper) = reaper_at(0);
        reaper.set_ttl(1, 5);
        reaper.set_ttl(2, 5);
        reaper.self_reaped(1);
        clock.advance(5);

        let mut reaped = Vec::new();
        reaper.run_once(|id| reaped.push(id));
        assert_eq!(reaped, vec![2]);
    }

    #[test]
    fn test_reap_callback_may_report_destruction() {
        let (clock, reaper) = reaper_at(0);
        reaper.set_ttl(1, 1);
        reaper.set_ttl(2, 3);
        clock.advance(5);

        // Reaping 1 destroys 2 as a side effect (a child going with its parent).
        let mut reaped = Vec::new();
        reaper.run_once(|id| {
            reaped.push(id);
            if id == 1 {
                reaper.self_reaped(2);
            }
        });
        assert_eq!(reaped, vec![1]);
        assert_eq!(reaper.scheduled(), 0);
    }

    #[test]
    fn test_earliest_first() {
        let (clock, reaper) = reaper_at(0);
        reaper.set_ttl(10, 30);
        reaper.set_ttl(11, 10);
        reaper.set_ttl(12, 20);
        clock.advance(60);

        let mut reaped = Vec::new();
        reaper.run_once(|id| reaped.push(id));
        assert_eq!(reaped, vec![11, 12, 10]);
    }

    #[test]
    fn test_thread_sweeps_and_stops() {
        let sweeps = Arc::new(AtomicUsize::new(0));
        let counter = sweeps.clone();
        let mut handle = ReaperHandle::spawn(Duration::from_millis(5), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while sweeps.load(Ordering::SeqCst) < 2 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        handle.stop();
        assert!(sweeps.load(Ordering::SeqCst) >= 2);
    }
}
