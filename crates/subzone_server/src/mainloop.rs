//! The mainloop: one cooperative thread that owns all gameplay mutation,
//! plus the blocking worker pool that feeds results back to it.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use tracing::{error, warn};

/// Groups timers under one owner so they can be cleared together. The same
/// handler scheduled for many entities uses one key per entity.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct TimerKey(pub u64);

impl TimerKey {
    /// A fresh process-unique key.
    pub fn unique() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Timer classes: when both are due, mainloop timers run before server
/// timers.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum TimerKind {
    Mainloop,
    Server,
}

type TimerFn = Box<dyn FnMut() -> bool + Send>;
type WorkFn = Box<dyn FnOnce() + Send>;

struct TimerEntry {
    id: u64,
    key: TimerKey,
    kind: TimerKind,
    due: Instant,
    period: Duration,
    seq: u64,
    f: TimerFn,
}

struct Shared {
    work_tx: flume::Sender<WorkFn>,
    timers: Mutex<Vec<TimerEntry>>,
    /// Keys cleared while their timer was executing; checked before a
    /// repeating timer is rescheduled.
    cleared: Mutex<FxHashSet<u64>>,
    stop: AtomicBool,
    next_id: AtomicU64,
}

/// A cloneable handle for submitting work and timers from any thread.
#[derive(Clone)]
pub struct MainloopHandle {
    shared: Arc<Shared>,
}

impl MainloopHandle {
    /// Enqueues a closure to run on the mainloop thread.
    pub fn submit(&self, f: impl FnOnce() + Send + 'static) {
        if self.shared.work_tx.send(Box::new(f)).is_err() {
            warn!("work item submitted after mainloop shutdown");
        }
    }

    /// Schedules a timer. The first invocation fires after `initial`;
    /// subsequent ones fire `period` after the previous invocation started.
    /// The handler returning `false` removes the timer.
    pub fn set_timer(
        &self,
        kind: TimerKind,
        key: TimerKey,
        initial: Duration,
        period: Duration,
        f: impl FnMut() -> bool + Send + 'static,
    ) -> u64 {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let seq = id;
        self.shared.timers.lock().push(TimerEntry {
            id,
            key,
            kind,
            due: Instant::now() + initial,
            period,
            seq,
            f: Box::new(f),
        });
        id
    }

    /// Removes every pending timer registered under `key`, including one
    /// currently executing (it will not reschedule).
    pub fn clear_timers(&self, key: TimerKey) {
        self.shared.timers.lock().retain(|t| t.key != key);
        self.shared.cleared.lock().insert(key.0);
    }

    /// Removes one timer by the id `set_timer` returned.
    pub fn clear_timer(&self, id: u64) {
        self.shared.timers.lock().retain(|t| t.id != id);
    }

    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        // Nudge the loop out of its wait.
        let _ = self.shared.work_tx.send(Box::new(|| {}));
    }
}

/// The dispatch loop itself. Owns the receiving end of the work queue; the
/// thread that calls [`run`](Mainloop::run) becomes the mainloop thread.
pub struct Mainloop {
    shared: Arc<Shared>,
    work_rx: flume::Receiver<WorkFn>,
}

impl Default for Mainloop {
    fn default() -> Self {
        Self::new()
    }
}

impl Mainloop {
    pub fn new() -> Self {
        let (work_tx, work_rx) = flume::unbounded();
        Self {
            shared: Arc::new(Shared {
                work_tx,
                timers: Mutex::new(Vec::new()),
                cleared: Mutex::new(FxHashSet::default()),
                stop: AtomicBool::new(false),
                next_id: AtomicU64::new(1),
            }),
            work_rx,
        }
    }

    pub fn handle(&self) -> MainloopHandle {
        MainloopHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Runs until [`MainloopHandle::stop`] is called.
    pub fn run(&mut self) {
        while !self.shared.stop.load(Ordering::SeqCst) {
            let now = Instant::now();
            self.run_due_timers(now);
            self.drain_work();

            let wait = self
                .next_due()
                .map(|due| due.saturating_duration_since(Instant::now()))
                .unwrap_or(Duration::from_millis(10))
                .min(Duration::from_millis(10));

            match self.work_rx.recv_timeout(wait) {
                Ok(f) => run_work(f),
                Err(flume::RecvTimeoutError::Timeout) => {}
                Err(flume::RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    /// A single cooperative step: timers, then queued work. Tests and
    /// embedders that own their own loop call this instead of [`run`].
    pub fn step(&mut self, now: Instant) {
        self.run_due_timers(now);
        self.drain_work();
    }

    fn next_due(&self) -> Option<Instant> {
        self.shared.timers.lock().iter().map(|t| t.due).min()
    }

    fn run_due_timers(&mut self, now: Instant) {
        loop {
            // Pick the single most urgent due timer: mainloop kind first,
            // then earliest deadline, insertion order breaking ties.
            let mut entry = {
                let mut timers = self.shared.timers.lock();
                let best = timers
                    .iter()
                    .enumerate()
                    .filter(|(_, t)| t.due <= now)
                    .min_by_key(|(_, t)| (t.kind == TimerKind::Server, t.due, t.seq))
                    .map(|(i, _)| i);
                match best {
                    Some(i) => timers.swap_remove(i),
                    None => break,
                }
            };

            let started = entry.due;
            let keep = catch_unwind(AssertUnwindSafe(|| (entry.f)())).unwrap_or_else(|_| {
                error!("timer handler panicked; timer removed");
                false
            });

            let was_cleared = self.shared.cleared.lock().remove(&entry.key.0);
            if keep && !was_cleared {
                // Period measured from the start of this invocation.
                entry.due = started + entry.period;
                if entry.due <= now {
                    // Never let a slow handler starve the loop.
                    entry.due = now + entry.period;
                }
                self.shared.timers.lock().push(entry);
            }
        }
        self.shared.cleared.lock().clear();
    }

    fn drain_work(&mut self) {
        for _ in 0..self.work_rx.len() {
            match self.work_rx.try_recv() {
                Ok(f) => run_work(f),
                Err(_) => break,
            }
        }
    }
}

fn run_work(f: WorkFn) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        error!("work item panicked");
    }
}

/// A fixed pool of threads for blocking operations (disk, database,
/// config). Results come back to the mainloop as work items; completions
/// must re-check that their target still exists.
pub struct WorkerPool {
    tx: flume::Sender<WorkFn>,
}

impl WorkerPool {
    pub fn new(threads: usize) -> Self {
        let (tx, rx) = flume::unbounded::<WorkFn>();
        for i in 0..threads.max(1) {
            let rx = rx.clone();
            std::thread::Builder::new()
                .name(format!("subzone-worker-{i}"))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        if catch_unwind(AssertUnwindSafe(job)).is_err() {
                            error!("worker job panicked");
                        }
                    }
                })
                .expect("spawning worker thread");
        }
        Self { tx }
    }

    pub fn submit(&self, f: impl FnOnce() + Send + 'static) {
        if self.tx.send(Box::new(f)).is_err() {
            warn!("job submitted after worker pool shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn timers_fire_in_priority_then_insertion_order() {
        let mut ml = Mainloop::new();
        let handle = ml.handle();
        let log = Arc::new(Mutex::new(Vec::new()));

        let due = Duration::ZERO;
        for (kind, tag) in [
            (TimerKind::Server, "s1"),
            (TimerKind::Mainloop, "m1"),
            (TimerKind::Server, "s2"),
            (TimerKind::Mainloop, "m2"),
        ] {
            let log = Arc::clone(&log);
            handle.set_timer(kind, TimerKey::unique(), due, Duration::from_secs(60), move || {
                log.lock().push(tag);
                false
            });
        }

        ml.step(Instant::now() + Duration::from_millis(1));
        assert_eq!(*log.lock(), vec!["m1", "m2", "s1", "s2"]);
    }

    #[test]
    fn repeating_timer_reschedules_until_false() {
        let mut ml = Mainloop::new();
        let handle = ml.handle();
        let count = Arc::new(AtomicU32::new(0));

        let c = Arc::clone(&count);
        handle.set_timer(
            TimerKind::Mainloop,
            TimerKey::unique(),
            Duration::ZERO,
            Duration::from_millis(5),
            move || c.fetch_add(1, Ordering::SeqCst) < 2,
        );

        let t0 = Instant::now();
        ml.step(t0 + Duration::from_millis(1));
        ml.step(t0 + Duration::from_millis(20));
        ml.step(t0 + Duration::from_millis(40));
        ml.step(t0 + Duration::from_millis(60));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn clear_timers_by_key() {
        let mut ml = Mainloop::new();
        let handle = ml.handle();
        let count = Arc::new(AtomicU32::new(0));

        let key = TimerKey::unique();
        for _ in 0..3 {
            let c = Arc::clone(&count);
            handle.set_timer(TimerKind::Mainloop, key, Duration::ZERO, Duration::ZERO, move || {
                c.fetch_add(1, Ordering::SeqCst);
                true
            });
        }
        handle.clear_timers(key);

        ml.step(Instant::now() + Duration::from_millis(1));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn panicking_timer_is_removed() {
        let mut ml = Mainloop::new();
        let handle = ml.handle();
        handle.set_timer(
            TimerKind::Mainloop,
            TimerKey::unique(),
            Duration::ZERO,
            Duration::ZERO,
            || panic!("boom"),
        );

        let now = Instant::now() + Duration::from_millis(1);
        ml.step(now);
        ml.step(now + Duration::from_millis(1));
    }

    #[test]
    fn work_items_run_on_step() {
        let mut ml = Mainloop::new();
        let handle = ml.handle();
        let hit = Arc::new(AtomicU32::new(0));

        let h = Arc::clone(&hit);
        handle.submit(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });

        ml.step(Instant::now());
        assert_eq!(hit.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn worker_pool_posts_back() {
        let mut ml = Mainloop::new();
        let handle = ml.handle();
        let pool = WorkerPool::new(2);
        let hit = Arc::new(AtomicU32::new(0));

        let h = Arc::clone(&hit);
        pool.submit(move || {
            let h2 = Arc::clone(&h);
            handle.submit(move || {
                h2.fetch_add(1, Ordering::SeqCst);
            });
        });

        // Give the worker a moment, then drain.
        std::thread::sleep(Duration::from_millis(50));
        ml.step(Instant::now());
        assert_eq!(hit.load(Ordering::SeqCst), 1);
    }
}
