//! Hashed timing wheel for delayed tasks.
//!
//! The wheel has `size` slots of `tick` granularity. A task due further
//! out than one revolution sits in its slot with a round counter that is
//! decremented on every pass. A ticker thread advances the wheel once per
//! tick; due tasks run on that thread after the wheel lock is released.
//!
//! - Schedule: O(1)
//! - Cancel: O(1), the stale slot entry is skipped when its slot fires
//! - Tick: O(entries in the slot)

use crate::error::OptionsError;
use slab::Slab;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// A delayed task.
pub type Task = Box<dyn FnOnce() + Send>;

/// Handle returned by `schedule`, used to cancel a pending task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId {
    key: usize,
    seq: u64,
}

struct Entry {
    seq: u64,
    rounds: usize,
    task: Task,
}

struct Wheel {
    slots: Vec<Vec<TimerId>>,
    entries: Slab<Entry>,
    cursor: usize,
    /// Time of the last processed tick.
    current: Instant,
    next_seq: u64,
}

impl Wheel {
    /// Move forward one tick and collect the tasks that are due.
    fn step(&mut self, due: &mut Vec<Task>) {
        self.cursor = (self.cursor + 1) % self.slots.len();
        let ids = std::mem::take(&mut self.slots[self.cursor]);
        let mut keep = Vec::new();

        for id in ids {
            let Some(entry) = self.entries.get_mut(id.key) else {
                continue;
            };
            if entry.seq != id.seq {
                // Cancelled and the key was reused.
                continue;
            }
            if entry.rounds == 0 {
                due.push(self.entries.remove(id.key).task);
            } else {
                entry.rounds -= 1;
                keep.push(id);
            }
        }

        self.slots[self.cursor] = keep;
    }
}

struct Ticker {
    stop_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

/// Delayed-task scheduler shared by the engine and its reactor.
pub struct TimingWheel {
    tick: Duration,
    wheel: Arc<Mutex<Wheel>>,
    ticker: Mutex<Option<Ticker>>,
}

impl TimingWheel {
    /// Create a stopped wheel with `size` slots of `tick` each.
    pub fn new(tick: Duration, size: usize) -> Result<Self, OptionsError> {
        if tick.is_zero() {
            return Err(OptionsError::ZeroTick);
        }
        if size == 0 {
            return Err(OptionsError::ZeroWheelSize);
        }
        let mut slots = Vec::with_capacity(size);
        slots.resize_with(size, Vec::new);

        Ok(Self {
            tick,
            wheel: Arc::new(Mutex::new(Wheel {
                slots,
                entries: Slab::new(),
                cursor: 0,
                current: Instant::now(),
                next_seq: 0,
            })),
            ticker: Mutex::new(None),
        })
    }

    /// Granularity of the wheel.
    pub fn tick(&self) -> Duration {
        self.tick
    }

    /// Time of the last processed tick.
    pub fn current(&self) -> Instant {
        lock(&self.wheel).current
    }

    /// Run `task` after `delay`, rounded up to the next tick.
    ///
    /// Delays too large to represent as an `Instant` park the task on the
    /// furthest round the wheel can count.
    pub fn schedule<F>(&self, delay: Duration, task: F) -> TimerId
    where
        F: FnOnce() + Send + 'static,
    {
        let mut wheel = lock(&self.wheel);
        let ahead = Instant::now()
            .saturating_duration_since(wheel.current)
            .saturating_add(delay);
        self.insert(&mut wheel, ahead, Box::new(task))
    }

    /// Run `task` at the first tick at or after `deadline`.
    pub fn schedule_at<F>(&self, deadline: Instant, task: F) -> TimerId
    where
        F: FnOnce() + Send + 'static,
    {
        let mut wheel = lock(&self.wheel);
        let ahead = deadline.saturating_duration_since(wheel.current);
        self.insert(&mut wheel, ahead, Box::new(task))
    }

    /// Place `task` `ahead` of the last processed tick.
    fn insert(&self, wheel: &mut Wheel, ahead: Duration, task: Task) -> TimerId {
        let size = wheel.slots.len();
        let ticks = ahead.as_nanos().div_ceil(self.tick.as_nanos()).max(1);
        let ticks = usize::try_from(ticks).unwrap_or(usize::MAX);

        let slot = (wheel.cursor + ticks % size) % size;
        let rounds = (ticks - 1) / size;

        let seq = wheel.next_seq;
        wheel.next_seq += 1;
        let key = wheel.entries.insert(Entry { seq, rounds, task });
        let id = TimerId { key, seq };
        wheel.slots[slot].push(id);

        trace!(ticks, slot, rounds, "Timer scheduled");
        id
    }

    /// Cancel a pending task. Returns false if it already ran or was
    /// cancelled.
    pub fn cancel(&self, id: TimerId) -> bool {
        let mut wheel = lock(&self.wheel);
        match wheel.entries.get(id.key) {
            Some(entry) if entry.seq == id.seq => {
                wheel.entries.remove(id.key);
                true
            }
            _ => false,
        }
    }

    /// Number of tasks waiting to run.
    pub fn pending(&self) -> usize {
        lock(&self.wheel).entries.len()
    }

    /// Process every tick up to `now` and run the tasks that came due.
    ///
    /// Returns the number of tasks run.
    pub fn advance_to(&self, now: Instant) -> usize {
        advance(&self.wheel, self.tick, now)
    }

    /// Start the ticker thread. Starting a running wheel is a no-op.
    pub fn start(&self) -> std::io::Result<()> {
        let mut ticker = lock(&self.ticker);
        if ticker.is_some() {
            return Ok(());
        }

        // Ticks that passed while stopped are skipped, not replayed.
        lock(&self.wheel).current = Instant::now();

        let (stop_tx, stop_rx) = mpsc::channel();
        let wheel = Arc::clone(&self.wheel);
        let tick = self.tick;
        let handle = thread::Builder::new()
            .name("timing-wheel".to_string())
            .spawn(move || loop {
                match stop_rx.recv_timeout(tick) {
                    Err(RecvTimeoutError::Timeout) => {
                        advance(&wheel, tick, Instant::now());
                    }
                    _ => break,
                }
            })?;

        *ticker = Some(Ticker { stop_tx, handle });
        debug!(tick_ms = tick.as_millis() as u64, "Timing wheel started");
        Ok(())
    }

    /// Stop the ticker thread. Pending tasks stay scheduled.
    ///
    /// From a task running on the ticker thread, the thread is signalled but
    /// not joined; it exits once the task returns.
    pub fn stop(&self) {
        let Some(ticker) = lock(&self.ticker).take() else {
            return;
        };
        let _ = ticker.stop_tx.send(());
        if ticker.handle.thread().id() != thread::current().id() {
            let _ = ticker.handle.join();
        }
        debug!(pending = self.pending(), "Timing wheel stopped");
    }

    pub fn is_running(&self) -> bool {
        lock(&self.ticker).is_some()
    }
}

impl Drop for TimingWheel {
    fn drop(&mut self) {
        self.stop();
    }
}

fn advance(wheel: &Mutex<Wheel>, tick: Duration, now: Instant) -> usize {
    let mut due = Vec::new();
    {
        let mut wheel = lock(wheel);
        while wheel.current + tick <= now {
            wheel.current += tick;
            wheel.step(&mut due);
        }
    }

    let count = due.len();
    for task in due {
        task();
    }
    count
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
