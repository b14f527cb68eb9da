//! Pause-budget tracking (minimum mutator utilization).
//!
//! The collector promises that within any sliding window of
//! `time_slice` seconds, total pause time stays at or below
//! `max_gc_time` seconds. [`MmuTracker`] holds the recent pause history
//! in a fixed circular queue and answers the two scheduling questions the
//! pause orchestrator asks:
//!
//! - [`MmuTracker::longest_pause`]: how long may a pause starting *now*
//!   be without breaking the promise?
//! - [`MmuTracker::when_sec`]: how long must a pause of a given length
//!   wait before it may legally start?
//!
//! Timestamps are seconds as `f64`, matching the numeric fixed-point
//! search `longest_pause` runs: the in-window GC time is a non-linear
//! function of the window's right edge, so the budget is found
//! iteratively rather than in closed form.
//!
//! Admission control is not on a per-object hot path; one mutex around
//! the whole queue operation is deliberate.

use parking_lot::Mutex;

/// Capacity of the pause queue.
///
/// More pauses than this inside one time slice means the collector is
/// pausing pathologically often; see [`OverflowPolicy`].
const QUEUE_LENGTH: usize = 64;

/// Convergence tolerance for the budget search.
const EPSILON: f64 = 1.0e-6;

/// Behavior when the pause queue overflows within one time slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Treat overflow as a broken budget guarantee and abort. Default.
    #[default]
    Strict,
    /// Overwrite the oldest interval. The window's GC time is then
    /// under-counted by at most that interval's duration — a documented
    /// precision trade-off for pathological workloads, chosen over
    /// unbounded queue growth.
    Forgiving,
}

/// One completed collector pause.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PauseInterval {
    /// Pause start, seconds.
    pub start: f64,
    /// Pause end, seconds.
    pub end: f64,
}

impl PauseInterval {
    /// Length of the pause in seconds.
    #[inline]
    pub fn duration(&self) -> f64 {
        self.end - self.start
    }
}

/// Fixed circular queue of pause intervals, oldest at `tail`.
struct PauseQueue {
    entries: [PauseInterval; QUEUE_LENGTH],
    /// Index of the oldest entry.
    tail: usize,
    /// Live entries.
    len: usize,
}

impl PauseQueue {
    fn new() -> Self {
        Self {
            entries: [PauseInterval {
                start: 0.0,
                end: 0.0,
            }; QUEUE_LENGTH],
            tail: 0,
            len: 0,
        }
    }

    #[inline]
    fn at(&self, offset: usize) -> &PauseInterval {
        &self.entries[(self.tail + offset) % QUEUE_LENGTH]
    }

    fn push(&mut self, interval: PauseInterval) {
        debug_assert!(self.len < QUEUE_LENGTH);
        self.entries[(self.tail + self.len) % QUEUE_LENGTH] = interval;
        self.len += 1;
    }

    fn pop_oldest(&mut self) {
        debug_assert!(self.len > 0);
        self.tail = (self.tail + 1) % QUEUE_LENGTH;
        self.len -= 1;
    }

    /// Drop entries that ended before `limit`.
    fn remove_expired(&mut self, limit: f64) {
        while self.len > 0 && self.at(0).end < limit {
            self.pop_oldest();
        }
    }

    /// Total GC time inside the window `[now - time_slice, now]`.
    ///
    /// An interval straddling the window's left edge contributes only the
    /// portion inside it.
    fn gc_time_in_window(&self, now: f64, time_slice: f64) -> f64 {
        let limit = now - time_slice;
        let mut total = 0.0;
        for offset in 0..self.len {
            let interval = self.at(offset);
            if interval.end > limit {
                total += interval.end.min(now) - interval.start.max(limit);
            }
        }
        total
    }
}

/// Sliding-window pause admission-control tracker.
pub struct MmuTracker {
    /// Window length, seconds.
    time_slice: f64,
    /// Pause budget per window, seconds.
    max_gc_time: f64,
    /// Queue overflow behavior.
    policy: OverflowPolicy,
    queue: Mutex<PauseQueue>,
}

impl MmuTracker {
    /// Create a tracker with the strict overflow policy.
    ///
    /// # Panics
    ///
    /// Panics if `time_slice` is not positive or `max_gc_time` is not in
    /// `(0, time_slice]`.
    pub fn new(time_slice: f64, max_gc_time: f64) -> Self {
        Self::with_policy(time_slice, max_gc_time, OverflowPolicy::Strict)
    }

    /// Create a tracker with an explicit overflow policy.
    pub fn with_policy(time_slice: f64, max_gc_time: f64, policy: OverflowPolicy) -> Self {
        assert!(time_slice > 0.0, "time slice must be positive");
        assert!(
            max_gc_time > 0.0 && max_gc_time <= time_slice,
            "max GC time must be within the time slice"
        );
        Self {
            time_slice,
            max_gc_time,
            policy,
            queue: Mutex::new(PauseQueue::new()),
        }
    }

    /// Create a tracker from the MMU fields of a configuration.
    pub fn from_config(config: &crate::config::RemSetConfig) -> Self {
        Self::with_policy(
            config.mmu_time_slice,
            config.mmu_max_gc_time,
            config.mmu_overflow,
        )
    }

    /// Window length, seconds.
    #[inline]
    pub fn time_slice(&self) -> f64 {
        self.time_slice
    }

    /// Pause budget per window, seconds.
    #[inline]
    pub fn max_gc_time(&self) -> f64 {
        self.max_gc_time
    }

    /// Record a completed pause.
    ///
    /// Intervals that have aged out of the window ending at `end` are
    /// evicted first. Zero-length pauses are accepted; they occupy a
    /// queue slot and contribute no GC time.
    ///
    /// # Panics
    ///
    /// Panics if `end < start`, or on queue overflow under
    /// [`OverflowPolicy::Strict`].
    pub fn add_pause(&self, start: f64, end: f64) {
        assert!(end >= start, "pause interval ends before it starts");
        let mut queue = self.queue.lock();
        queue.remove_expired(end - self.time_slice);
        if queue.len == QUEUE_LENGTH {
            match self.policy {
                OverflowPolicy::Strict => panic!(
                    "pause queue overflow: {QUEUE_LENGTH} pauses within one {}s time slice",
                    self.time_slice
                ),
                OverflowPolicy::Forgiving => queue.pop_oldest(),
            }
        }
        queue.push(PauseInterval { start, end });
    }

    /// Total GC time inside the window `[now - time_slice, now]`.
    pub fn gc_time_in_window(&self, now: f64) -> f64 {
        self.queue.lock().gc_time_in_window(now, self.time_slice)
    }

    /// Longest pause that may start at `now` without breaking the budget.
    ///
    /// Returns 0.0 when no budget is currently available.
    pub fn longest_pause(&self, now: f64) -> f64 {
        self.longest_pause_internal(now).max(0.0)
    }

    /// The iterative budget search.
    ///
    /// A candidate pause of length `t` ending at `now + t` must satisfy
    /// `gc_time(now + t) + t <= max_gc_time`, but sliding the window's
    /// right edge changes how much history overlaps it. Start from the
    /// full budget, subtract the overrun, repeat until the overrun is
    /// gone; a candidate driven below zero means no budget (sentinel
    /// -1.0, mapped to zero by the public wrapper).
    fn longest_pause_internal(&self, now: f64) -> f64 {
        let queue = self.queue.lock();
        let mut target_time = self.max_gc_time;
        while target_time > 0.0 {
            let gc_time = queue.gc_time_in_window(now + target_time, self.time_slice);
            let diff = target_time + gc_time - self.max_gc_time;
            if diff <= EPSILON {
                break;
            }
            target_time -= diff;
            if target_time <= 0.0 {
                target_time = -1.0;
            }
        }
        target_time
    }

    /// Minimal delay after `now` before a pause of `pause_time` seconds
    /// may legally start. Returns 0.0 when it may start immediately.
    ///
    /// Walks the queue oldest-first, accumulating the slack reclaimed as
    /// each interval ages out of the hypothetical future window, until
    /// enough has accrued to admit the pause.
    pub fn when_sec(&self, now: f64, pause_time: f64) -> f64 {
        // A pause over the whole budget can never fit better than the
        // budget itself.
        let pause_time = pause_time.min(self.max_gc_time);
        let queue = self.queue.lock();

        let earliest_end = now + pause_time;
        let limit = earliest_end - self.time_slice;
        let gc_time = queue.gc_time_in_window(earliest_end, self.time_slice);
        let mut diff = gc_time + pause_time - self.max_gc_time;
        if diff <= EPSILON {
            return 0.0;
        }

        for offset in 0..queue.len {
            let interval = queue.at(offset);
            if interval.end > limit {
                if interval.start > limit {
                    diff -= interval.duration();
                } else {
                    diff -= interval.end - limit;
                }
                if diff <= EPSILON {
                    // The pause fits once the window has slid past this
                    // interval by the residual amount.
                    return (interval.end + diff - limit).max(0.0);
                }
            }
        }
        unreachable!("pause within the budget must eventually be schedulable");
    }

    /// Delay before a maximum-budget pause may start: the value the
    /// collector policy uses to schedule concurrent-cycle pauses.
    #[inline]
    pub fn when_max_gc_sec(&self, now: f64) -> f64 {
        self.when_sec(now, self.max_gc_time)
    }
}
