//! Timer bookkeeping for `setTimeout` / `setInterval`.
//!
//! The worker owns one queue. It never sleeps past the earliest deadline, and
//! fires due timers before handling the next command.

use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
struct Timer {
    due: Instant,
    interval: Option<Duration>,
}

/// Pending timers ordered by deadline, then by id.
#[derive(Debug, Default)]
pub(crate) struct TimerQueue {
    timers: HashMap<u32, Timer>,
    order: BTreeSet<(Instant, u32)>,
}

/// Shortest interval a repeating timer may use, so `setInterval(f, 0)`
/// cannot starve the command channel.
const MIN_INTERVAL: Duration = Duration::from_millis(1);

impl TimerQueue {
    /// Schedule timer `id` to fire after `delay`, replacing any earlier entry.
    pub(crate) fn schedule(&mut self, id: u32, delay: Duration, repeat: bool, now: Instant) {
        self.cancel(id);
        let due = now.checked_add(delay).unwrap_or(now);
        let interval = repeat.then(|| delay.max(MIN_INTERVAL));
        self.timers.insert(id, Timer { due, interval });
        self.order.insert((due, id));
    }

    /// Drop timer `id`. Unknown ids are ignored.
    pub(crate) fn cancel(&mut self, id: u32) {
        if let Some(timer) = self.timers.remove(&id) {
            self.order.remove(&(timer.due, id));
        }
    }

    /// Earliest deadline, if any timer is pending.
    pub(crate) fn next_due(&self) -> Option<Instant> {
        self.order.first().map(|(due, _)| *due)
    }

    /// Remove and return the next timer due at or before `now`.
    ///
    /// Repeating timers are rescheduled before they are returned, so a
    /// callback that clears its own interval wins.
    pub(crate) fn pop_due(&mut self, now: Instant) -> Option<u32> {
        let (due, id) = *self.order.first()?;
        if due > now {
            return None;
        }
        self.order.remove(&(due, id));
        let timer = self.timers.remove(&id)?;
        if let Some(interval) = timer.interval {
            let next = now.checked_add(interval).unwrap_or(now);
            self.timers.insert(
                id,
                Timer {
                    due: next,
                    interval: Some(interval),
                },
            );
            self.order.insert((next, id));
        }
        Some(id)
    }

    /// Number of pending timers.
    pub(crate) fn len(&self) -> usize {
        self.timers.len()
    }

    pub(crate) fn clear(&mut self) {
        self.timers.clear();
        self.order.clear();
    }
}
