//! Per-turn CPU budget enforced through the engine's interrupt hook.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Deadline shared between the worker and the interrupt handler.
#[derive(Debug, Clone, Default)]
pub(crate) struct Budget {
    deadline: Arc<Mutex<Option<Instant>>>,
    tripped: Arc<AtomicBool>,
}

impl Budget {
    /// Arm the budget for one turn. Disarmed when the guard drops.
    pub(crate) fn arm(&self, limit: Duration) -> TurnGuard<'_> {
        self.tripped.store(false, Ordering::SeqCst);
        if let Ok(mut deadline) = self.deadline.lock() {
            *deadline = Instant::now().checked_add(limit);
        }
        TurnGuard { budget: self }
    }

    /// Interrupt-handler body: `true` aborts the running script.
    pub(crate) fn should_interrupt(&self) -> bool {
        let expired = self
            .deadline
            .lock()
            .ok()
            .and_then(|deadline| *deadline)
            .is_some_and(|deadline| Instant::now() >= deadline);
        if expired {
            self.tripped.store(true, Ordering::SeqCst);
        }
        expired
    }

    fn disarm(&self) {
        if let Ok(mut deadline) = self.deadline.lock() {
            *deadline = None;
        }
    }
}

/// Live while a turn runs.
pub(crate) struct TurnGuard<'a> {
    budget: &'a Budget,
}

impl TurnGuard<'_> {
    /// Whether the interrupt handler fired during this turn.
    pub(crate) fn tripped(&self) -> bool {
        self.budget.tripped.load(Ordering::SeqCst)
    }
}

impl Drop for TurnGuard<'_> {
    fn drop(&mut self) {
        self.budget.disarm();
    }
}
