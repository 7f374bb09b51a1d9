//! Single-slot cancellable timer driven by a dedicated worker thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex, MutexGuard};

/// Cancellation flag handed out when a deferred run is armed.
#[derive(Debug, Clone, Default)]
pub(crate) struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Create a token that is not cancelled.
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Cancel the run this token belongs to.
    pub(crate) fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether [`cancel`](Self::cancel) was called on any clone of this token.
    pub(crate) fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Whether both tokens belong to the same deferred run.
    pub(crate) fn same_run(&self, other: &CancelToken) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// A deferred run waiting in the slot.
struct Deferred {
    deadline: Instant,
    token: CancelToken,
}

struct TimerSlot {
    pending: Option<Deferred>,
    shutdown: bool,
}

/// Holds at most one deferred run and wakes its worker when it is due.
///
/// The worker thread calls [`run`](Self::run); every other thread arms,
/// disarms or shuts the timer down.
pub(crate) struct DeferredTimer {
    slot: Mutex<TimerSlot>,
    wake: Condvar,
}

impl DeferredTimer {
    pub(crate) fn new() -> Self {
        Self {
            slot: Mutex::new(TimerSlot {
                pending: None,
                shutdown: false,
            }),
            wake: Condvar::new(),
        }
    }

    /// Arm the timer to fire at `deadline`.
    ///
    /// Returns the token of the new run together with the token of a run
    /// that was still waiting in the slot and got displaced.
    pub(crate) fn arm(&self, deadline: Instant) -> (CancelToken, Option<CancelToken>) {
        let token = CancelToken::new();
        let displaced = {
            let mut slot = self.slot.lock();
            slot.pending
                .replace(Deferred {
                    deadline,
                    token: token.clone(),
                })
                .map(|previous| previous.token)
        };
        if let Some(ref previous) = displaced {
            previous.cancel();
        }
        self.wake.notify_all();
        (token, displaced)
    }

    /// Cancel the run identified by `token` and wake the worker.
    ///
    /// Returns `true` if the run was still waiting in the slot. A run the
    /// worker already picked up is not removed here; it observes the
    /// cancelled token instead.
    pub(crate) fn disarm(&self, token: &CancelToken) -> bool {
        token.cancel();
        let removed = {
            let mut slot = self.slot.lock();
            let waiting = slot
                .pending
                .as_ref()
                .is_some_and(|deferred| deferred.token.same_run(token));
            if waiting {
                slot.pending = None;
            }
            waiting
        };
        self.wake.notify_all();
        removed
    }

    /// Whether a run is waiting in the slot.
    #[cfg(test)]
    pub(crate) fn is_armed(&self) -> bool {
        self.slot.lock().pending.is_some()
    }

    /// Stop the worker loop. Any waiting run is cancelled.
    pub(crate) fn shutdown(&self) {
        {
            let mut slot = self.slot.lock();
            slot.shutdown = true;
            if let Some(deferred) = slot.pending.take() {
                deferred.token.cancel();
            }
        }
        self.wake.notify_all();
    }

    /// Worker loop: wait for runs to come due and hand them to `fire`.
    ///
    /// `fire` is called without the slot lock held, so it may arm the timer
    /// again. Returns after [`shutdown`](Self::shutdown).
    pub(crate) fn run<F>(&self, mut fire: F)
    where
        F: FnMut(CancelToken),
    {
        let mut slot = self.slot.lock();
        loop {
            if slot.shutdown {
                return;
            }

            let next = slot
                .pending
                .as_ref()
                .map(|deferred| (deferred.deadline, deferred.token.is_cancelled()));
            let Some((deadline, cancelled)) = next else {
                self.wake.wait(&mut slot);
                continue;
            };

            if cancelled {
                slot.pending = None;
                continue;
            }

            if Instant::now() < deadline {
                // Re-evaluate after waking: the run may be gone or replaced.
                self.wake.wait_until(&mut slot, deadline);
                continue;
            }

            if let Some(due) = slot.pending.take() {
                MutexGuard::unlocked(&mut slot, || fire(due.token));
            }
        }
    }
}
