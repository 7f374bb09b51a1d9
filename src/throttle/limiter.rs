//! Core rate limiter implementation.

use std::cell::RefCell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, ReentrantMutex};
use tracing::{debug, error, trace};

use super::task::{LimiterId, Task};
use super::timer::{CancelToken, DeferredTimer};
use crate::error::{RatewatchError, Result};

/// Interval reported while throttling is disabled.
pub const DISABLED: i64 = -1;

/// How often a [`RateLimiter`] may execute its task.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Throttle {
    /// At most this many executions per second. Zero or less disables throttling.
    MaxFrequency(f32),
    /// At least this many milliseconds between executions. Zero or less disables throttling.
    MinInterval(i64),
    /// Every request executes immediately
    Disabled,
}

impl Throttle {
    /// Minimum interval in milliseconds, or [`DISABLED`].
    pub fn interval_ms(self) -> i64 {
        match self {
            Throttle::MaxFrequency(hz) => interval_for_frequency(hz),
            Throttle::MinInterval(ms) if ms > 0 => ms,
            Throttle::MinInterval(_) | Throttle::Disabled => DISABLED,
        }
    }
}

fn interval_for_frequency(hz: f32) -> i64 {
    if hz <= 0.0 {
        return DISABLED;
    }
    match (1000.0 / hz) as i64 {
        ms if ms > 0 => ms,
        _ => DISABLED,
    }
}

type SharedTask = Arc<Mutex<Box<dyn Task>>>;

fn share_task<T: Task>(task: T) -> SharedTask {
    Arc::new(Mutex::new(Box::new(task) as Box<dyn Task>))
}

/// Throttling state, guarded by the limiter's execution lock.
struct ThrottleState {
    task: SharedTask,
    min_interval_ms: i64,
    last_run: Option<Instant>,
    /// Token of the outstanding deferred run; `Some` means scheduled
    pending: Option<CancelToken>,
}

/// State shared between the limiter, its handles and its worker thread.
struct Shared {
    id: LimiterId,
    /// Re-entrant so a running task can call back into its own limiter.
    state: ReentrantMutex<RefCell<ThrottleState>>,
    timer: DeferredTimer,
    dropped: AtomicU64,
}

impl Shared {
    fn request(&self) {
        let guard = self.state.lock();
        self.request_locked(&guard);
    }

    /// Throttling decision. The caller holds the execution lock.
    fn request_locked(&self, cell: &RefCell<ThrottleState>) {
        let task = {
            let mut state = cell.borrow_mut();
            if state.min_interval_ms > 0 {
                let now = Instant::now();
                let interval = Duration::from_millis(state.min_interval_ms as u64);
                let too_soon = state
                    .last_run
                    .map(|last_run| last_run + interval)
                    .filter(|&next_run| now < next_run);
                if let Some(next_run) = too_soon {
                    self.defer(&mut state, now, next_run);
                    return;
                }
                state.last_run = Some(now);
                state.pending = None;
            }
            Arc::clone(&state.task)
        };

        // The state cell is released; the execution lock is still held.
        self.execute(&task);
    }

    fn defer(&self, state: &mut ThrottleState, now: Instant, next_run: Instant) {
        if state.pending.is_some() {
            let dropped = self.dropped.fetch_add(1, Ordering::SeqCst) + 1;
            trace!(
                limiter = %self.id,
                dropped = dropped,
                "Request coalesced into pending run"
            );
            return;
        }

        let (token, displaced) = self.timer.arm(next_run);
        if displaced.is_some() {
            self.dropped.fetch_add(1, Ordering::SeqCst);
        }
        state.pending = Some(token);

        debug!(
            limiter = %self.id,
            delay_ms = (next_run - now).as_millis() as u64,
            "Scheduled deferred run"
        );
    }

    fn execute(&self, task: &SharedTask) {
        match task.try_lock() {
            Some(mut task) => task.run(),
            None => {
                // Only the thread already running this task can get here.
                self.dropped.fetch_add(1, Ordering::SeqCst);
                debug!(
                    limiter = %self.id,
                    "Task is already running, dropping re-entrant request"
                );
            }
        }
    }

    /// Called by the worker when a deferred run comes due.
    fn fire(&self, token: CancelToken) {
        let guard = self.state.lock();
        if token.is_cancelled() {
            trace!(limiter = %self.id, "Deferred run was cancelled");
            return;
        }

        let still_scheduled = {
            let mut state = guard.borrow_mut();
            let ours = state
                .pending
                .as_ref()
                .is_some_and(|pending| pending.same_run(&token));
            if ours {
                state.pending = None;
            }
            ours
        };

        if still_scheduled {
            debug!(limiter = %self.id, "Firing deferred run");
            self.request_locked(&guard);
        } else {
            self.dropped.fetch_add(1, Ordering::SeqCst);
            debug!(
                limiter = %self.id,
                "Deferred run superseded by a direct run"
            );
        }
    }
}

/// Throttles a task to at most one execution per minimum interval.
///
/// [`request`](Self::request) runs the task right away when the interval
/// since the last execution has passed. Otherwise one deferred execution is
/// scheduled for the moment the interval expires, and further requests
/// until then are coalesced into it and counted as dropped.
///
/// Each limiter owns one worker thread that waits for the deferred
/// execution. Task executions are serialized by a re-entrant lock: a task
/// may call back into its own limiter, but never runs twice at once.
pub struct RateLimiter {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl RateLimiter {
    /// Create a limiter for `task` with the given throttling policy.
    pub fn new<T: Task>(task: T, throttle: Throttle) -> Result<Self> {
        if let Throttle::MaxFrequency(hz) = throttle {
            if hz.is_nan() {
                return Err(RatewatchError::InvalidArgument(
                    "max frequency must be a number".to_string(),
                ));
            }
        }

        let id = LimiterId::next();
        let min_interval_ms = throttle.interval_ms();
        let shared = Arc::new(Shared {
            id,
            state: ReentrantMutex::new(RefCell::new(ThrottleState {
                task: share_task(task),
                min_interval_ms,
                last_run: None,
                pending: None,
            })),
            timer: DeferredTimer::new(),
            dropped: AtomicU64::new(0),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name(format!("ratewatch-{}", id))
            .spawn(move || run_worker(worker_shared))?;

        debug!(
            limiter = %id,
            min_interval_ms = min_interval_ms,
            "Rate limiter created"
        );

        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }

    /// Create a limiter allowing at most `hz` executions per second.
    pub fn with_max_frequency<T: Task>(task: T, hz: f32) -> Result<Self> {
        Self::new(task, Throttle::MaxFrequency(hz))
    }

    /// Create a limiter keeping at least `ms` milliseconds between executions.
    pub fn with_min_interval<T: Task>(task: T, ms: i64) -> Result<Self> {
        Self::new(task, Throttle::MinInterval(ms))
    }

    /// Run the task now if allowed, otherwise defer or coalesce it.
    pub fn request(&self) {
        self.shared.request();
    }

    /// A cloneable handle that requests executions from this limiter.
    ///
    /// The handle does not keep the limiter alive.
    pub fn handle(&self) -> RequestHandle {
        RequestHandle {
            id: self.shared.id,
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Replace the task.
    ///
    /// With `interrupt_current`, a pending deferred run is cancelled first
    /// and will never execute. Without it, a pending deferred run still
    /// fires and executes the new task. Either way this waits for a task
    /// execution in progress on another thread to finish.
    ///
    /// Fails if `task` is a handle to this very limiter.
    pub fn set_task<T: Task>(&self, task: T, interrupt_current: bool) -> Result<()> {
        if task.forwards_to() == Some(self.shared.id) {
            return Err(RatewatchError::InvalidArgument(
                "a rate limiter cannot be its own task".to_string(),
            ));
        }

        let guard = self.shared.state.lock();
        let mut state = guard.borrow_mut();
        if interrupt_current {
            if let Some(token) = state.pending.take() {
                self.shared.timer.disarm(&token);
                debug!(limiter = %self.shared.id, "Cancelled deferred run");
            }
        }
        state.task = share_task(task);
        trace!(limiter = %self.shared.id, "Task replaced");
        Ok(())
    }

    /// Replace the task, cancelling any pending deferred run.
    pub fn replace_task<T: Task>(&self, task: T) -> Result<()> {
        self.set_task(task, true)
    }

    /// Set the minimum interval in milliseconds. Zero or less disables throttling.
    pub fn set_min_interval(&self, ms: i64) {
        let interval = Throttle::MinInterval(ms).interval_ms();
        self.shared.state.lock().borrow_mut().min_interval_ms = interval;
        debug!(limiter = %self.shared.id, min_interval_ms = interval, "Interval updated");
    }

    /// Set the maximum frequency in Hz. Zero or less disables throttling.
    pub fn set_max_frequency(&self, hz: f32) {
        let interval = interval_for_frequency(hz);
        self.shared.state.lock().borrow_mut().min_interval_ms = interval;
        debug!(limiter = %self.shared.id, min_interval_ms = interval, "Interval updated");
    }

    /// Maximum frequency in Hz, or `-1.0` when throttling is disabled.
    pub fn max_frequency(&self) -> f32 {
        match self.min_interval() {
            DISABLED => -1.0,
            ms => 1000.0 / ms as f32,
        }
    }

    /// Minimum interval in milliseconds, or [`DISABLED`].
    pub fn min_interval(&self) -> i64 {
        let ms = self.shared.state.lock().borrow().min_interval_ms;
        if ms <= 0 {
            DISABLED
        } else {
            ms
        }
    }

    /// Requests that were coalesced away instead of executing.
    pub fn dropped_tasks_count(&self) -> u64 {
        self.shared.dropped.load(Ordering::SeqCst)
    }

    /// Reset the dropped request counter to zero.
    pub fn reset_dropped_tasks_count(&self) {
        self.shared.dropped.store(0, Ordering::SeqCst);
    }

    /// Whether a deferred run is outstanding.
    pub fn is_scheduled(&self) -> bool {
        self.shared.state.lock().borrow().pending.is_some()
    }

    /// Process-unique identifier of this limiter.
    pub fn id(&self) -> LimiterId {
        self.shared.id
    }
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("id", &self.shared.id)
            .field("min_interval_ms", &self.min_interval())
            .field("scheduled", &self.is_scheduled())
            .field("dropped", &self.dropped_tasks_count())
            .finish()
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        self.shared.timer.shutdown();
        if let Some(worker) = self.worker.take() {
            // Dropped from inside a deferred run: the worker exits on its own.
            if worker.thread().id() == thread::current().id() {
                return;
            }
            if worker.join().is_err() {
                error!(limiter = %self.shared.id, "Rate limiter worker panicked");
            }
        }
        trace!(limiter = %self.shared.id, "Rate limiter stopped");
    }
}

fn run_worker(shared: Arc<Shared>) {
    shared.timer.run(|token| {
        let fired = panic::catch_unwind(AssertUnwindSafe(|| shared.fire(token)));
        if fired.is_err() {
            error!(limiter = %shared.id, "Task panicked during deferred run");
        }
    });
}

/// Requests executions from a [`RateLimiter`] without owning it.
///
/// A handle is itself a [`Task`], so one limiter can drive another.
#[derive(Clone)]
pub struct RequestHandle {
    id: LimiterId,
    shared: Weak<Shared>,
}

impl RequestHandle {
    /// Request an execution. Returns `false` if the limiter is gone.
    pub fn request(&self) -> bool {
        match self.shared.upgrade() {
            Some(shared) => {
                shared.request();
                true
            }
            None => false,
        }
    }

    /// The limiter this handle belongs to.
    pub fn limiter_id(&self) -> LimiterId {
        self.id
    }
}

impl Task for RequestHandle {
    fn run(&mut self) {
        self.request();
    }

    fn forwards_to(&self) -> Option<LimiterId> {
        Some(self.id)
    }
}

impl fmt::Debug for RequestHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestHandle").field("id", &self.id).finish()
    }
}
