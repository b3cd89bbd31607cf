//! Timer facility for settle and deadline timers.
//!
//! Trackers never poll; they hand a callback to a [`Timer`] and cancel it
//! when the move resolves. [`TokioTimer`] runs each timer as a sleeping task
//! on a captured runtime handle.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;

use crate::error::{PositionerError, PositionerResult};

/// Callback run when a timer expires.
pub type TimerCallback = Box<dyn FnOnce() + Send + 'static>;

/// Handle returned by [`Timer::schedule`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

impl TimerHandle {
    /// Raw timer id.
    pub fn id(&self) -> u64 {
        self.0
    }
}

/// Shared timer service.
///
/// # Contract
/// - `schedule` never runs the callback synchronously
/// - after `cancel` returns, the callback will not start
/// - cancelling an expired or unknown handle is a no-op
pub trait Timer: Send + Sync {
    /// Run `callback` once after `delay`.
    fn schedule(&self, delay: Duration, callback: TimerCallback) -> TimerHandle;

    /// Cancel a pending callback. No-op if it already ran.
    fn cancel(&self, handle: TimerHandle);

    /// Number of timers scheduled and not yet fired or cancelled.
    fn pending(&self) -> usize;
}

/// [`Timer`] backed by Tokio tasks.
pub struct TokioTimer {
    runtime: Handle,
    tasks: Arc<Mutex<HashMap<u64, AbortHandle>>>,
    next_id: AtomicU64,
}

impl TokioTimer {
    /// Timer spawning on `runtime`.
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            tasks: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Timer on the runtime of the calling context.
    pub fn try_current() -> PositionerResult<Self> {
        Handle::try_current().map(Self::new).map_err(|_| {
            PositionerError::Configuration("timer requires a Tokio runtime".to_string())
        })
    }
}

impl std::fmt::Debug for TokioTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokioTimer")
            .field("pending", &self.pending())
            .finish_non_exhaustive()
    }
}

impl Timer for TokioTimer {
    fn schedule(&self, delay: Duration, callback: TimerCallback) -> TimerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let tasks = self.tasks.clone();

        // Hold the map lock across spawn so the task cannot look itself up
        // before it has been inserted.
        let mut guard = self.tasks.lock();
        let task = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            // Whoever removes the entry owns the timer: us (fire) or cancel().
            let fired = tasks.lock().remove(&id).is_some();
            if fired {
                callback();
            }
        });
        guard.insert(id, task.abort_handle());

        TimerHandle(id)
    }

    fn cancel(&self, handle: TimerHandle) {
        if let Some(task) = self.tasks.lock().remove(&handle.0) {
            task.abort();
        }
    }

    fn pending(&self) -> usize {
        self.tasks.lock().len()
    }
}
