//! Move status handle.
//!
//! A [`MoveStatus`] is the caller's view of one move. It is cheap to clone;
//! all clones observe the same resolution. The current [`MoveState`] is
//! published on a `watch` channel so any number of tasks can await it.

use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::{PositionerError, PositionerResult};
use crate::tracker::CompletionTracker;

/// Lifecycle of a single move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MoveState {
    /// Setpoint issued, readback not yet within tolerance.
    Pending,
    /// Within tolerance, waiting out the settle time.
    Settling,
    /// Target reached.
    Done,
    /// Stopped before reaching the target.
    Stopped,
    /// Deadline elapsed.
    TimedOut,
    /// A write failed or a reading was invalid.
    Failed,
}

impl MoveState {
    /// Whether the move has resolved.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MoveState::Done | MoveState::Stopped | MoveState::TimedOut | MoveState::Failed
        )
    }

    /// Terminal state corresponding to a move result.
    pub fn from_result(result: &PositionerResult<()>) -> Self {
        match result {
            Ok(()) => MoveState::Done,
            Err(PositionerError::Stopped(_)) => MoveState::Stopped,
            Err(PositionerError::TimedOut { .. }) => MoveState::TimedOut,
            Err(_) => MoveState::Failed,
        }
    }
}

impl std::fmt::Display for MoveState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            MoveState::Pending => "pending",
            MoveState::Settling => "settling",
            MoveState::Done => "done",
            MoveState::Stopped => "stopped",
            MoveState::TimedOut => "timed_out",
            MoveState::Failed => "failed",
        };
        write!(f, "{}", label)
    }
}

/// Callback run once when a move resolves.
pub type StatusCallback = Box<dyn FnOnce(&MoveState) + Send + 'static>;

struct StatusInner {
    result: Option<PositionerResult<()>>,
    callbacks: Vec<StatusCallback>,
}

struct StatusShared {
    generation: u64,
    target: f64,
    created: Instant,
    state: watch::Sender<MoveState>,
    inner: Mutex<StatusInner>,
    tracker: Weak<CompletionTracker>,
}

/// Handle to one in-flight (or finished) move.
///
/// # Example
///
/// ```rust,ignore
/// let status = positioner.move_to(25.0, MoveOptions::default())?;
/// status.add_callback(|state| println!("move finished: {state}"));
///
/// match status.wait(Some(Duration::from_secs(30))).await {
///     Ok(()) => println!("at target"),
///     Err(PositionerError::WaitElapsed(_)) => status.cancel(),
///     Err(e) => return Err(e.into()),
/// }
/// ```
#[derive(Clone)]
pub struct MoveStatus {
    shared: Arc<StatusShared>,
}

impl std::fmt::Debug for MoveStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MoveStatus")
            .field("generation", &self.shared.generation)
            .field("target", &self.shared.target)
            .field("state", &self.state())
            .finish()
    }
}

impl MoveStatus {
    pub(crate) fn new(generation: u64, target: f64, tracker: Weak<CompletionTracker>) -> Self {
        let (state, _) = watch::channel(MoveState::Pending);
        Self {
            shared: Arc::new(StatusShared {
                generation,
                target,
                created: Instant::now(),
                state,
                inner: Mutex::new(StatusInner {
                    result: None,
                    callbacks: Vec::new(),
                }),
                tracker,
            }),
        }
    }

    /// Current state.
    pub fn state(&self) -> MoveState {
        *self.shared.state.borrow()
    }

    /// Generation this status belongs to.
    pub fn generation(&self) -> u64 {
        self.shared.generation
    }

    /// Requested target.
    pub fn target(&self) -> f64 {
        self.shared.target
    }

    /// Time since the move was issued.
    pub fn elapsed(&self) -> Duration {
        self.shared.created.elapsed()
    }

    /// Whether the move has resolved.
    pub fn is_resolved(&self) -> bool {
        self.shared.inner.lock().result.is_some()
    }

    /// The move's result, once resolved.
    pub fn result(&self) -> Option<PositionerResult<()>> {
        self.shared.inner.lock().result.clone()
    }

    /// Receiver of state transitions.
    pub fn subscribe(&self) -> watch::Receiver<MoveState> {
        self.shared.state.subscribe()
    }

    /// Wait for the move to resolve and return its result.
    ///
    /// With a timeout, gives up with [`PositionerError::WaitElapsed`] if the
    /// move has not resolved in time. The move itself keeps running.
    pub async fn wait(&self, timeout: Option<Duration>) -> PositionerResult<()> {
        match timeout {
            Some(limit) => tokio::time::timeout(limit, self.wait_resolved())
                .await
                .map_err(|_| PositionerError::WaitElapsed(limit))?,
            None => self.wait_resolved().await,
        }
    }

    async fn wait_resolved(&self) -> PositionerResult<()> {
        // Subscribe before checking so a resolution in between still wakes us.
        let mut rx = self.shared.state.subscribe();
        loop {
            if let Some(result) = self.result() {
                return result;
            }
            if rx.changed().await.is_err() {
                return self.result().unwrap_or(Err(PositionerError::Closed));
            }
        }
    }

    /// Stop tracking this move without touching the hardware.
    ///
    /// Resolves `Stopped(Cancelled)` if this is still the positioner's
    /// active move. No-op once resolved.
    pub fn cancel(&self) {
        if self.is_resolved() {
            return;
        }
        match self.shared.tracker.upgrade() {
            Some(tracker) => tracker.cancel(self.shared.generation),
            None => {
                self.resolve(Err(PositionerError::Stopped(
                    crate::error::StopReason::Cancelled,
                )));
            }
        }
    }

    /// Run `callback` once with the terminal state.
    ///
    /// Runs immediately, on the calling thread, if already resolved.
    pub fn add_callback(&self, callback: impl FnOnce(&MoveState) + Send + 'static) {
        let mut inner = self.shared.inner.lock();
        if inner.result.is_none() {
            inner.callbacks.push(Box::new(callback));
            return;
        }
        drop(inner);
        callback(&self.state());
    }

    /// Mark the move settling (or back to pending). Ignored once resolved.
    pub(crate) fn set_settling(&self, settling: bool) {
        let inner = self.shared.inner.lock();
        if inner.result.is_some() {
            return;
        }
        let state = if settling {
            MoveState::Settling
        } else {
            MoveState::Pending
        };
        self.shared.state.send_replace(state);
    }

    /// Record the final result. Returns false if already resolved.
    pub(crate) fn resolve(&self, result: PositionerResult<()>) -> bool {
        let final_state = MoveState::from_result(&result);
        let callbacks = {
            let mut inner = self.shared.inner.lock();
            if inner.result.is_some() {
                return false;
            }
            inner.result = Some(result);
            self.shared.state.send_replace(final_state);
            std::mem::take(&mut inner.callbacks)
        };

        for callback in callbacks {
            callback(&final_state);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StopReason;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn detached(target: f64) -> MoveStatus {
        MoveStatus::new(1, target, Weak::new())
    }

    #[test]
    fn test_resolves_exactly_once() {
        let status = detached(5.0);
        assert_eq!(status.state(), MoveState::Pending);

        assert!(status.resolve(Ok(())));
        assert!(!status.resolve(Err(PositionerError::Closed)));
        assert_eq!(status.state(), MoveState::Done);
        assert_eq!(status.result(), Some(Ok(())));
    }

    #[test]
    fn test_settling_ignored_after_resolution() {
        let status = detached(5.0);
        status.set_settling(true);
        assert_eq!(status.state(), MoveState::Settling);

        status.resolve(Err(PositionerError::Stopped(StopReason::Requested)));
        status.set_settling(false);
        assert_eq!(status.state(), MoveState::Stopped);
    }

    #[test]
    fn test_callbacks_run_once() {
        let status = detached(1.0);
        let calls = Arc::new(AtomicUsize::new(0));

        let before = calls.clone();
        status.add_callback(move |state| {
            assert_eq!(*state, MoveState::TimedOut);
            before.fetch_add(1, Ordering::SeqCst);
        });
        status.resolve(Err(PositionerError::TimedOut {
            timeout: Duration::from_secs(1),
        }));

        let after = calls.clone();
        status.add_callback(move |_| {
            after.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_returns_result() {
        let status = detached(2.0);
        let resolver = status.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            resolver.resolve(Err(PositionerError::WriteFailed {
                address: "SP".into(),
                reason: "refused".into(),
            }));
        });

        let err = status.wait(None).await.unwrap_err();
        assert!(matches!(err, PositionerError::WriteFailed { .. }));
        assert_eq!(status.state(), MoveState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_timeout_leaves_move_running() {
        let status = detached(2.0);
        let limit = Duration::from_millis(100);

        assert_eq!(
            status.wait(Some(limit)).await,
            Err(PositionerError::WaitElapsed(limit))
        );
        assert!(!status.is_resolved());
        assert_eq!(status.state(), MoveState::Pending);
    }

    #[test]
    fn test_cancel_without_tracker() {
        let status = detached(2.0);
        status.cancel();
        assert_eq!(
            status.result(),
            Some(Err(PositionerError::Stopped(StopReason::Cancelled)))
        );
    }

    #[test]
    fn test_state_from_result() {
        assert_eq!(
            MoveState::from_result(&Err(PositionerError::InvalidReading {
                address: "RBV".into(),
                value: "NaN".into(),
            })),
            MoveState::Failed
        );
        assert!(MoveState::Stopped.is_terminal());
        assert!(!MoveState::Settling.is_terminal());
    }
}
