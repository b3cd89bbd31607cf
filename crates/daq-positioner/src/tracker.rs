//! Completion tracking.
//!
//! The [`CompletionTracker`] turns a stream of control-point updates plus a
//! target into exactly one resolution per move:
//!
//! ```text
//! Idle ──arm──▶ Armed ──write ack──▶ Evaluating ◀──disqualified── Settling
//!                 │                      │ satisfied ───────────────▶ │
//!                 │                      │                            │ settle timer
//!                 └──────────────────────┴──────────────┬─────────────┘
//!                                                       ▼
//!                               Resolved(Done | Stopped | TimedOut | Failed)
//! ```
//!
//! Every callback and timer carries the generation it was created for. Events
//! for any other generation are discarded before they touch state, so a
//! superseded move can never resolve its successor. Settle timers also carry
//! a settle epoch, which is bumped whenever settling is abandoned.
//!
//! All state lives behind one mutex. Anything that can call back into user
//! code (unsubscribing, completing the status, status callbacks) runs after
//! the lock is released.

use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::control_point::{ControlPoint, PointValue, SubscriptionHandle};
use crate::error::{PositionerError, PositionerResult, StopReason};
use crate::observable::Observable;
use crate::status::{MoveState, MoveStatus};
use crate::timer::{Timer, TimerHandle};
use crate::tolerance::Tolerance;

/// One requested move.
#[derive(Debug, Clone)]
pub struct MoveRequest {
    /// Move generation.
    pub generation: u64,
    /// Requested target.
    pub target: f64,
    /// Completion tolerance.
    pub tolerance: Tolerance,
    /// Deadline relative to `created`. `None` waits forever.
    pub timeout: Option<Duration>,
    /// Time to stay in tolerance.
    pub settle_time: Duration,
    /// When the move was issued.
    pub created: Instant,
}

impl MoveRequest {
    /// Absolute deadline, if the move has a timeout.
    pub fn deadline(&self) -> Option<Instant> {
        self.timeout.map(|timeout| self.created + timeout)
    }
}

/// Phase of the tracker's state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerPhase {
    /// No move has been armed yet.
    Idle,
    /// Subscribed; setpoint write not yet accepted. Updates are cached only.
    Armed,
    /// Setpoint accepted; readbacks are checked on every update.
    Evaluating,
    /// In tolerance, waiting out the settle time.
    Settling,
    /// The move resolved with this state.
    Resolved(MoveState),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Readback(usize),
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopState {
    None,
    /// Stop write issued, not yet accepted.
    Requested,
    /// Stop write accepted; the next update resolves the move.
    Confirmed,
}

struct Subscription {
    point: Arc<dyn ControlPoint>,
    handle: SubscriptionHandle,
}

struct ActiveMove {
    request: MoveRequest,
    status: MoveStatus,
    subscriptions: Vec<Subscription>,
    deadline_timer: Option<TimerHandle>,
    settle_timer: Option<TimerHandle>,
    settle_epoch: u64,
    readback_values: Vec<Option<PointValue>>,
    done_value: Option<PointValue>,
    stop: StopState,
}

struct TrackerState {
    generation: u64,
    phase: TrackerPhase,
    active: Option<ActiveMove>,
    closed: bool,
}

enum Verdict {
    Satisfied,
    NotYet,
    Invalid(PositionerError),
}

/// Side effects of resolving a move, applied after the lock is dropped.
struct Resolution {
    generation: u64,
    status: MoveStatus,
    result: PositionerResult<()>,
    subscriptions: Vec<Subscription>,
    timers: Vec<TimerHandle>,
}

impl Resolution {
    fn finish(self, timer: &dyn Timer) {
        for handle in self.timers {
            timer.cancel(handle);
        }
        for sub in self.subscriptions {
            sub.point.unsubscribe(sub.handle);
        }

        match &self.result {
            Ok(()) => info!(generation = self.generation, "move done"),
            Err(PositionerError::Stopped(reason)) => {
                info!(generation = self.generation, %reason, "move stopped")
            }
            Err(e) => warn!(generation = self.generation, error = %e, "move failed"),
        }
        self.status.resolve(self.result);
    }
}

/// Converts update notifications into one completion event per move.
pub struct CompletionTracker {
    name: String,
    readbacks: Vec<Arc<dyn ControlPoint>>,
    done_point: Option<Arc<dyn ControlPoint>>,
    timer: Arc<dyn Timer>,
    done: Observable<bool>,
    state: Mutex<TrackerState>,
    self_ref: Weak<CompletionTracker>,
}

impl std::fmt::Debug for CompletionTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionTracker")
            .field("name", &self.name)
            .field("generation", &self.generation())
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

impl CompletionTracker {
    /// Create a tracker and subscribe to the readbacks.
    pub fn new(
        name: impl Into<String>,
        readbacks: Vec<Arc<dyn ControlPoint>>,
        done_point: Option<Arc<dyn ControlPoint>>,
        timer: Arc<dyn Timer>,
    ) -> Arc<Self> {
        let name = name.into();
        let done = Observable::new(format!("{}.done", name), false)
            .with_description("most recent move reached its target")
            .read_only();
        Arc::new_cyclic(|self_ref| Self {
            name,
            readbacks,
            done_point,
            timer,
            done,
            state: Mutex::new(TrackerState {
                generation: 0,
                phase: TrackerPhase::Idle,
                active: None,
                closed: false,
            }),
            self_ref: self_ref.clone(),
        })
    }

    /// Owning positioner name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Latest armed generation.
    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    /// Current phase.
    pub fn phase(&self) -> TrackerPhase {
        self.state.lock().phase
    }

    /// Whether [`shutdown`](Self::shutdown) ran.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// The done flag.
    pub fn done(&self) -> &Observable<bool> {
        &self.done
    }

    /// Subscriptions held for the active move.
    pub fn active_subscriptions(&self) -> usize {
        self.state
            .lock()
            .active
            .as_ref()
            .map_or(0, |active| active.subscriptions.len())
    }

    /// Arm tracking for a new move.
    ///
    /// Supersedes any unresolved earlier move. A request whose generation is
    /// not newer than the current one is itself resolved
    /// `Stopped(Superseded)` straight away.
    pub fn arm(&self, request: MoveRequest) -> PositionerResult<MoveStatus> {
        let generation = request.generation;
        let status = MoveStatus::new(generation, request.target, self.self_ref.clone());

        let superseded = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(PositionerError::Closed);
            }
            if generation <= state.generation {
                drop(state);
                warn!(
                    positioner = %self.name,
                    generation,
                    "move request overtaken by a newer move"
                );
                status.resolve(Err(PositionerError::Stopped(StopReason::Superseded)));
                return Ok(status);
            }

            let superseded = self.resolve_locked(
                &mut state,
                Err(PositionerError::Stopped(StopReason::Superseded)),
            );
            state.generation = generation;
            state.phase = TrackerPhase::Armed;
            state.active = Some(ActiveMove {
                subscriptions: Vec::new(),
                deadline_timer: None,
                settle_timer: None,
                settle_epoch: 0,
                readback_values: vec![None; self.readbacks.len()],
                done_value: None,
                stop: StopState::None,
                status: status.clone(),
                request: request.clone(),
            });
            self.done.set_unchecked(false);
            superseded
        };

        if let Some(resolution) = superseded {
            resolution.finish(self.timer.as_ref());
        }

        debug!(
            positioner = %self.name,
            generation,
            target = request.target,
            tolerance = request.tolerance.value(),
            "tracker armed"
        );

        let subscriptions = self.subscribe_all(generation);
        let deadline_timer = request.timeout.map(|timeout| {
            let tracker = self.self_ref.clone();
            self.timer.schedule(
                timeout,
                Box::new(move || {
                    if let Some(tracker) = tracker.upgrade() {
                        tracker.on_deadline(generation);
                    }
                }),
            )
        });

        let leftovers = {
            let mut state = self.state.lock();
            let current = state.generation == generation;
            match state.active.as_mut() {
                Some(active) if current => {
                    active.subscriptions = subscriptions;
                    active.deadline_timer = deadline_timer;
                    None
                }
                _ => Some((subscriptions, deadline_timer)),
            }
        };

        // Resolved while subscribing (superseded, cancelled, shut down).
        if let Some((subscriptions, deadline_timer)) = leftovers {
            debug!(generation, "releasing subscriptions of a move resolved during arm");
            if let Some(handle) = deadline_timer {
                self.timer.cancel(handle);
            }
            for sub in subscriptions {
                sub.point.unsubscribe(sub.handle);
            }
        }

        Ok(status)
    }

    fn subscribe_all(&self, generation: u64) -> Vec<Subscription> {
        let mut sources: Vec<(Source, Arc<dyn ControlPoint>)> = self
            .readbacks
            .iter()
            .enumerate()
            .map(|(index, point)| (Source::Readback(index), point.clone()))
            .collect();
        if let Some(point) = &self.done_point {
            sources.push((Source::Done, point.clone()));
        }

        sources
            .into_iter()
            .map(|(source, point)| {
                let tracker = self.self_ref.clone();
                let handle = point.subscribe(Arc::new(move |value: &PointValue| {
                    if let Some(tracker) = tracker.upgrade() {
                        tracker.on_update(generation, source, value.clone());
                    }
                }));
                Subscription { point, handle }
            })
            .collect()
    }

    /// The setpoint write for `generation` was accepted.
    pub fn write_accepted(&self, generation: u64) {
        let resolution = {
            let mut state = self.state.lock();
            if !self.is_current(&state, generation) {
                debug!(generation, "write ack for a stale move");
                return;
            }
            if state.phase != TrackerPhase::Armed {
                return;
            }
            state.phase = TrackerPhase::Evaluating;
            debug!(positioner = %self.name, generation, "setpoint accepted, evaluating");
            self.evaluate_locked(&mut state)
        };
        self.finish(resolution);
    }

    /// The setpoint write for `generation` was refused.
    pub fn write_failed(&self, generation: u64, error: PositionerError) {
        let resolution = {
            let mut state = self.state.lock();
            if !self.is_current(&state, generation) {
                return;
            }
            warn!(positioner = %self.name, generation, error = %error, "setpoint write failed");
            self.resolve_locked(&mut state, Err(error))
        };
        self.finish(resolution);
    }

    fn on_update(&self, generation: u64, source: Source, value: PointValue) {
        let resolution = {
            let mut state = self.state.lock();
            if !self.is_current(&state, generation) {
                debug!(
                    positioner = %self.name,
                    generation,
                    current = state.generation,
                    "discarding stale update"
                );
                return;
            }
            let Some(active) = state.active.as_mut() else {
                return;
            };
            match source {
                Source::Readback(index) => active.readback_values[index] = Some(value),
                Source::Done => active.done_value = Some(value),
            }

            let stop = active.stop;
            match stop {
                StopState::Confirmed => self.resolve_locked(
                    &mut state,
                    Err(PositionerError::Stopped(StopReason::Requested)),
                ),
                StopState::Requested => None,
                StopState::None => match state.phase {
                    TrackerPhase::Evaluating | TrackerPhase::Settling => {
                        self.evaluate_locked(&mut state)
                    }
                    _ => None,
                },
            }
        };
        self.finish(resolution);
    }

    fn on_deadline(&self, generation: u64) {
        let resolution = {
            let mut state = self.state.lock();
            if !self.is_current(&state, generation) {
                return;
            }
            let Some(active) = state.active.as_ref() else {
                return;
            };
            let result = if active.stop == StopState::Confirmed {
                Err(PositionerError::Stopped(StopReason::Requested))
            } else {
                warn!(
                    positioner = %self.name,
                    generation,
                    target = active.request.target,
                    "move deadline elapsed"
                );
                Err(PositionerError::TimedOut {
                    timeout: active.request.timeout.unwrap_or_default(),
                })
            };
            self.resolve_locked(&mut state, result)
        };
        self.finish(resolution);
    }

    fn on_settled(&self, generation: u64, epoch: u64) {
        let resolution = {
            let mut state = self.state.lock();
            if !self.is_current(&state, generation) || state.phase != TrackerPhase::Settling {
                return;
            }
            match state.active.as_ref() {
                Some(active) if active.settle_epoch == epoch && active.stop == StopState::None => {}
                _ => {
                    debug!(generation, epoch, "discarding stale settle timer");
                    return;
                }
            }
            debug!(positioner = %self.name, generation, "settle time elapsed");
            self.resolve_locked(&mut state, Ok(()))
        };
        self.finish(resolution);
    }

    /// Mark the active move stop-requested. Returns its generation, if any.
    pub fn request_stop(&self) -> Option<u64> {
        let mut state = self.state.lock();
        let generation = state.generation;
        let active = state.active.as_mut()?;
        active.stop = StopState::Requested;
        if let Some(handle) = active.settle_timer.take() {
            self.timer.cancel(handle);
            active.settle_epoch += 1;
        }
        debug!(positioner = %self.name, generation, "stop requested");
        Some(generation)
    }

    /// The stop write for `generation` was accepted.
    pub fn stop_accepted(&self, generation: u64) {
        let mut state = self.state.lock();
        if !self.is_current(&state, generation) {
            return;
        }
        if let Some(active) = state.active.as_mut() {
            active.stop = StopState::Confirmed;
            debug!(positioner = %self.name, generation, "stop confirmed, awaiting update");
        }
    }

    /// The stop write for `generation` was refused.
    pub fn stop_failed(&self, generation: u64, error: PositionerError) {
        let resolution = {
            let mut state = self.state.lock();
            if !self.is_current(&state, generation) {
                return;
            }
            warn!(positioner = %self.name, generation, error = %error, "stop write failed");
            self.resolve_locked(&mut state, Err(error))
        };
        self.finish(resolution);
    }

    /// Cancel tracking of `generation` if it is still the active move.
    pub fn cancel(&self, generation: u64) {
        let resolution = {
            let mut state = self.state.lock();
            if !self.is_current(&state, generation) {
                return;
            }
            self.resolve_locked(&mut state, Err(PositionerError::Stopped(StopReason::Cancelled)))
        };
        self.finish(resolution);
    }

    /// Release everything and refuse further moves. Idempotent.
    pub fn shutdown(&self) {
        let resolution = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            self.resolve_locked(&mut state, Err(PositionerError::Stopped(StopReason::Teardown)))
        };
        debug!(positioner = %self.name, "tracker shut down");
        self.finish(resolution);
    }

    fn is_current(&self, state: &TrackerState, generation: u64) -> bool {
        state.generation == generation && state.active.is_some()
    }

    fn evaluate_locked(&self, state: &mut TrackerState) -> Option<Resolution> {
        let phase = state.phase;
        let active = state.active.as_mut()?;
        // A pending or confirmed stop owns the resolution.
        if active.stop != StopState::None {
            return None;
        }
        let request = &active.request;

        let verdict = 'verdict: {
            let mut satisfied = true;
            for (index, point) in self.readbacks.iter().enumerate() {
                let value = active.readback_values[index]
                    .clone()
                    .unwrap_or_else(|| point.read());
                match value.as_f64().filter(|v| v.is_finite()) {
                    Some(actual) => satisfied &= request.tolerance.contains(request.target, actual),
                    None => {
                        break 'verdict Verdict::Invalid(PositionerError::InvalidReading {
                            address: point.address().to_string(),
                            value: value.to_string(),
                        })
                    }
                }
            }
            if let Some(point) = &self.done_point {
                let value = active.done_value.clone().unwrap_or_else(|| point.read());
                satisfied &= value.as_bool() == Some(true);
            }
            if satisfied {
                Verdict::Satisfied
            } else {
                Verdict::NotYet
            }
        };

        match verdict {
            Verdict::Invalid(error) => {
                warn!(positioner = %self.name, error = %error, "invalid readback");
                self.resolve_locked(state, Err(error))
            }
            Verdict::NotYet => {
                if phase == TrackerPhase::Settling {
                    if let Some(handle) = active.settle_timer.take() {
                        self.timer.cancel(handle);
                    }
                    active.settle_epoch += 1;
                    active.status.set_settling(false);
                    state.phase = TrackerPhase::Evaluating;
                    debug!(positioner = %self.name, "left tolerance while settling");
                }
                None
            }
            Verdict::Satisfied if phase == TrackerPhase::Settling => None,
            Verdict::Satisfied if request.settle_time.is_zero() => {
                self.resolve_locked(state, Ok(()))
            }
            Verdict::Satisfied => {
                active.settle_epoch += 1;
                let epoch = active.settle_epoch;
                let generation = request.generation;
                let tracker = self.self_ref.clone();
                active.settle_timer = Some(self.timer.schedule(
                    request.settle_time,
                    Box::new(move || {
                        if let Some(tracker) = tracker.upgrade() {
                            tracker.on_settled(generation, epoch);
                        }
                    }),
                ));
                active.status.set_settling(true);
                state.phase = TrackerPhase::Settling;
                debug!(
                    positioner = %self.name,
                    generation,
                    settle_time = ?request.settle_time,
                    "within tolerance, settling"
                );
                None
            }
        }
    }

    /// Detach the active move and describe its resolution.
    fn resolve_locked(
        &self,
        state: &mut TrackerState,
        result: PositionerResult<()>,
    ) -> Option<Resolution> {
        let active = state.active.take()?;
        let final_state = MoveState::from_result(&result);
        state.phase = TrackerPhase::Resolved(final_state);
        if final_state == MoveState::Done {
            self.done.set_unchecked(true);
        }

        let timers = active
            .deadline_timer
            .into_iter()
            .chain(active.settle_timer)
            .collect();
        Some(Resolution {
            generation: active.request.generation,
            status: active.status,
            result,
            subscriptions: active.subscriptions,
            timers,
        })
    }

    fn finish(&self, resolution: Option<Resolution>) {
        if let Some(resolution) = resolution {
            resolution.finish(self.timer.as_ref());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control_point::ObservablePoint;
    use crate::timer::TokioTimer;
    use tracing_test::traced_test;

    fn request(generation: u64, target: f64, tolerance: f64) -> MoveRequest {
        MoveRequest {
            generation,
            target,
            tolerance: Tolerance::new(tolerance).unwrap(),
            timeout: None,
            settle_time: Duration::ZERO,
            created: Instant::now(),
        }
    }

    fn tracker_with(readback: &Arc<ObservablePoint>) -> Arc<CompletionTracker> {
        let timer: Arc<dyn Timer> = Arc::new(TokioTimer::try_current().unwrap());
        CompletionTracker::new("test", vec![readback.clone() as Arc<dyn ControlPoint>], None, timer)
    }

    #[tokio::test]
    async fn test_armed_caches_without_evaluating() {
        let readback = Arc::new(ObservablePoint::readback("RBV", 0.0));
        let tracker = tracker_with(&readback);

        let status = tracker.arm(request(1, 5.0, 0.01)).unwrap();
        assert_eq!(tracker.phase(), TrackerPhase::Armed);
        assert!(!tracker.done().get());

        readback.post(5.0);
        assert!(!status.is_resolved());

        tracker.write_accepted(1);
        assert_eq!(status.result(), Some(Ok(())));
        assert!(tracker.done().get());
        assert_eq!(readback.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_stale_generation_events_are_discarded() {
        let readback = Arc::new(ObservablePoint::readback("RBV", 0.0));
        let tracker = tracker_with(&readback);

        let first = tracker.arm(request(1, 5.0, 0.01)).unwrap();
        let second = tracker.arm(request(2, 8.0, 0.01)).unwrap();
        assert_eq!(
            first.result(),
            Some(Err(PositionerError::Stopped(StopReason::Superseded)))
        );

        tracker.write_accepted(1);
        tracker.on_update(1, Source::Readback(0), PointValue::Float(8.0));
        tracker.on_deadline(1);
        tracker.cancel(1);
        assert!(!second.is_resolved());
        assert_eq!(tracker.phase(), TrackerPhase::Armed);

        tracker.write_accepted(2);
        readback.post(8.0);
        assert_eq!(second.result(), Some(Ok(())));
    }

    #[tokio::test]
    async fn test_older_request_is_superseded_immediately() {
        let readback = Arc::new(ObservablePoint::readback("RBV", 0.0));
        let tracker = tracker_with(&readback);

        let newer = tracker.arm(request(3, 1.0, 0.01)).unwrap();
        let older = tracker.arm(request(2, 2.0, 0.01)).unwrap();
        assert_eq!(older.state(), MoveState::Stopped);
        assert!(!newer.is_resolved());
        assert_eq!(tracker.generation(), 3);
    }

    #[tokio::test]
    async fn test_pending_stop_suspends_evaluation_on_ack() {
        let readback = Arc::new(ObservablePoint::readback("RBV", 5.0));
        let tracker = tracker_with(&readback);

        let status = tracker.arm(request(1, 5.0, 0.01)).unwrap();
        assert_eq!(tracker.request_stop(), Some(1));
        tracker.write_accepted(1);
        assert!(!status.is_resolved());
        assert_eq!(tracker.phase(), TrackerPhase::Evaluating);

        tracker.stop_accepted(1);
        readback.post(5.0);
        assert_eq!(
            status.result(),
            Some(Err(PositionerError::Stopped(StopReason::Requested)))
        );
        assert!(!tracker.done().get());
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_deadline_logs_warning() {
        let readback = Arc::new(ObservablePoint::readback("RBV", 0.0));
        let tracker = tracker_with(&readback);
        let mut slow = request(1, 5.0, 0.01);
        slow.timeout = Some(Duration::from_millis(500));

        let status = tracker.arm(slow).unwrap();
        tracker.write_accepted(1);
        readback.post(1.0);

        assert_eq!(
            status.wait(None).await,
            Err(PositionerError::TimedOut {
                timeout: Duration::from_millis(500)
            })
        );
        assert!(logs_contain("move deadline elapsed"));
        assert!(!tracker.done().get());
    }

    #[tokio::test]
    async fn test_shutdown_refuses_new_moves() {
        let readback = Arc::new(ObservablePoint::readback("RBV", 0.0));
        let tracker = tracker_with(&readback);
        let status = tracker.arm(request(1, 5.0, 0.01)).unwrap();

        tracker.shutdown();
        tracker.shutdown();
        assert_eq!(
            status.result(),
            Some(Err(PositionerError::Stopped(StopReason::Teardown)))
        );
        assert_eq!(readback.subscriber_count(), 0);
        assert_eq!(
            tracker.arm(request(2, 5.0, 0.01)).unwrap_err(),
            PositionerError::Closed
        );
    }
}
