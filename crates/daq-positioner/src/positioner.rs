//! Setpoint/readback positioner.
//!
//! A [`Positioner`] composes one writable setpoint, one or more readbacks, an
//! optional hardware done point and an optional stop point. `move_to()`
//! writes the setpoint and returns a [`MoveStatus`] that completes when the
//! readbacks come within tolerance of the target (and the done point, if
//! any, reports true).
//!
//! Setpoint and stop writes go through a single writer task per positioner,
//! so they reach the device in the order they were requested.
//!
//! # Example
//!
//! ```rust,ignore
//! let positioner = Positioner::builder("cryostat", setpoint)
//!     .readback(readback)
//!     .tolerance(0.05)
//!     .timeout(Duration::from_secs(600))
//!     .build()?;
//!
//! positioner.move_to(4.2, MoveOptions::default())?.wait(None).await?;
//! ```

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::PositionerConfig;
use crate::control_point::{ControlPoint, PointResolver, PointValue};
use crate::error::{PositionerError, PositionerResult};
use crate::status::MoveStatus;
use crate::timer::{Timer, TokioTimer};
use crate::tolerance::Tolerance;
use crate::tracker::{CompletionTracker, MoveRequest, TrackerPhase};

/// Per-move overrides. Unset fields fall back to the positioner defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MoveOptions {
    /// Overrides the positioner tolerance.
    pub tolerance: Option<f64>,
    /// Overrides the positioner timeout.
    pub timeout: Option<Duration>,
    /// Overrides the positioner settle time.
    pub settle_time: Option<Duration>,
}

impl MoveOptions {
    /// Use this tolerance for the move.
    pub fn tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = Some(tolerance);
        self
    }

    /// Give the move a deadline.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Require the readback to stay in tolerance this long.
    pub fn settle_time(mut self, settle_time: Duration) -> Self {
        self.settle_time = Some(settle_time);
        self
    }
}

#[derive(Debug)]
enum WriteCommand {
    Setpoint { generation: u64, target: f64 },
    Stop { generation: Option<u64> },
}

/// Positioner-level defaults for new moves.
#[derive(Debug, Clone, Copy)]
struct MoveDefaults {
    tolerance: Option<f64>,
    timeout: Option<Duration>,
    settle_time: Duration,
}

/// Drives one setpoint and tracks completion on its readbacks.
pub struct Positioner {
    name: String,
    setpoint: Arc<dyn ControlPoint>,
    readbacks: Vec<Arc<dyn ControlPoint>>,
    primary: usize,
    has_stop_point: bool,
    defaults: MoveDefaults,
    tracker: Arc<CompletionTracker>,
    next_generation: AtomicU64,
    commands: Mutex<Option<mpsc::UnboundedSender<WriteCommand>>>,
}

impl std::fmt::Debug for Positioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Positioner")
            .field("name", &self.name)
            .field("setpoint", &self.setpoint.address())
            .field("primary_readback", &self.readbacks[self.primary].address())
            .field("tracker", &self.tracker)
            .finish_non_exhaustive()
    }
}

impl Positioner {
    /// Start building a positioner around `setpoint`.
    pub fn builder(name: impl Into<String>, setpoint: Arc<dyn ControlPoint>) -> PositionerBuilder {
        PositionerBuilder::new(name, setpoint)
    }

    /// Positioner name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Start a move to `target`.
    ///
    /// Returns as soon as the move is armed; the setpoint write happens in
    /// the background. Any unresolved earlier move resolves
    /// `Stopped(Superseded)`.
    ///
    /// Readback updates are only cached while the setpoint write is pending.
    /// If that write never returns, the move can only end at its deadline,
    /// or through `stop()`, `cancel()` or a newer move.
    ///
    /// # Errors
    /// - `InvalidTarget` if `target` is NaN or infinite
    /// - `InvalidTolerance` if the resolved tolerance is not positive and finite
    /// - `Closed` after [`shutdown`](Self::shutdown)
    pub fn move_to(&self, target: f64, options: MoveOptions) -> PositionerResult<MoveStatus> {
        if !target.is_finite() {
            return Err(PositionerError::InvalidTarget(target));
        }
        let precision = self.readbacks[self.primary]
            .precision()
            .or_else(|| self.setpoint.precision());
        let tolerance = Tolerance::resolve(options.tolerance, precision, self.defaults.tolerance)?;
        let commands = self.commands.lock().clone().ok_or(PositionerError::Closed)?;

        let request = MoveRequest {
            generation: self.next_generation.fetch_add(1, Ordering::SeqCst) + 1,
            target,
            tolerance,
            timeout: options.timeout.or(self.defaults.timeout),
            settle_time: options.settle_time.unwrap_or(self.defaults.settle_time),
            created: Instant::now(),
        };
        let generation = request.generation;
        let status = self.tracker.arm(request)?;

        info!(
            positioner = %self.name,
            generation,
            target,
            tolerance = tolerance.value(),
            "move issued"
        );
        if commands
            .send(WriteCommand::Setpoint { generation, target })
            .is_err()
        {
            self.tracker.write_failed(
                generation,
                PositionerError::WriteFailed {
                    address: self.setpoint.address().to_string(),
                    reason: "writer task is gone".to_string(),
                },
            );
        }
        Ok(status)
    }

    /// Ask the device to stop.
    ///
    /// The active move (if any) resolves `Stopped(Requested)` on the first
    /// update after the stop write is accepted, or `Failed(WriteFailed)` if
    /// the stop write is refused.
    ///
    /// # Errors
    /// - `Unsupported` if no stop point is configured
    /// - `Closed` after [`shutdown`](Self::shutdown)
    pub fn stop(&self) -> PositionerResult<()> {
        if !self.has_stop_point {
            return Err(PositionerError::Unsupported(format!(
                "positioner '{}' has no stop point",
                self.name
            )));
        }
        let commands = self.commands.lock().clone().ok_or(PositionerError::Closed)?;

        let generation = self.tracker.request_stop();
        info!(positioner = %self.name, ?generation, "stop requested");
        commands
            .send(WriteCommand::Stop { generation })
            .map_err(|_| PositionerError::Closed)
    }

    /// Latest cached value of the primary readback.
    pub fn position(&self) -> Option<f64> {
        self.readbacks[self.primary]
            .read()
            .as_f64()
            .filter(|v| v.is_finite())
    }

    /// True only when the most recent move resolved `Done`.
    pub fn done(&self) -> bool {
        self.tracker.done().get()
    }

    /// Watch the done flag.
    pub fn subscribe_done(&self) -> watch::Receiver<bool> {
        self.tracker.done().subscribe()
    }

    /// Generation of the most recent move.
    pub fn generation(&self) -> u64 {
        self.tracker.generation()
    }

    /// Current tracker phase.
    pub fn phase(&self) -> TrackerPhase {
        self.tracker.phase()
    }

    /// Update subscriptions currently held on behalf of the active move.
    pub fn active_subscriptions(&self) -> usize {
        self.tracker.active_subscriptions()
    }

    /// Release all subscriptions and timers. Idempotent.
    ///
    /// An active move resolves `Stopped(Teardown)`. No device write is made.
    pub fn shutdown(&self) {
        let sender = self.commands.lock().take();
        if sender.is_some() {
            info!(positioner = %self.name, "shutting down positioner");
        }
        self.tracker.shutdown();
    }
}

impl Drop for Positioner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Serializes setpoint and stop writes for one positioner.
async fn run_writer(
    mut commands: mpsc::UnboundedReceiver<WriteCommand>,
    setpoint: Arc<dyn ControlPoint>,
    stop: Option<(Arc<dyn ControlPoint>, PointValue)>,
    tracker: Weak<CompletionTracker>,
) {
    while let Some(command) = commands.recv().await {
        match command {
            WriteCommand::Setpoint { generation, target } => {
                let current = tracker
                    .upgrade()
                    .is_some_and(|t| !t.is_closed() && t.generation() == generation);
                if !current {
                    debug!(generation, "skipping setpoint write for a superseded move");
                    continue;
                }

                let result = setpoint.write(PointValue::Float(target)).await;
                let Some(tracker) = tracker.upgrade() else {
                    break;
                };
                match result {
                    Ok(()) => tracker.write_accepted(generation),
                    Err(e) => tracker.write_failed(
                        generation,
                        PositionerError::write_failed(setpoint.address(), &e),
                    ),
                }
            }
            WriteCommand::Stop { generation } => {
                let Some((point, value)) = &stop else {
                    continue;
                };
                let result = point.write(value.clone()).await;
                let tracker = tracker.upgrade();
                match (result, generation, tracker) {
                    (Ok(()), Some(generation), Some(tracker)) => tracker.stop_accepted(generation),
                    (Err(e), Some(generation), Some(tracker)) => tracker.stop_failed(
                        generation,
                        PositionerError::write_failed(point.address(), &e),
                    ),
                    (Err(e), _, _) => {
                        warn!(address = %point.address(), error = %e, "stop write failed")
                    }
                    (Ok(()), _, _) => {}
                }
            }
        }
    }
    debug!(address = %setpoint.address(), "positioner writer finished");
}

/// Builder for [`Positioner`].
pub struct PositionerBuilder {
    name: String,
    setpoint: Arc<dyn ControlPoint>,
    readbacks: Vec<Arc<dyn ControlPoint>>,
    primary: usize,
    done_point: Option<Arc<dyn ControlPoint>>,
    stop_point: Option<Arc<dyn ControlPoint>>,
    stop_value: PointValue,
    tolerance: Option<f64>,
    timeout: Option<Duration>,
    settle_time: Duration,
    timer: Option<Arc<dyn Timer>>,
}

impl std::fmt::Debug for PositionerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PositionerBuilder")
            .field("name", &self.name)
            .field("setpoint", &self.setpoint.address())
            .field("primary", &self.primary)
            .finish_non_exhaustive()
    }
}

impl PositionerBuilder {
    /// Builder with no readbacks and no defaults.
    pub fn new(name: impl Into<String>, setpoint: Arc<dyn ControlPoint>) -> Self {
        Self {
            name: name.into(),
            setpoint,
            readbacks: Vec::new(),
            primary: 0,
            done_point: None,
            stop_point: None,
            stop_value: PointValue::Int(1),
            tolerance: None,
            timeout: None,
            settle_time: Duration::ZERO,
            timer: None,
        }
    }

    /// Bind a configuration's addresses through `resolver`.
    pub fn from_config(
        config: &PositionerConfig,
        resolver: &impl PointResolver,
    ) -> PositionerResult<Self> {
        config.validate()?;
        let lookup = |address: &str| {
            resolver.resolve(address).ok_or_else(|| {
                PositionerError::Configuration(format!("unknown control point '{}'", address))
            })
        };

        let mut builder = Self::new(&config.name, lookup(&config.setpoint_point)?)
            .primary_readback(config.primary_readback)
            .stop_value(config.stop_value.clone())
            .settle_time(config.settle_time);
        for address in &config.readback_points {
            builder = builder.readback(lookup(address)?);
        }
        if let Some(address) = &config.done_point {
            builder = builder.done_point(lookup(address)?);
        }
        if let Some(address) = &config.stop_point {
            builder = builder.stop_point(lookup(address)?);
        }
        if let Some(tolerance) = config.tolerance {
            builder = builder.tolerance(tolerance);
        }
        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }
        Ok(builder)
    }

    /// Add a readback. The first one added is primary.
    pub fn readback(mut self, point: Arc<dyn ControlPoint>) -> Self {
        self.readbacks.push(point);
        self
    }

    /// Index of the readback reported by `position()`.
    pub fn primary_readback(mut self, index: usize) -> Self {
        self.primary = index;
        self
    }

    /// Wait for this flag as well as the readbacks.
    pub fn done_point(mut self, point: Arc<dyn ControlPoint>) -> Self {
        self.done_point = Some(point);
        self
    }

    /// Enable [`Positioner::stop`] through this point.
    pub fn stop_point(mut self, point: Arc<dyn ControlPoint>) -> Self {
        self.stop_point = Some(point);
        self
    }

    /// Value written to the stop point (default `1`).
    pub fn stop_value(mut self, value: impl Into<PointValue>) -> Self {
        self.stop_value = value.into();
        self
    }

    /// Default tolerance for moves.
    pub fn tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = Some(tolerance);
        self
    }

    /// Default move deadline.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Default settle time.
    pub fn settle_time(mut self, settle_time: Duration) -> Self {
        self.settle_time = settle_time;
        self
    }

    /// Use a custom timer service instead of [`TokioTimer`].
    pub fn timer(mut self, timer: Arc<dyn Timer>) -> Self {
        self.timer = Some(timer);
        self
    }

    /// Build the positioner.
    ///
    /// Must be called within a Tokio runtime; the writer task and default
    /// timer are bound to it.
    pub fn build(self) -> PositionerResult<Positioner> {
        if self.readbacks.is_empty() {
            return Err(PositionerError::Configuration(format!(
                "positioner '{}' needs at least one readback",
                self.name
            )));
        }
        if self.primary >= self.readbacks.len() {
            return Err(PositionerError::Configuration(format!(
                "primary readback index {} out of range ({} readbacks)",
                self.primary,
                self.readbacks.len()
            )));
        }
        if !self.setpoint.is_writable() {
            return Err(PositionerError::Configuration(format!(
                "setpoint '{}' is not writable",
                self.setpoint.address()
            )));
        }
        if let Some(point) = self.stop_point.as_ref().filter(|p| !p.is_writable()) {
            return Err(PositionerError::Configuration(format!(
                "stop point '{}' is not writable",
                point.address()
            )));
        }
        if let Some(tolerance) = self.tolerance {
            Tolerance::new(tolerance)?;
        }

        let runtime = Handle::try_current().map_err(|_| {
            PositionerError::Configuration("positioner requires a Tokio runtime".to_string())
        })?;
        let timer = match self.timer {
            Some(timer) => timer,
            None => Arc::new(TokioTimer::new(runtime.clone())),
        };
        let tracker = CompletionTracker::new(
            self.name.clone(),
            self.readbacks.clone(),
            self.done_point,
            timer,
        );

        let (sender, receiver) = mpsc::unbounded_channel();
        let has_stop_point = self.stop_point.is_some();
        runtime.spawn(run_writer(
            receiver,
            self.setpoint.clone(),
            self.stop_point.map(|point| (point, self.stop_value)),
            Arc::downgrade(&tracker),
        ));

        debug!(
            positioner = %self.name,
            setpoint = %self.setpoint.address(),
            readbacks = self.readbacks.len(),
            has_stop_point,
            "positioner built"
        );

        Ok(Positioner {
            name: self.name,
            setpoint: self.setpoint,
            readbacks: self.readbacks,
            primary: self.primary,
            has_stop_point,
            defaults: MoveDefaults {
                tolerance: self.tolerance,
                timeout: self.timeout,
                settle_time: self.settle_time,
            },
            tracker,
            next_generation: AtomicU64::new(0),
            commands: Mutex::new(Some(sender)),
        })
    }
}
