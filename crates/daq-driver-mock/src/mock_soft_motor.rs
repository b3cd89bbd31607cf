//! Mock soft motor with done and stop records.
//!
//! Records, for prefix `MTR1`:
//!
//! | Address     | Kind     | Meaning                              |
//! |-------------|----------|--------------------------------------|
//! | `MTR1.VAL`  | setpoint | commanded position                   |
//! | `MTR1.RBV`  | readback | current position, ramps at velocity  |
//! | `MTR1.DMOV` | done     | `false` while moving                 |
//! | `MTR1.STOP` | stop     | write `1` to halt at current position |
//!
//! DMOV drops to `false` inside the VAL write, before the write is
//! acknowledged, and rises again when the ramp reaches the commanded
//! position or a stop is handled.

use anyhow::{Context, Result};
use daq_positioner::{ControlPoint, ObservablePoint, PointError, PointValue, PositionerConfig};
use futures::FutureExt;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::common::task::DeviceTask;
use crate::common::{ErrorConfig, MockMode, MockRng};

const DRIVER_TYPE: &str = "mock_soft_motor";

/// Configuration for [`MockSoftMotor`]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SoftMotorConfig {
    /// Record prefix, e.g. `MTR1`
    pub prefix: String,
    /// Starting position
    pub initial: f64,
    /// Lowest accepted VAL
    pub low_limit: f64,
    /// Highest accepted VAL
    pub high_limit: f64,
    /// Ramp speed in units per second
    pub velocity: f64,
    /// Ramp update period
    #[serde(with = "humantime_serde")]
    pub tick: Duration,
    /// Readback jitter while moving (Chaos mode)
    pub jitter: f64,
    /// Jitter RNG seed
    pub seed: Option<u64>,
    /// Simulation mode
    pub mode: MockMode,
}

impl Default for SoftMotorConfig {
    fn default() -> Self {
        Self {
            prefix: "MTR1".to_string(),
            initial: 0.0,
            low_limit: -100.0,
            high_limit: 100.0,
            velocity: 10.0,
            tick: Duration::from_millis(20),
            jitter: 0.0005,
            seed: None,
            mode: MockMode::Realistic,
        }
    }
}

#[derive(Clone)]
struct MotorPoints {
    setpoint: Arc<ObservablePoint>,
    readback: Arc<ObservablePoint>,
    done: Arc<ObservablePoint>,
    stop: Arc<ObservablePoint>,
}

/// Simulated motor record.
pub struct MockSoftMotor {
    points: MotorPoints,
    task: Option<DeviceTask>,
}

/// Builder for [`MockSoftMotor`]
#[derive(Debug, Default)]
pub struct SoftMotorBuilder {
    config: SoftMotorConfig,
    errors: ErrorConfig,
}

impl SoftMotorBuilder {
    /// Replace the whole configuration.
    pub fn config(mut self, config: SoftMotorConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the record prefix.
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.prefix = prefix.into();
        self
    }

    /// Set the starting position.
    pub fn initial(mut self, position: f64) -> Self {
        self.config.initial = position;
        self
    }

    /// Set the ramp speed in units per second.
    pub fn velocity(mut self, velocity: f64) -> Self {
        self.config.velocity = velocity;
        self
    }

    /// Set the simulation mode.
    pub fn mode(mut self, mode: MockMode) -> Self {
        self.config.mode = mode;
        self
    }

    /// Inject write failures.
    pub fn errors(mut self, errors: ErrorConfig) -> Self {
        self.errors = errors;
        self
    }

    /// Create the records and, unless Instant, start the ramp task.
    pub fn build(self) -> Result<MockSoftMotor> {
        let SoftMotorBuilder { config, errors } = self;
        if !(config.velocity.is_finite() && config.velocity > 0.0) {
            anyhow::bail!("motor velocity must be positive, got {}", config.velocity);
        }

        let readback = Arc::new(
            ObservablePoint::readback(format!("{}.RBV", config.prefix), config.initial)
                .with_precision(3),
        );
        let done = Arc::new(
            ObservablePoint::readback(format!("{}.DMOV", config.prefix), true)
                .with_description("done moving"),
        );
        let halt = Arc::new(AtomicBool::new(false));
        let instant = config.mode.is_instant();

        let setpoint = {
            let errors = errors.clone();
            let readback = readback.clone();
            let done = done.clone();
            Arc::new(
                ObservablePoint::setpoint(format!("{}.VAL", config.prefix), config.initial)
                    .with_range(config.low_limit, config.high_limit)
                    .with_hardware_writer(move |value| {
                        let errors = errors.clone();
                        let readback = readback.clone();
                        let done = done.clone();
                        async move {
                            errors.check_write(DRIVER_TYPE, "move")?;
                            if instant {
                                readback.post(value);
                                done.post(true);
                            } else if readback.read() != value {
                                done.post(false);
                            }
                            Ok::<(), PointError>(())
                        }
                        .boxed()
                    }),
            )
        };

        let stop = {
            let halt = halt.clone();
            let done = done.clone();
            Arc::new(
                ObservablePoint::setpoint(format!("{}.STOP", config.prefix), 0i64)
                    .with_hardware_writer(move |value| {
                        let errors = errors.clone();
                        let halt = halt.clone();
                        let done = done.clone();
                        async move {
                            errors.check_write(DRIVER_TYPE, "stop")?;
                            if value.as_bool() == Some(true) {
                                if instant {
                                    done.post(true);
                                } else {
                                    halt.store(true, Ordering::SeqCst);
                                }
                            }
                            Ok::<(), PointError>(())
                        }
                        .boxed()
                    }),
            )
        };

        let points = MotorPoints {
            setpoint,
            readback,
            done,
            stop,
        };
        let task = if instant {
            None
        } else {
            let runtime =
                Handle::try_current().context("mock soft motor needs a Tokio runtime")?;
            let handle = runtime.spawn(run_ramp(
                points.setpoint.changes(),
                points.clone(),
                halt,
                config.clone(),
            ));
            Some(DeviceTask::new(handle.abort_handle()))
        };

        debug!(prefix = %config.prefix, velocity = config.velocity, "mock soft motor started");
        Ok(MockSoftMotor { points, task })
    }
}

async fn run_ramp(
    mut changes: watch::Receiver<PointValue>,
    points: MotorPoints,
    halt: Arc<AtomicBool>,
    config: SoftMotorConfig,
) {
    let rng = MockRng::new(config.seed);
    let step = config.velocity * config.tick.as_secs_f64();
    let jitter = if config.mode.is_noisy() {
        config.jitter
    } else {
        0.0
    };

    let mut current = config.initial;
    let mut commanded = config.initial;
    let mut interval = tokio::time::interval(config.tick);
    interval.tick().await;
    loop {
        interval.tick().await;

        if changes.has_changed().unwrap_or(false) {
            if let Some(target) = changes.borrow_and_update().as_f64() {
                trace!(target, "new commanded position");
                commanded = target;
            }
        }

        if halt.swap(false, Ordering::SeqCst) {
            debug!(position = current, "halted");
            commanded = current;
            points.stop.post(0i64);
            points.readback.post(current);
            points.done.post(true);
            continue;
        }

        if current == commanded {
            continue;
        }
        let remaining = commanded - current;
        if remaining.abs() <= step {
            current = commanded;
            points.readback.post(current);
            points.done.post(true);
        } else {
            current += step * remaining.signum();
            points.readback.post(current + rng.noise(jitter));
        }
    }
}

impl MockSoftMotor {
    /// Start building a motor.
    pub fn builder() -> SoftMotorBuilder {
        SoftMotorBuilder::default()
    }

    /// The VAL record.
    pub fn setpoint(&self) -> &Arc<ObservablePoint> {
        &self.points.setpoint
    }

    /// The RBV record.
    pub fn readback(&self) -> &Arc<ObservablePoint> {
        &self.points.readback
    }

    /// The DMOV record.
    pub fn done_point(&self) -> &Arc<ObservablePoint> {
        &self.points.done
    }

    /// The STOP record.
    pub fn stop_point(&self) -> &Arc<ObservablePoint> {
        &self.points.stop
    }

    /// Current readback position.
    pub fn position(&self) -> Option<f64> {
        self.points.readback.read().as_f64()
    }

    /// `true` while DMOV is low.
    pub fn is_moving(&self) -> bool {
        self.points.done.read().as_bool() == Some(false)
    }

    /// Records keyed by address.
    pub fn points(&self) -> HashMap<String, Arc<dyn ControlPoint>> {
        let points: [Arc<dyn ControlPoint>; 4] = [
            self.points.setpoint.clone(),
            self.points.readback.clone(),
            self.points.done.clone(),
            self.points.stop.clone(),
        ];
        points
            .into_iter()
            .map(|point| (point.address().to_string(), point))
            .collect()
    }

    /// Positioner configuration using DMOV as done point and STOP as stop point.
    pub fn positioner_config(&self, name: impl Into<String>) -> PositionerConfig {
        PositionerConfig {
            name: name.into(),
            setpoint_point: self.points.setpoint.address().to_string(),
            readback_points: vec![self.points.readback.address().to_string()],
            primary_readback: 0,
            done_point: Some(self.points.done.address().to_string()),
            stop_point: Some(self.points.stop.address().to_string()),
            stop_value: PointValue::Int(1),
            tolerance: None,
            timeout: None,
            settle_time: Duration::ZERO,
        }
    }

    /// Whether the ramp task is alive. Always `false` in Instant mode.
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(DeviceTask::is_running)
    }

    /// Abort the ramp task.
    pub fn shutdown(&self) {
        if let Some(task) = &self.task {
            if task.stop() {
                debug!(prefix = %self.points.setpoint.address(), "mock soft motor stopped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_ramp_reaches_target() {
        let motor = MockSoftMotor::builder().velocity(10.0).build().unwrap();

        motor.setpoint().write(PointValue::Float(1.0)).await.unwrap();
        assert!(motor.is_moving());

        tokio::time::sleep(Duration::from_millis(50)).await;
        let partial = motor.position().unwrap();
        assert!(partial > 0.0 && partial < 1.0, "partial = {partial}");

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(motor.position(), Some(1.0));
        assert!(!motor.is_moving());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_halts_ramp() {
        let motor = MockSoftMotor::builder().velocity(10.0).build().unwrap();

        motor.setpoint().write(PointValue::Float(5.0)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        motor.stop_point().write(PointValue::Int(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let halted = motor.position().unwrap();
        assert!(halted > 0.0 && halted < 5.0, "halted = {halted}");
        assert!(!motor.is_moving());
        assert_eq!(motor.stop_point().read(), PointValue::Int(0));

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(motor.position(), Some(halted));
    }

    #[tokio::test]
    async fn test_instant_mode() {
        let motor = MockSoftMotor::builder()
            .mode(MockMode::Instant)
            .build()
            .unwrap();
        assert!(!motor.is_running());

        motor.setpoint().write(PointValue::Float(-3.5)).await.unwrap();
        assert_eq!(motor.position(), Some(-3.5));
        assert!(!motor.is_moving());
    }

    #[tokio::test]
    async fn test_limits_and_velocity_validation() {
        let motor = MockSoftMotor::builder()
            .mode(MockMode::Instant)
            .build()
            .unwrap();
        assert!(matches!(
            motor.setpoint().write(PointValue::Float(250.0)).await,
            Err(PointError::Rejected { .. })
        ));
        assert!(MockSoftMotor::builder().velocity(0.0).build().is_err());
        assert_eq!(motor.points().len(), 4);
    }

    #[test]
    fn test_positioner_config_names_records() {
        let motor = MockSoftMotor::builder()
            .prefix("SAMPLE:X")
            .mode(MockMode::Instant)
            .build()
            .unwrap();
        let config = motor.positioner_config("sample_x");
        assert_eq!(config.setpoint_point, "SAMPLE:X.VAL");
        assert_eq!(config.done_point.as_deref(), Some("SAMPLE:X.DMOV"));
        assert_eq!(config.stop_point.as_deref(), Some("SAMPLE:X.STOP"));
        config.validate().unwrap();
    }
}
