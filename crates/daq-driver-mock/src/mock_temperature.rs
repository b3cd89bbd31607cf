//! Mock temperature controller.
//!
//! Publishes a setpoint (`<prefix>:SP`) and a readback (`<prefix>:RBV`). In
//! realistic modes a background task moves the readback toward the setpoint
//! with a first-order lag every tick:
//!
//! ```text
//! T[n+1] = T[n] + (SP - T[n]) * (1 - exp(-tick / time_constant)) + noise
//! ```

use anyhow::{Context, Result};
use daq_positioner::{ControlPoint, ObservablePoint, PointError, PointValue, PositionerConfig};
use futures::FutureExt;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::debug;

use crate::common::task::DeviceTask;
use crate::common::{ErrorConfig, MockMode, MockRng};

const DRIVER_TYPE: &str = "mock_temperature";

/// Configuration for [`MockTemperatureController`]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TemperatureConfig {
    /// Address prefix of the loop records
    pub prefix: String,
    /// Starting temperature in K
    pub initial_k: f64,
    /// Lowest accepted setpoint in K
    pub min_k: f64,
    /// Highest accepted setpoint in K
    pub max_k: f64,
    /// First-order approach time constant
    #[serde(with = "humantime_serde")]
    pub time_constant: Duration,
    /// Simulation step
    #[serde(with = "humantime_serde")]
    pub tick: Duration,
    /// Peak noise amplitude in K (Chaos mode)
    pub noise_k: f64,
    /// Noise RNG seed
    pub seed: Option<u64>,
    /// Simulation mode
    pub mode: MockMode,
}

impl Default for TemperatureConfig {
    fn default() -> Self {
        Self {
            prefix: "TC1".to_string(),
            initial_k: 295.0,
            min_k: 1.5,
            max_k: 500.0,
            time_constant: Duration::from_secs(2),
            tick: Duration::from_millis(100),
            noise_k: 0.02,
            seed: None,
            mode: MockMode::Realistic,
        }
    }
}

/// Simulated temperature controller with a lagging readback.
///
/// # Example
///
/// ```rust,ignore
/// let tc = MockTemperatureController::builder().prefix("CRYO").initial(300.0).build()?;
/// let positioner = PositionerBuilder::from_config(&tc.positioner_config("cryostat"), &tc.points())?
///     .build()?;
/// ```
pub struct MockTemperatureController {
    setpoint: Arc<ObservablePoint>,
    readback: Arc<ObservablePoint>,
    task: Option<DeviceTask>,
}

/// Builder for [`MockTemperatureController`]
#[derive(Debug, Default)]
pub struct TemperatureBuilder {
    config: TemperatureConfig,
    errors: ErrorConfig,
}

impl TemperatureBuilder {
    /// Replace the whole configuration.
    pub fn config(mut self, config: TemperatureConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the address prefix.
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.prefix = prefix.into();
        self
    }

    /// Set the starting temperature in K.
    pub fn initial(mut self, kelvin: f64) -> Self {
        self.config.initial_k = kelvin;
        self
    }

    /// Set the approach time constant.
    pub fn time_constant(mut self, time_constant: Duration) -> Self {
        self.config.time_constant = time_constant;
        self
    }

    /// Set the simulation step.
    pub fn tick(mut self, tick: Duration) -> Self {
        self.config.tick = tick;
        self
    }

    /// Set the simulation mode.
    pub fn mode(mut self, mode: MockMode) -> Self {
        self.config.mode = mode;
        self
    }

    /// Seed the noise generator.
    pub fn seed(mut self, seed: u64) -> Self {
        self.config.seed = Some(seed);
        self
    }

    /// Inject write failures.
    pub fn errors(mut self, errors: ErrorConfig) -> Self {
        self.errors = errors;
        self
    }

    /// Build the controller and start its background task.
    ///
    /// Realistic and Chaos modes need a Tokio runtime.
    pub fn build(self) -> Result<MockTemperatureController> {
        let TemperatureBuilder { config, errors } = self;
        let readback = Arc::new(
            ObservablePoint::readback(format!("{}:RBV", config.prefix), config.initial_k)
                .with_units("K")
                .with_precision(2),
        );

        let instant = config.mode.is_instant();
        let follower = readback.clone();
        let setpoint = Arc::new(
            ObservablePoint::setpoint(format!("{}:SP", config.prefix), config.initial_k)
                .with_units("K")
                .with_range(config.min_k, config.max_k)
                .with_hardware_writer(move |value| {
                    let errors = errors.clone();
                    let follower = follower.clone();
                    async move {
                        errors.check_write(DRIVER_TYPE, "set_temperature")?;
                        if instant {
                            follower.post(value);
                        }
                        Ok::<(), PointError>(())
                    }
                    .boxed()
                }),
        );

        let task = if instant {
            None
        } else {
            let runtime = Handle::try_current()
                .context("mock temperature controller needs a Tokio runtime")?;
            let handle = runtime.spawn(run_lag(setpoint.clone(), readback.clone(), config.clone()));
            Some(DeviceTask::new(handle.abort_handle()))
        };

        debug!(prefix = %config.prefix, mode = ?config.mode, "mock temperature controller started");
        Ok(MockTemperatureController {
            setpoint,
            readback,
            task,
        })
    }
}

async fn run_lag(
    setpoint: Arc<ObservablePoint>,
    readback: Arc<ObservablePoint>,
    config: TemperatureConfig,
) {
    let rng = MockRng::new(config.seed);
    let alpha = if config.time_constant.is_zero() {
        1.0
    } else {
        1.0 - (-config.tick.as_secs_f64() / config.time_constant.as_secs_f64()).exp()
    };
    let noise = if config.mode.is_noisy() {
        config.noise_k
    } else {
        0.0
    };

    let mut interval = tokio::time::interval(config.tick);
    interval.tick().await;
    loop {
        interval.tick().await;
        let (Some(target), Some(current)) = (setpoint.read().as_f64(), readback.read().as_f64())
        else {
            continue;
        };
        if (target - current).abs() < 1e-9 && noise == 0.0 {
            continue;
        }
        readback.post(current + (target - current) * alpha + rng.noise(noise));
    }
}

impl MockTemperatureController {
    /// Start building a controller.
    pub fn builder() -> TemperatureBuilder {
        TemperatureBuilder::default()
    }

    /// Temperature setpoint record.
    pub fn setpoint(&self) -> &Arc<ObservablePoint> {
        &self.setpoint
    }

    /// Measured temperature record.
    pub fn readback(&self) -> &Arc<ObservablePoint> {
        &self.readback
    }

    /// Current temperature in K.
    pub fn temperature(&self) -> Option<f64> {
        self.readback.read().as_f64()
    }

    /// Drive the readback directly, as if the sample drifted.
    pub fn inject_reading(&self, kelvin: impl Into<PointValue>) {
        self.readback.post(kelvin);
    }

    /// All control points keyed by address.
    pub fn points(&self) -> HashMap<String, Arc<dyn ControlPoint>> {
        let points: [Arc<dyn ControlPoint>; 2] = [self.setpoint.clone(), self.readback.clone()];
        points
            .into_iter()
            .map(|point| (point.address().to_string(), point))
            .collect()
    }

    /// Positioner configuration bound to this controller's addresses.
    pub fn positioner_config(&self, name: impl Into<String>) -> PositionerConfig {
        PositionerConfig {
            name: name.into(),
            setpoint_point: self.setpoint.address().to_string(),
            readback_points: vec![self.readback.address().to_string()],
            primary_readback: 0,
            done_point: None,
            stop_point: None,
            stop_value: PointValue::Int(1),
            tolerance: None,
            timeout: None,
            settle_time: Duration::ZERO,
        }
    }

    /// Whether the simulation task is alive.
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(DeviceTask::is_running)
    }

    /// Stop the background task. Idempotent.
    pub fn shutdown(&self) {
        if let Some(task) = &self.task {
            if task.stop() {
                debug!(prefix = %self.setpoint.address(), "mock temperature controller stopped");
            }
        }
    }
}
