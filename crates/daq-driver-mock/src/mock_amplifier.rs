//! Mock amplifier with an independently updating readback.
//!
//! The gain readback (`<prefix>:GAIN:RBV`) is refreshed on its own
//! heartbeat, whether or not anything changed, and only reflects a new gain
//! setpoint (`<prefix>:GAIN`) after a settling latency. Until then every
//! heartbeat republishes the *old* gain, which is exactly the stream a
//! positioner must not mistake for completion.

use anyhow::{Context, Result};
use daq_positioner::{ControlPoint, ObservablePoint, PointError, PointValue, PositionerConfig};
use futures::FutureExt;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::common::task::DeviceTask;
use crate::common::{ErrorConfig, MockMode, MockRng};

const DRIVER_TYPE: &str = "mock_amplifier";

/// Configuration for [`MockAmplifier`]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AmplifierConfig {
    /// Address prefix of the gain records
    pub prefix: String,
    /// Starting gain in dB
    pub initial_db: f64,
    /// Upper gain limit in dB
    pub max_db: f64,
    /// Delay before the readback reflects a new gain
    #[serde(with = "humantime_serde")]
    pub latency: Duration,
    /// Readback refresh period
    #[serde(with = "humantime_serde")]
    pub heartbeat: Duration,
    /// Peak noise amplitude in dB (Chaos mode)
    pub noise_db: f64,
    /// Noise RNG seed; random when unset
    pub seed: Option<u64>,
    /// Simulation mode
    pub mode: MockMode,
}

impl Default for AmplifierConfig {
    fn default() -> Self {
        Self {
            prefix: "AMP1".to_string(),
            initial_db: 0.0,
            max_db: 60.0,
            latency: Duration::from_millis(250),
            heartbeat: Duration::from_millis(50),
            noise_db: 0.05,
            seed: None,
            mode: MockMode::Realistic,
        }
    }
}

/// Simulated gain stage.
pub struct MockAmplifier {
    setpoint: Arc<ObservablePoint>,
    readback: Arc<ObservablePoint>,
    task: DeviceTask,
}

impl MockAmplifier {
    /// Amplifier with default configuration and no injected errors.
    pub fn new() -> Result<Self> {
        Self::with_config(AmplifierConfig::default(), ErrorConfig::none())
    }

    /// Build the amplifier and start its heartbeat task.
    ///
    /// In Instant mode the latency is ignored; heartbeats still run.
    pub fn with_config(config: AmplifierConfig, errors: ErrorConfig) -> Result<Self> {
        let runtime = Handle::try_current().context("mock amplifier needs a Tokio runtime")?;

        let setpoint = Arc::new(
            ObservablePoint::setpoint(format!("{}:GAIN", config.prefix), config.initial_db)
                .with_units("dB")
                .with_range(0.0, config.max_db)
                .with_hardware_writer(move |_| {
                    let errors = errors.clone();
                    async move {
                        errors.check_write(DRIVER_TYPE, "set_gain")?;
                        Ok::<(), PointError>(())
                    }
                    .boxed()
                }),
        );
        let readback = Arc::new(
            ObservablePoint::readback(format!("{}:GAIN:RBV", config.prefix), config.initial_db)
                .with_units("dB")
                .with_description("measured gain"),
        );

        let handle = runtime.spawn(run_heartbeat(
            setpoint.changes(),
            readback.clone(),
            config.clone(),
        ));
        debug!(prefix = %config.prefix, latency = ?config.latency, "mock amplifier started");

        Ok(Self {
            setpoint,
            readback,
            task: DeviceTask::new(handle.abort_handle()),
        })
    }

    /// Gain setpoint record.
    pub fn setpoint(&self) -> &Arc<ObservablePoint> {
        &self.setpoint
    }

    /// Measured gain record.
    pub fn readback(&self) -> &Arc<ObservablePoint> {
        &self.readback
    }

    /// Last published gain.
    pub fn gain(&self) -> Option<f64> {
        self.readback.read().as_f64()
    }

    /// Records keyed by address, for `PositionerBuilder::from_config`.
    pub fn points(&self) -> HashMap<String, Arc<dyn ControlPoint>> {
        let points: [Arc<dyn ControlPoint>; 2] = [self.setpoint.clone(), self.readback.clone()];
        points
            .into_iter()
            .map(|point| (point.address().to_string(), point))
            .collect()
    }

    /// Positioner configuration with a 0.1 dB tolerance and no done point.
    pub fn positioner_config(&self, name: impl Into<String>) -> PositionerConfig {
        PositionerConfig {
            name: name.into(),
            setpoint_point: self.setpoint.address().to_string(),
            readback_points: vec![self.readback.address().to_string()],
            primary_readback: 0,
            done_point: None,
            stop_point: None,
            stop_value: PointValue::Int(1),
            tolerance: Some(0.1),
            timeout: None,
            settle_time: Duration::ZERO,
        }
    }

    /// Whether the heartbeat task is alive.
    pub fn is_running(&self) -> bool {
        self.task.is_running()
    }

    /// Stop the heartbeat task. Idempotent.
    pub fn shutdown(&self) {
        if self.task.stop() {
            debug!(address = %self.setpoint.address(), "mock amplifier stopped");
        }
    }
}

async fn run_heartbeat(
    mut changes: watch::Receiver<PointValue>,
    readback: Arc<ObservablePoint>,
    config: AmplifierConfig,
) {
    let rng = MockRng::new(config.seed);
    let latency = if config.mode.is_instant() {
        Duration::ZERO
    } else {
        config.latency
    };
    let noise = if config.mode.is_noisy() {
        config.noise_db
    } else {
        0.0
    };

    let mut applied = config.initial_db;
    let mut pending: Option<(f64, Instant)> = None;
    let mut heartbeat = tokio::time::interval(config.heartbeat);

    loop {
        let apply_at = pending.map(|(_, at)| at);
        tokio::select! {
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
                if let Some(gain) = changes.borrow_and_update().as_f64() {
                    trace!(gain, "gain change pending");
                    pending = Some((gain, Instant::now() + latency));
                }
            }
            _ = tokio::time::sleep_until(apply_at.unwrap_or_else(Instant::now)), if apply_at.is_some() => {
                if let Some((gain, _)) = pending.take() {
                    applied = gain;
                    readback.post(applied + rng.noise(noise));
                }
            }
            _ = heartbeat.tick() => {
                readback.post(applied + rng.noise(noise));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_readback_applies_after_latency() {
        let amp = MockAmplifier::new().unwrap();
        amp.setpoint().write(PointValue::Float(20.0)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(amp.gain(), Some(0.0));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(amp.gain(), Some(20.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_republishes_unchanged_gain() {
        let amp = MockAmplifier::new().unwrap();
        let updates = Arc::new(AtomicUsize::new(0));
        let counter = updates.clone();
        amp.readback().subscribe(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        tokio::time::sleep(Duration::from_millis(525)).await;
        assert!(updates.load(Ordering::SeqCst) >= 10);
        assert_eq!(amp.gain(), Some(0.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gain_limit_and_injected_fault() {
        let errors = ErrorConfig::scenario(crate::ErrorScenario::Timeout {
            operation: "set_gain",
        });
        let amp = MockAmplifier::with_config(AmplifierConfig::default(), errors).unwrap();

        assert!(matches!(
            amp.setpoint().write(PointValue::Float(75.0)).await,
            Err(PointError::Rejected { .. })
        ));
        assert!(matches!(
            amp.setpoint().write(PointValue::Float(10.0)).await,
            Err(PointError::Driver(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown() {
        let amp = MockAmplifier::new().unwrap();
        assert!(amp.is_running());
        amp.shutdown();
        assert!(!amp.is_running());
    }
}
