//! Mock control-point devices for daq-positioner
//!
//! This crate provides simulated devices that publish setpoint, readback,
//! done and stop control points, so positioners can be exercised without
//! physical hardware. All device tasks use async-safe timing
//! (`tokio::time`, never `std::thread::sleep`) and run under a paused clock.
//!
//! # Available Mock Devices
//!
//! - [`MockTemperatureController`] - first-order lag toward the setpoint
//! - [`MockAmplifier`] - gain readback refreshed on a heartbeat, applied after a latency
//! - [`MockSoftMotor`] - ramping motor record with DMOV and STOP
//!
//! # Performance Characteristics
//!
//! - MockTemperatureController: 2s time constant, 100ms tick, 1.5-500 K
//! - MockAmplifier: 250ms latency, 50ms heartbeat, 0-60 dB
//! - MockSoftMotor: 10 units/s, 20ms tick, ±100 units
//!
//! # Wiring a Positioner
//!
//! Every device exposes its control points keyed by address and a matching
//! [`PositionerConfig`](daq_positioner::PositionerConfig):
//!
//! ```rust,ignore
//! use daq_driver_mock::MockSoftMotor;
//! use daq_positioner::PositionerBuilder;
//!
//! let motor = MockSoftMotor::builder().prefix("SAMPLE:X").build()?;
//! let axis = PositionerBuilder::from_config(&motor.positioner_config("sample_x"), &motor.points())?
//!     .build()?;
//! axis.move_to(2.5, Default::default())?.wait(None).await?;
//! ```

pub mod common;
mod mock_amplifier;
mod mock_soft_motor;
mod mock_temperature;

// Re-export common types
pub use common::{ErrorConfig, ErrorScenario, MockMode, MockRng};

// Re-export device types
pub use mock_amplifier::{AmplifierConfig, MockAmplifier};
pub use mock_soft_motor::{MockSoftMotor, SoftMotorBuilder, SoftMotorConfig};
pub use mock_temperature::{MockTemperatureController, TemperatureBuilder, TemperatureConfig};
