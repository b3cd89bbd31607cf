//! Common infrastructure for mock devices.
//!
//! - **mode**: Operational modes (Instant, Realistic, Chaos)
//! - **errors**: Write-failure injection
//! - **rng**: Seeded random number generator
//! - **task**: Background task ownership shared by all devices

pub mod errors;
pub mod mode;
pub mod rng;
pub(crate) mod task;

pub use errors::{ErrorConfig, ErrorScenario};
pub use mode::MockMode;
pub use rng::MockRng;
