//! Setpoint/readback positioners with race-free completion tracking.
//!
//! A *positioner* moves a remote quantity (temperature, gain, a motor axis)
//! by writing a **setpoint** control point and watching one or more
//! **readback** control points until they come within tolerance of the
//! target. Accepting a setpoint write never means the target was reached;
//! completion is decided from readback updates, optionally gated on a
//! hardware "done" flag and a settle time.
//!
//! # Architecture
//!
//! ```text
//! Orchestrator ──move_to()──▶ Positioner ──write──▶ setpoint ControlPoint
//!      ▲                          │
//!      │ MoveStatus               ▼ arm(generation)
//!      └────────────────── CompletionTracker ◀──updates── readback / done points
//!                                 │
//!                                 └── Timer (settle, deadline)
//! ```
//!
//! - [`ControlPoint`]: capability trait implemented by the device layer
//!   ([`ObservablePoint`] is the in-memory implementation)
//! - [`Tolerance`]: validated "close enough" model with explicit resolution order
//! - [`CompletionTracker`]: one resolution per move, tagged by generation
//! - [`Positioner`]: the public object, built with [`PositionerBuilder`]
//! - [`MoveStatus`]: awaitable, cancellable handle to one move
//! - [`Timer`]: settle/deadline timers ([`TokioTimer`])
//!
//! # Example
//!
//! ```rust,ignore
//! use daq_positioner::{MoveOptions, ObservablePoint, Positioner};
//!
//! let setpoint = Arc::new(ObservablePoint::setpoint("TC1:SP", 20.0));
//! let readback = Arc::new(ObservablePoint::readback("TC1:RBV", 20.0).with_precision(2));
//!
//! let cryostat = Positioner::builder("cryostat", setpoint)
//!     .readback(readback)
//!     .settle_time(Duration::from_secs(30))
//!     .build()?;
//!
//! let status = cryostat.move_to(4.2, MoveOptions::default().timeout(Duration::from_secs(900)))?;
//! status.wait(None).await?;
//! assert!(cryostat.done());
//! ```

pub mod config;
pub mod control_point;
pub mod error;
pub mod observable;
pub mod positioner;
pub mod status;
pub mod timer;
pub mod tolerance;
pub mod tracker;

pub use config::{load_config, load_config_str, PositionerConfig};
pub use control_point::{
    ControlPoint, ObservablePoint, PointResolver, PointValue, SubscriptionHandle, UpdateCallback,
};
pub use error::{
    DriverError, DriverErrorKind, PointError, PositionerError, PositionerResult, StopReason,
};
pub use observable::{Observable, ObservableMetadata};
pub use positioner::{MoveOptions, Positioner, PositionerBuilder};
pub use status::{MoveState, MoveStatus};
pub use timer::{Timer, TimerHandle, TokioTimer};
pub use tolerance::{within, Tolerance, GLOBAL_DEFAULT_TOLERANCE};
pub use tracker::{CompletionTracker, MoveRequest, TrackerPhase};
