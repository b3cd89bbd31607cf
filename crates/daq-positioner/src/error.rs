//! Error types for positioners and control points.
//!
//! Two enums cover the crate:
//!
//! - **`PointError`**: returned by [`ControlPoint::write`](crate::ControlPoint::write)
//!   when the device layer refuses a write. Carries a structured
//!   [`DriverError`] when the refusal originates in a driver.
//! - **`PositionerError`**: everything a positioner or a
//!   [`MoveStatus`](crate::MoveStatus) can report.
//!
//! ## Synchronous vs. asynchronous errors
//!
//! `InvalidTolerance`, `Configuration`, `Unsupported` and `Closed` are returned
//! directly from the call that caused them, because no asynchronous work has
//! begun. `WriteFailed`, `TimedOut`, `Stopped` and `InvalidReading` resolve a
//! `MoveStatus` and are observed through `MoveStatus::wait()` or
//! `MoveStatus::result()`.
//!
//! This layer never retries. A `TimedOut` or `WriteFailed` result is final for
//! the move that produced it; retry policy belongs to the orchestrator.

use std::time::Duration;
use thiserror::Error;

// =============================================================================
// Driver Errors
// =============================================================================

/// Category of a [`DriverError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverErrorKind {
    /// Link or protocol failure.
    Communication,
    /// Device reported a fault.
    Hardware,
    /// Device did not answer in time.
    Timeout,
    /// Device refused a parameter.
    InvalidParameter,
    /// Anything else.
    Unknown,
}

impl std::fmt::Display for DriverErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            DriverErrorKind::Communication => "communication",
            DriverErrorKind::Hardware => "hardware",
            DriverErrorKind::Timeout => "timeout",
            DriverErrorKind::InvalidParameter => "invalid_parameter",
            DriverErrorKind::Unknown => "unknown",
        };
        write!(f, "{}", label)
    }
}

/// Structured failure reported by a device driver.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Driver '{driver_type}' {kind} error: {message}")]
pub struct DriverError {
    /// Driver that raised the error.
    pub driver_type: String,
    /// Failure category.
    pub kind: DriverErrorKind,
    /// Driver-specific detail.
    pub message: String,
}

impl DriverError {
    /// Build a driver error.
    pub fn new(
        driver_type: impl Into<String>,
        kind: DriverErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            driver_type: driver_type.into(),
            kind,
            message: message.into(),
        }
    }
}

// =============================================================================
// Control Point Errors
// =============================================================================

/// Failure to write a control point.
///
/// A successful write only means the device layer accepted the value; it
/// never means the target has been reached.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PointError {
    /// The point has no write capability (e.g., a readback).
    #[error("Control point '{0}' is read-only")]
    ReadOnly(String),

    /// The device layer refused the value.
    #[error("Control point '{address}' rejected value: {reason}")]
    Rejected {
        /// Point address.
        address: String,
        /// Device-supplied reason.
        reason: String,
    },

    /// The transport behind the point is gone.
    #[error("Control point '{0}' is disconnected")]
    Disconnected(String),

    /// Structured driver failure.
    #[error(transparent)]
    Driver(#[from] DriverError),
}

// =============================================================================
// Positioner Errors
// =============================================================================

/// Why a move resolved `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// A newer move was issued on the same positioner.
    Superseded,
    /// `Positioner::stop()` was called and the stop was confirmed.
    Requested,
    /// `MoveStatus::cancel()` was called.
    Cancelled,
    /// The positioner was shut down while the move was in flight.
    Teardown,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            StopReason::Superseded => "superseded",
            StopReason::Requested => "stop requested",
            StopReason::Cancelled => "cancelled",
            StopReason::Teardown => "teardown",
        };
        write!(f, "{}", label)
    }
}

/// Convenience alias for positioner results.
pub type PositionerResult<T> = std::result::Result<T, PositionerError>;

/// Primary error type for positioners and move statuses.
///
/// `Clone` because a resolved [`MoveStatus`](crate::MoveStatus) hands the same
/// result to every waiter.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PositionerError {
    /// A setpoint or stop write was rejected by the device layer.
    ///
    /// **Error Type**: Permanent for this move.
    ///
    /// **Recovery Strategy**: The orchestrator decides whether to re-issue
    /// the move; this layer never retries.
    #[error("Write to '{address}' failed: {reason}")]
    WriteFailed {
        /// Address of the point that failed.
        address: String,
        /// Underlying write error.
        reason: String,
    },

    /// The move deadline elapsed before the readback reached tolerance.
    #[error("Move timed out after {timeout:?}")]
    TimedOut {
        /// The move's timeout.
        timeout: Duration,
    },

    /// The move was stopped cooperatively.
    #[error("Move stopped: {0}")]
    Stopped(StopReason),

    /// The positioner lacks the capability required by the call
    /// (e.g., `stop()` without a stop point).
    #[error("Operation not supported: {0}")]
    Unsupported(String),

    /// Tolerance was zero, negative, NaN or infinite.
    ///
    /// Rejected synchronously at call time.
    #[error("Invalid tolerance {0}: must be positive and finite")]
    InvalidTolerance(f64),

    /// Move target was NaN or infinite. Rejected synchronously.
    #[error("Invalid move target {0}")]
    InvalidTarget(f64),

    /// A readback could not be interpreted as a finite number while a move
    /// was being evaluated. Fails closed instead of reporting Done.
    #[error("Invalid reading from '{address}': {value}")]
    InvalidReading {
        /// Readback address.
        address: String,
        /// The offending value, rendered.
        value: String,
    },

    /// `MoveStatus::wait()` gave up before the move resolved.
    ///
    /// The move itself is unaffected and keeps running.
    #[error("Gave up waiting for move after {0:?}")]
    WaitElapsed(Duration),

    /// Positioner configuration is semantically invalid.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The positioner has been shut down.
    #[error("Positioner is shut down")]
    Closed,
}

impl PositionerError {
    /// Returns the stop reason if this error is a `Stopped` resolution.
    pub fn stop_reason(&self) -> Option<StopReason> {
        match self {
            PositionerError::Stopped(reason) => Some(*reason),
            _ => None,
        }
    }

    pub(crate) fn write_failed(address: &str, err: &PointError) -> Self {
        PositionerError::WriteFailed {
            address: address.to_string(),
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PositionerError::Stopped(StopReason::Superseded);
        assert_eq!(err.to_string(), "Move stopped: superseded");
        assert_eq!(err.stop_reason(), Some(StopReason::Superseded));
    }

    #[test]
    fn test_write_failed_keeps_point_reason() {
        let point_err = PointError::Rejected {
            address: "TC:SP".into(),
            reason: "out of range".into(),
        };
        let err = PositionerError::write_failed("TC:SP", &point_err);
        assert!(err.to_string().contains("TC:SP"));
        assert!(err.to_string().contains("out of range"));
        assert_eq!(err.stop_reason(), None);
    }

    #[test]
    fn test_driver_error_display() {
        let err = PointError::from(DriverError::new(
            "mock_amplifier",
            DriverErrorKind::Communication,
            "link down",
        ));
        assert!(err
            .to_string()
            .contains("Driver 'mock_amplifier' communication error"));
    }
}
