//! Numeric "close enough" decisions.
//!
//! [`within`] is the whole tolerance model: `|a - b| <= tol`, failing closed
//! on any non-finite input. [`Tolerance`] is a validated wrapper that can only
//! hold a positive, finite value, and [`Tolerance::resolve`] applies the
//! resolution order used by positioners:
//!
//! ```text
//! explicit per-move override > device-reported precision > positioner default > global default
//! ```

use crate::error::{PositionerError, PositionerResult};

/// Tolerance used when nothing more specific is known.
pub const GLOBAL_DEFAULT_TOLERANCE: f64 = 1e-6;

/// Precision above this many decimal places is ignored (underflows to a
/// tolerance too small to be meaningful for f64 readbacks).
const MAX_PRECISION_DIGITS: u32 = 12;

/// `|a - b| <= tol`. Never true if any argument is NaN or infinite.
pub fn within(a: f64, b: f64, tol: f64) -> bool {
    if !(a.is_finite() && b.is_finite() && tol.is_finite()) {
        return false;
    }
    (a - b).abs() <= tol
}

/// A positive, finite tolerance.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Tolerance(f64);

impl Tolerance {
    /// Validate a raw tolerance.
    ///
    /// Zero is rejected along with negative and non-finite values: a zero
    /// tolerance can only be met by exact float equality.
    pub fn new(value: f64) -> PositionerResult<Self> {
        if value.is_finite() && value > 0.0 {
            Ok(Self(value))
        } else {
            Err(PositionerError::InvalidTolerance(value))
        }
    }

    /// Tolerance from a device display precision (decimal places).
    ///
    /// `3` means the device reports values to the nearest `0.001`.
    pub fn from_precision(digits: u32) -> Option<Self> {
        if digits > MAX_PRECISION_DIGITS {
            return None;
        }
        Some(Self(10f64.powi(-(digits as i32))))
    }

    /// Apply the resolution order.
    ///
    /// An explicit override or positioner default that is invalid is an
    /// error rather than silently skipped.
    pub fn resolve(
        explicit: Option<f64>,
        device_precision: Option<u32>,
        positioner_default: Option<f64>,
    ) -> PositionerResult<Self> {
        if let Some(value) = explicit {
            return Self::new(value);
        }
        if let Some(tol) = device_precision.and_then(Self::from_precision) {
            return Ok(tol);
        }
        if let Some(value) = positioner_default {
            return Self::new(value);
        }
        Ok(Self(GLOBAL_DEFAULT_TOLERANCE))
    }

    /// The tolerance as a plain number.
    pub fn value(&self) -> f64 {
        self.0
    }

    /// Whether `actual` is within this tolerance of `target`.
    pub fn contains(&self, target: f64, actual: f64) -> bool {
        within(target, actual, self.0)
    }
}

impl Default for Tolerance {
    fn default() -> Self {
        Self(GLOBAL_DEFAULT_TOLERANCE)
    }
}

impl std::fmt::Display for Tolerance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "±{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_within_boundary_is_inclusive() {
        assert!(within(5.0, 5.01, 0.01 + 1e-12));
        assert!(within(5.0, 5.0, 1e-9));
        assert!(!within(5.0, 5.02, 0.01));
    }

    #[test]
    fn test_within_fails_closed() {
        assert!(!within(f64::NAN, 5.0, 1.0));
        assert!(!within(5.0, f64::INFINITY, 1.0));
        assert!(!within(5.0, 5.0, f64::NAN));
        assert!(!within(5.0, 5.0, f64::INFINITY));
    }

    #[test]
    fn test_tolerance_validation() {
        assert!(Tolerance::new(0.01).is_ok());
        assert_eq!(
            Tolerance::new(-0.1),
            Err(PositionerError::InvalidTolerance(-0.1))
        );
        assert!(Tolerance::new(0.0).is_err());
        assert!(Tolerance::new(f64::NAN).is_err());
        assert!(Tolerance::new(f64::INFINITY).is_err());
    }

    #[test]
    fn test_resolution_order() {
        let explicit = Tolerance::resolve(Some(0.5), Some(2), Some(0.1)).unwrap();
        assert_eq!(explicit.value(), 0.5);

        let precision = Tolerance::resolve(None, Some(2), Some(0.1)).unwrap();
        assert!((precision.value() - 0.01).abs() < 1e-15);

        let default = Tolerance::resolve(None, None, Some(0.1)).unwrap();
        assert_eq!(default.value(), 0.1);

        let global = Tolerance::resolve(None, None, None).unwrap();
        assert_eq!(global.value(), GLOBAL_DEFAULT_TOLERANCE);
    }

    #[test]
    fn test_invalid_override_is_not_skipped() {
        assert!(Tolerance::resolve(Some(f64::NAN), Some(2), Some(0.1)).is_err());
    }

    #[test]
    fn test_absurd_precision_falls_through() {
        let tol = Tolerance::resolve(None, Some(40), Some(0.1)).unwrap();
        assert_eq!(tol.value(), 0.1);
    }
}
