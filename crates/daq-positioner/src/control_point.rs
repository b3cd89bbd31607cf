//! Control point contract and in-memory adapter.
//!
//! A control point is a named, independently addressable remote value. The
//! device/transport layer owns control points; positioners hold `Arc`
//! references and interact through the small capability set defined by
//! [`ControlPoint`]:
//!
//! - `read()` returns the cached value
//! - `write()` requests a new value (setpoint and stop points only)
//! - `subscribe()` / `unsubscribe()` manage update callbacks
//!
//! A successful `write()` means the value was *accepted*. It never means the
//! physical quantity has reached it; that is what
//! [`Positioner`](crate::Positioner) works out from readback updates.
//!
//! Device families implement [`ControlPoint`] directly. [`ObservablePoint`] is
//! the in-memory implementation used by simulated devices and tests.
//!
//! # Callback delivery
//!
//! Callbacks may be invoked from any task or thread and must not block.
//! Implementations must not hold internal locks while invoking callbacks, so
//! a callback is free to call `unsubscribe()`. A callback may still run once
//! after `unsubscribe()` returns if delivery was already in progress;
//! subscribers must tolerate that.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

use crate::error::PointError;
use crate::observable::Observable;

// =============================================================================
// PointValue
// =============================================================================

/// Value carried by a control point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PointValue {
    /// Binary state.
    Bool(bool),
    /// Integer value.
    Int(i64),
    /// Floating-point value.
    Float(f64),
    /// Enumerated state (e.g., a "Done"/"Moving" status record).
    Enum {
        /// Position in the state list.
        index: u16,
        /// State name.
        label: String,
    },
    /// Free-form string.
    Text(String),
}

impl PointValue {
    /// Numeric view. `None` for text.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PointValue::Float(v) => Some(*v),
            PointValue::Int(v) => Some(*v as f64),
            PointValue::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
            PointValue::Enum { index, .. } => Some(f64::from(*index)),
            PointValue::Text(_) => None,
        }
    }

    /// Boolean view, for done points. Non-zero numbers are true.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PointValue::Bool(v) => Some(*v),
            PointValue::Int(v) => Some(*v != 0),
            PointValue::Float(v) if v.is_finite() => Some(*v != 0.0),
            PointValue::Float(_) => None,
            PointValue::Enum { index, .. } => Some(*index != 0),
            PointValue::Text(_) => None,
        }
    }
}

impl std::fmt::Display for PointValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PointValue::Bool(v) => write!(f, "{}", v),
            PointValue::Int(v) => write!(f, "{}", v),
            PointValue::Float(v) => write!(f, "{}", v),
            PointValue::Enum { index, label } => write!(f, "{} ({})", label, index),
            PointValue::Text(v) => write!(f, "{:?}", v),
        }
    }
}

impl From<f64> for PointValue {
    fn from(value: f64) -> Self {
        PointValue::Float(value)
    }
}

impl From<i64> for PointValue {
    fn from(value: i64) -> Self {
        PointValue::Int(value)
    }
}

impl From<bool> for PointValue {
    fn from(value: bool) -> Self {
        PointValue::Bool(value)
    }
}

impl From<&str> for PointValue {
    fn from(value: &str) -> Self {
        PointValue::Text(value.to_string())
    }
}

// =============================================================================
// ControlPoint Trait
// =============================================================================

/// Callback invoked with every new value of a control point.
pub type UpdateCallback = Arc<dyn Fn(&PointValue) + Send + Sync>;

/// Handle returned by [`ControlPoint::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

impl SubscriptionHandle {
    /// Wrap a raw subscription id.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Raw subscription id.
    pub fn id(&self) -> u64 {
        self.0
    }
}

/// Capability: remote value handle.
///
/// # Contract
/// - `read()` may return a cached value and never blocks
/// - `write()` returns once the value is accepted or refused
/// - `subscribe()` does not replay the current value
/// - `unsubscribe()` with an unknown handle is a no-op
#[async_trait]
pub trait ControlPoint: Send + Sync {
    /// Network/device address of this point.
    fn address(&self) -> &str;

    /// Latest cached value.
    fn read(&self) -> PointValue;

    /// Time of the latest value update, if any update has been seen.
    fn last_update(&self) -> Option<DateTime<Utc>>;

    /// Whether [`write`](Self::write) can succeed.
    fn is_writable(&self) -> bool;

    /// Device-reported display precision in decimal places.
    fn precision(&self) -> Option<u32> {
        None
    }

    /// Request a new value.
    ///
    /// # Returns
    /// - Ok(()) if the device layer accepted the value
    /// - Err if the point is read-only or the device refused it
    async fn write(&self, value: PointValue) -> Result<(), PointError>;

    /// Register a callback for every update post.
    fn subscribe(&self, callback: UpdateCallback) -> SubscriptionHandle;

    /// Remove a callback. Unknown handles are ignored.
    fn unsubscribe(&self, handle: SubscriptionHandle);
}

/// Looks up control points by address.
pub trait PointResolver {
    /// Look up a point by address.
    fn resolve(&self, address: &str) -> Option<Arc<dyn ControlPoint>>;
}

impl PointResolver for HashMap<String, Arc<dyn ControlPoint>> {
    fn resolve(&self, address: &str) -> Option<Arc<dyn ControlPoint>> {
        self.get(address).cloned()
    }
}

// =============================================================================
// ObservablePoint
// =============================================================================

type HardwareWriter =
    Arc<dyn Fn(PointValue) -> BoxFuture<'static, Result<(), PointError>> + Send + Sync>;

/// In-memory control point backed by an [`Observable`].
///
/// Device-side code publishes values with [`post`](Self::post). Writes go
/// through an optional async hardware writer (the device accepting or
/// refusing the value) and are then cached and published like a post.
///
/// # Example
///
/// ```rust,ignore
/// let setpoint = Arc::new(ObservablePoint::setpoint("TC1:SP", 20.0).with_units("K"));
/// let readback = Arc::new(ObservablePoint::readback("TC1:RBV", 20.0).with_precision(2));
///
/// // Device task
/// readback.post(PointValue::Float(20.4));
/// ```
pub struct ObservablePoint {
    address: String,
    value: Observable<PointValue>,
    writable: bool,
    precision: Option<u32>,
    last_update: RwLock<Option<DateTime<Utc>>>,
    subscribers: Mutex<Vec<(SubscriptionHandle, UpdateCallback)>>,
    next_handle: AtomicU64,
    hardware_writer: Option<HardwareWriter>,
}

impl std::fmt::Debug for ObservablePoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObservablePoint")
            .field("address", &self.address)
            .field("value", &self.value.get())
            .field("writable", &self.writable)
            .field("subscribers", &self.subscriber_count())
            .finish_non_exhaustive()
    }
}

impl ObservablePoint {
    /// Writable point (setpoint, stop).
    pub fn setpoint(address: impl Into<String>, initial: impl Into<PointValue>) -> Self {
        Self::new(address.into(), initial.into(), true)
    }

    /// Read-only point (readback, done flag).
    pub fn readback(address: impl Into<String>, initial: impl Into<PointValue>) -> Self {
        Self::new(address.into(), initial.into(), false)
    }

    fn new(address: String, initial: PointValue, writable: bool) -> Self {
        let mut value = Observable::new(address.clone(), initial);
        if !writable {
            value = value.read_only();
        }
        Self {
            address,
            value,
            writable,
            precision: None,
            last_update: RwLock::new(None),
            subscribers: Mutex::new(Vec::new()),
            next_handle: AtomicU64::new(1),
            hardware_writer: None,
        }
    }

    /// Display precision in digits.
    pub fn with_precision(mut self, digits: u32) -> Self {
        self.precision = Some(digits);
        self
    }

    /// Engineering units.
    pub fn with_units(mut self, units: impl Into<String>) -> Self {
        self.value = self.value.with_units(units);
        self
    }

    /// Human-readable description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.value = self.value.with_description(description);
        self
    }

    /// Reject written values outside `[min, max]`.
    pub fn with_range(mut self, min: f64, max: f64) -> Self {
        self.value = self.value.with_validator(move |value: &PointValue| {
            match value.as_f64() {
                Some(v) if v >= min && v <= max => Ok(()),
                _ => Err(anyhow::anyhow!(
                    "{} out of range [{}, {}]",
                    value,
                    min,
                    max
                )),
            }
        });
        self
    }

    /// Connect an async hardware write function.
    ///
    /// `write()` awaits the writer before caching the value; if the writer
    /// fails, the cached value is unchanged and no update is published.
    pub fn with_hardware_writer(
        mut self,
        writer: impl Fn(PointValue) -> BoxFuture<'static, Result<(), PointError>>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.hardware_writer = Some(Arc::new(writer));
        self
    }

    /// Publish a device-side value to the cache and all subscribers.
    pub fn post(&self, value: impl Into<PointValue>) {
        let value = value.into();
        self.value.set_unchecked(value.clone());
        *self.last_update.write() = Some(Utc::now());

        let callbacks: Vec<UpdateCallback> = self
            .subscribers
            .lock()
            .iter()
            .map(|(_, callback)| callback.clone())
            .collect();
        for callback in callbacks {
            callback(&value);
        }
    }

    /// Async receiver of value changes (for device-side tasks).
    pub fn changes(&self) -> watch::Receiver<PointValue> {
        self.value.subscribe()
    }

    /// Number of registered update callbacks.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Engineering units, if set.
    pub fn units(&self) -> Option<String> {
        self.value.metadata().units
    }
}

#[async_trait]
impl ControlPoint for ObservablePoint {
    fn address(&self) -> &str {
        &self.address
    }

    fn read(&self) -> PointValue {
        self.value.get()
    }

    fn last_update(&self) -> Option<DateTime<Utc>> {
        *self.last_update.read()
    }

    fn is_writable(&self) -> bool {
        self.writable
    }

    fn precision(&self) -> Option<u32> {
        self.precision
    }

    async fn write(&self, value: PointValue) -> Result<(), PointError> {
        if !self.writable {
            return Err(PointError::ReadOnly(self.address.clone()));
        }

        // Validate BEFORE the hardware write so the device never sees a
        // value the point would refuse to cache.
        self.value
            .validate(&value)
            .map_err(|e| PointError::Rejected {
                address: self.address.clone(),
                reason: e.to_string(),
            })?;

        if let Some(writer) = &self.hardware_writer {
            writer(value.clone()).await?;
        }

        tracing::trace!(address = %self.address, %value, "write accepted");
        self.post(value);
        Ok(())
    }

    fn subscribe(&self, callback: UpdateCallback) -> SubscriptionHandle {
        let handle = SubscriptionHandle::new(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.subscribers.lock().push((handle, callback));
        handle
    }

    fn unsubscribe(&self, handle: SubscriptionHandle) {
        self.subscribers.lock().retain(|(h, _)| *h != handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_point_value_views() {
        assert_eq!(PointValue::Float(1.5).as_f64(), Some(1.5));
        assert_eq!(PointValue::Int(-3).as_f64(), Some(-3.0));
        assert_eq!(PointValue::Text("idle".into()).as_f64(), None);
        assert_eq!(PointValue::Int(0).as_bool(), Some(false));
        assert_eq!(PointValue::Float(f64::NAN).as_bool(), None);
        let done = PointValue::Enum {
            index: 1,
            label: "Done".into(),
        };
        assert_eq!(done.as_bool(), Some(true));
    }

    #[test]
    fn test_point_value_from_toml() {
        #[derive(Deserialize)]
        struct Doc {
            a: PointValue,
            b: PointValue,
            c: PointValue,
        }
        let doc: Doc = toml::from_str("a = 1\nb = 2.5\nc = \"STOP\"").unwrap();
        assert_eq!(doc.a, PointValue::Int(1));
        assert_eq!(doc.b, PointValue::Float(2.5));
        assert_eq!(doc.c, PointValue::Text("STOP".into()));
    }

    #[test]
    fn test_post_notifies_subscribers() {
        let point = ObservablePoint::readback("AMP:GAIN:RBV", 0.0);
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_cb = hits.clone();
        let handle = point.subscribe(Arc::new(move |_| {
            hits_cb.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(point.last_update().is_none());
        point.post(3.0);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(point.read(), PointValue::Float(3.0));
        assert!(point.last_update().is_some());

        point.unsubscribe(handle);
        point.post(4.0);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(point.subscriber_count(), 0);
    }

    #[test]
    fn test_callback_may_unsubscribe_itself() {
        let point = Arc::new(ObservablePoint::readback("TC1:RBV", 0.0));
        let slot: Arc<Mutex<Option<SubscriptionHandle>>> = Arc::new(Mutex::new(None));
        let weak = Arc::downgrade(&point);
        let slot_cb = slot.clone();
        let handle = point.subscribe(Arc::new(move |_| {
            if let (Some(point), Some(handle)) = (weak.upgrade(), *slot_cb.lock()) {
                point.unsubscribe(handle);
            }
        }));
        *slot.lock() = Some(handle);

        point.post(1.0);
        assert_eq!(point.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_readback_rejects_write() {
        let point = ObservablePoint::readback("TC1:RBV", 0.0);
        let err = point.write(PointValue::Float(1.0)).await.unwrap_err();
        assert_eq!(err, PointError::ReadOnly("TC1:RBV".into()));
    }

    #[tokio::test]
    async fn test_range_validation_before_hardware() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_hw = calls.clone();
        let point = ObservablePoint::setpoint("AMP:GAIN", 0.0)
            .with_range(0.0, 60.0)
            .with_hardware_writer(move |_| {
                calls_hw.fetch_add(1, Ordering::SeqCst);
                Box::pin(async { Ok(()) })
            });

        assert!(matches!(
            point.write(PointValue::Float(80.0)).await,
            Err(PointError::Rejected { .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        point.write(PointValue::Float(30.0)).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(point.read(), PointValue::Float(30.0));
    }

    #[tokio::test]
    async fn test_hardware_failure_leaves_cache_untouched() {
        let point = ObservablePoint::setpoint("TC1:SP", 20.0).with_hardware_writer(|_| {
            Box::pin(async { Err(PointError::Disconnected("TC1:SP".into())) })
        });

        assert!(point.write(PointValue::Float(25.0)).await.is_err());
        assert_eq!(point.read(), PointValue::Float(20.0));
        assert!(point.last_update().is_none());
    }
}
