//! Per-device-type datapoint mapping and value processors
//!
//! `DeviceModel` is a trait any device type can implement, mapping between
//! this crate's `Values` map and the semantic external properties MQTT/
//! Home Assistant see. `MeacoDehumidifier` below is the bundled example
//! implementation for a Meaco Arete Two 25L dehumidifier. Value processors
//! are grounded on `device/value_processors.py`.

use std::collections::VecDeque;
use std::time::Duration;

use crate::constraints::{Constraint, Constraints, Forbidden};
use crate::value::{Value, Values};

/// Per-device-type translation between external (MQTT/HA-facing) values,
/// keyed by semantic name, and wire `Values`, keyed by numeric datapoint.
pub trait DeviceModel: Send + Sync {
    /// External keys this model understands, for discovery/documentation.
    fn datapoints(&self) -> &[&'static str];

    /// Encode a (possibly partial) external update into wire datapoints.
    /// Unknown or read-only external keys are dropped.
    fn to_wire(&self, external: &Values) -> Values;

    /// Decode a (possibly partial) wire snapshot into external values,
    /// running any configured value processors. Takes `&mut self` since
    /// processors (moving average, time-debounce) carry state across calls.
    fn from_wire(&mut self, wire: &Values) -> Values;

    fn constraints(&self) -> Constraints;
}

/// An inbound-value transform, applied after `from_wire` decoding and
/// before the value reaches the external representation. Stateful
/// processors (moving average, time-debounce) carry history across calls;
/// `Round` is stateless but implements the same trait for uniform chaining.
pub trait ValueProcessor: Send {
    fn apply(&mut self, value: Value) -> Value;
}

/// Smooths a numeric reading over the last `window` observations.
pub struct MovingAverage {
    window: usize,
    samples: VecDeque<f64>,
}

impl MovingAverage {
    pub fn new(window: usize) -> Self {
        assert!(window > 0, "moving average window must be positive");
        Self {
            window,
            samples: VecDeque::with_capacity(window),
        }
    }
}

impl ValueProcessor for MovingAverage {
    fn apply(&mut self, value: Value) -> Value {
        let Some(x) = value.as_f64() else {
            return value;
        };
        if self.samples.len() == self.window {
            self.samples.pop_front();
        }
        self.samples.push_back(x);
        let avg = self.samples.iter().sum::<f64>() / self.samples.len() as f64;
        Value::Float(avg)
    }
}

/// Suppresses updates that arrive more often than `min_interval`, replaying
/// the last accepted value instead.
pub struct TimeDebounce {
    min_interval: Duration,
    last_emit: Option<std::time::Instant>,
    last_value: Option<Value>,
}

impl TimeDebounce {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_emit: None,
            last_value: None,
        }
    }
}

impl ValueProcessor for TimeDebounce {
    fn apply(&mut self, value: Value) -> Value {
        let now = std::time::Instant::now();
        if let Some(last) = self.last_emit {
            if now.duration_since(last) < self.min_interval {
                return self.last_value.clone().unwrap_or(value);
            }
        }
        self.last_emit = Some(now);
        self.last_value = Some(value.clone());
        value
    }
}

/// Rounds a float reading to `decimals` places; passes other value kinds
/// through unchanged.
pub struct Round {
    decimals: i32,
}

impl Round {
    pub fn new(decimals: i32) -> Self {
        Self { decimals }
    }
}

impl ValueProcessor for Round {
    fn apply(&mut self, value: Value) -> Value {
        match value {
            Value::Float(f) => {
                let factor = 10f64.powi(self.decimals);
                Value::Float((f * factor).round() / factor)
            }
            other => other,
        }
    }
}

/// Applies a chain of processors, in declared order, to one datapoint.
fn apply_chain(chain: &mut [Box<dyn ValueProcessor>], mut value: Value) -> Value {
    for processor in chain.iter_mut() {
        value = processor.apply(value);
    }
    value
}

const DP_POWER: &str = "1";
const DP_TARGET_HUMIDITY: &str = "2";
const DP_MODE: &str = "4";
const DP_CHILD_LOCK: &str = "14";
const DP_CURRENT_HUMIDITY: &str = "16";
const DP_COUNTDOWN_SET: &str = "17";
const DP_COUNTDOWN_LEFT: &str = "18";
const DP_FAULT: &str = "19";

const EXTERNAL_KEYS: &[&str] = &[
    "power",
    "target_humidity",
    "mode",
    "child_lock",
    "countdown_set",
    "countdown_left",
    "current_humidity",
    "fault",
];

/// The Meaco Arete Two 25L dehumidifier, the bundled example `DeviceModel`.
/// `current_humidity` runs through a moving-average + rounding chain instead
/// of passing the raw sensor reading straight through; every other
/// datapoint is forwarded as-is.
pub struct MeacoDehumidifier {
    humidity_processors: Vec<Box<dyn ValueProcessor>>,
}

impl Default for MeacoDehumidifier {
    fn default() -> Self {
        Self {
            humidity_processors: vec![
                Box::new(MovingAverage::new(5)),
                Box::new(Round::new(0)),
            ],
        }
    }
}

impl DeviceModel for MeacoDehumidifier {
    fn datapoints(&self) -> &[&'static str] {
        EXTERNAL_KEYS
    }

    fn to_wire(&self, external: &Values) -> Values {
        let mut wire = Values::new();
        if let Some(v) = external.get("power") {
            wire.insert(DP_POWER.into(), v.clone());
        }
        if let Some(v) = external.get("target_humidity") {
            wire.insert(DP_TARGET_HUMIDITY.into(), v.clone());
        }
        if let Some(v) = external.get("mode") {
            wire.insert(DP_MODE.into(), v.clone());
        }
        if let Some(v) = external.get("child_lock") {
            wire.insert(DP_CHILD_LOCK.into(), v.clone());
        }
        if let Some(v) = external.get("countdown_set") {
            wire.insert(DP_COUNTDOWN_SET.into(), v.clone());
        }
        // current_humidity / countdown_left / fault are read-only sensor
        // datapoints; this model never sends them.
        wire
    }

    fn from_wire(&mut self, wire: &Values) -> Values {
        let mut external = Values::new();
        if let Some(v) = wire.get(DP_POWER) {
            external.insert("power".into(), v.clone());
        }
        if let Some(v) = wire.get(DP_TARGET_HUMIDITY) {
            external.insert("target_humidity".into(), v.clone());
        }
        if let Some(v) = wire.get(DP_MODE) {
            external.insert("mode".into(), v.clone());
        }
        if let Some(v) = wire.get(DP_CHILD_LOCK) {
            external.insert("child_lock".into(), v.clone());
        }
        if let Some(v) = wire.get(DP_COUNTDOWN_SET) {
            external.insert("countdown_set".into(), v.clone());
        }
        if let Some(v) = wire.get(DP_COUNTDOWN_LEFT) {
            external.insert("countdown_left".into(), v.clone());
        }
        if let Some(v) = wire.get(DP_CURRENT_HUMIDITY) {
            let processed = apply_chain(&mut self.humidity_processors, v.clone());
            external.insert("current_humidity".into(), processed);
        }
        if let Some(v) = wire.get(DP_FAULT) {
            external.insert("fault".into(), v.clone());
        }
        external
    }

    fn constraints(&self) -> Constraints {
        Constraints::new(vec![Constraint::new(
            DP_MODE,
            "continuous",
            vec![(DP_TARGET_HUMIDITY.into(), Forbidden::All)],
        )])
    }
}
