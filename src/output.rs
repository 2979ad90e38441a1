//! Reading values and the output types that produce them.
//!
//! A [`Reading`] is one measured data point from a device: a typed value, an
//! optional unit, a type label, a timestamp, and a free-form context map. An
//! [`Output`] describes one kind of reading a handler can produce (e.g.
//! "temperature" in degrees Celsius) and stamps new readings with that
//! metadata so handlers do not repeat it on every read.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A typed reading value.
///
/// Handlers produce one of these variants; transforms may change the variant
/// (scaling an integer yields a float). Conversions are explicit -- there is
/// no implicit coercion between variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    Int(i64),
    Float(f64),
    Bool(bool),
    String(String),
    Bytes(Vec<u8>),
}

impl Value {
    /// Numeric view of the value, if it has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Short name of the variant, used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Bool(_) => "bool",
            Value::String(_) => "string",
            Value::Bytes(_) => "bytes",
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

/// The unit of a reading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unit {
    /// Full name of the unit, e.g. "celsius".
    pub name: String,
    /// Printable symbol, e.g. "C".
    pub symbol: String,
}

impl Unit {
    pub fn new(name: impl Into<String>, symbol: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            symbol: symbol.into(),
        }
    }
}

/// Describes one kind of reading a device can produce.
///
/// Outputs are typically defined once as constants by the plugin and shared
/// by all handlers that emit that reading type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Output {
    /// Unique name of the output, e.g. "temperature".
    pub name: String,
    /// The reading type label stamped onto readings.
    #[serde(rename = "type")]
    pub kind: String,
    /// Decimal places to round float values to. None leaves values untouched.
    #[serde(default)]
    pub precision: Option<u32>,
    /// Unit of the produced readings.
    #[serde(default)]
    pub unit: Option<Unit>,
}

impl Output {
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            precision: None,
            unit: None,
        }
    }

    pub fn with_unit(mut self, unit: Unit) -> Self {
        self.unit = Some(unit);
        self
    }

    pub fn with_precision(mut self, precision: u32) -> Self {
        self.precision = Some(precision);
        self
    }

    /// Create a reading for this output, stamped with the current time.
    pub fn make_reading(&self, value: impl Into<Value>) -> Reading {
        let mut value = value.into();
        if let (Some(p), Value::Float(f)) = (self.precision, &value) {
            let factor = 10f64.powi(p as i32);
            value = Value::Float((f * factor).round() / factor);
        }
        Reading {
            kind: self.kind.clone(),
            unit: self.unit.clone(),
            timestamp: rfc3339_now(),
            value,
            context: HashMap::new(),
        }
    }
}

/// A single data point read from a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// The reading type label, from the output that produced it.
    #[serde(rename = "type")]
    pub kind: String,
    /// Unit of the value, if any.
    pub unit: Option<Unit>,
    /// RFC 3339 timestamp assigned when the handler produced the reading.
    pub timestamp: String,
    /// The reading value.
    pub value: Value,
    /// Free-form context. Device-level context is merged in by the reading
    /// pipeline, with device keys winning on collision.
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl Reading {
    /// Create a bare reading with the given type label and value.
    pub fn new(kind: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            kind: kind.into(),
            unit: None,
            timestamp: rfc3339_now(),
            value: value.into(),
            context: HashMap::new(),
        }
    }

    pub fn with_context(mut self, context: HashMap<String, String>) -> Self {
        self.context = context;
        self
    }
}

/// A batch of readings produced together for one device.
///
/// Bulk reads and listeners emit these atomically; single reads are wrapped
/// into one by the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadContext {
    /// ID of the device the readings belong to.
    pub device: String,
    /// The readings, in handler emission order.
    pub readings: Vec<Reading>,
}

impl ReadContext {
    pub fn new(device: impl Into<String>, readings: Vec<Reading>) -> Self {
        Self {
            device: device.into(),
            readings,
        }
    }
}

/// Data for a single device write.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WriteData {
    /// The action to perform. Opaque to the runtime; interpreted by the
    /// device's write handler.
    pub action: String,
    /// Raw action payload.
    #[serde(default)]
    pub data: Vec<u8>,
}

impl WriteData {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            data: Vec::new(),
        }
    }

    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.data = data;
        self
    }
}

/// Current time as an RFC 3339 string, the timestamp format used throughout
/// the plugin surface.
pub(crate) fn rfc3339_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}
