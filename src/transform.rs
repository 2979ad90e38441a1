//! Reading transformers.
//!
//! A device may carry an ordered list of transformers which the reading
//! pipeline applies to every value the device produces, before the reading
//! is stored. On the first failing transform the pipeline stops and the
//! reading is dropped for that cycle.

use std::fmt;
use std::sync::Arc;

use anyhow::{anyhow, Result};

use crate::output::Value;

/// A pure function applied to a reading value.
pub type ApplyFn = Arc<dyn Fn(Value) -> Result<Value> + Send + Sync>;

/// A value-level transform applied to readings from a device.
#[derive(Clone)]
pub enum Transformer {
    /// Multiply numeric values by a constant factor. The result is always a
    /// float. A factor of zero is rejected when the transform is applied.
    Scale { factor: f64 },

    /// Apply an arbitrary named function to the value.
    Apply { name: String, func: ApplyFn },
}

impl Transformer {
    pub fn scale(factor: f64) -> Self {
        Transformer::Scale { factor }
    }

    pub fn apply<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(Value) -> Result<Value> + Send + Sync + 'static,
    {
        Transformer::Apply {
            name: name.into(),
            func: Arc::new(func),
        }
    }

    /// Run the transform against a single value.
    pub fn transform(&self, value: Value) -> Result<Value> {
        match self {
            Transformer::Scale { factor } => {
                if *factor == 0.0 {
                    return Err(anyhow!("scale factor must not be zero"));
                }
                let v = value.as_f64().ok_or_else(|| {
                    anyhow!("cannot scale non-numeric value ({})", value.type_name())
                })?;
                Ok(Value::Float(v * factor))
            }
            Transformer::Apply { func, .. } => func(value),
        }
    }
}

impl fmt::Debug for Transformer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transformer::Scale { factor } => {
                f.debug_struct("Scale").field("factor", factor).finish()
            }
            Transformer::Apply { name, .. } => {
                f.debug_struct("Apply").field("name", name).finish()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scale_int_produces_float() {
        let t = Transformer::scale(2.0);
        let out = t.transform(Value::Int(2)).unwrap();
        assert_eq!(out, Value::Float(4.0));
    }

    #[test]
    fn test_scale_float() {
        let t = Transformer::scale(0.5);
        let out = t.transform(Value::Float(3.0)).unwrap();
        assert_eq!(out, Value::Float(1.5));
    }

    #[test]
    fn test_scale_zero_factor_rejected() {
        let t = Transformer::scale(0.0);
        assert!(t.transform(Value::Int(2)).is_err());
    }

    #[test]
    fn test_scale_non_numeric_rejected() {
        let t = Transformer::scale(2.0);
        assert!(t.transform(Value::Bool(true)).is_err());
        assert!(t.transform(Value::String("2".into())).is_err());
    }

    #[test]
    fn test_apply() {
        let t = Transformer::apply("double", |v| match v {
            Value::Int(i) => Ok(Value::Int(i * 2)),
            other => Ok(other),
        });
        assert_eq!(t.transform(Value::Int(2)).unwrap(), Value::Int(4));
    }

    #[test]
    fn test_apply_error_propagates() {
        let t = Transformer::apply("fail", |_| Err(anyhow!("nope")));
        assert!(t.transform(Value::Int(2)).is_err());
    }

    #[test]
    fn test_scale_roundtrip() {
        // Scale by k then 1/k restores a float value, modulo rounding.
        let k = 3.0;
        let chain = [Transformer::scale(k), Transformer::scale(1.0 / k)];
        let mut value = Value::Float(2.5);
        for t in &chain {
            value = t.transform(value).unwrap();
        }
        match value {
            Value::Float(f) => assert!((f - 2.5).abs() < 1e-12),
            other => panic!("expected float, got {other:?}"),
        }
    }
}
