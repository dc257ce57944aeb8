use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::kind::FieldKind;

/// Typed payload of a scalar or boolean value row. Stored as a msgpack blob;
/// the document model carries raw JSON values that are narrowed through
/// [`FieldValue::from_json`] using the owning field's kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FieldValue {
    Null,
    Text(String),
    Integer(i64),
    Decimal(f64),
    Boolean(bool),
}

impl PartialEq for FieldValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Text(a), Self::Text(b)) => a == b,
            (Self::Integer(a), Self::Integer(b)) => a == b,
            (Self::Decimal(a), Self::Decimal(b)) => a.total_cmp(b).is_eq(),
            (Self::Boolean(a), Self::Boolean(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for FieldValue {}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            FieldValue::Integer(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            FieldValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Narrow a document-level JSON value into the typed payload the owning
    /// field expects. Mismatched shapes are a caller error, not a coercion.
    pub fn from_json(kind: FieldKind, value: &serde_json::Value) -> Result<Self, CoreError> {
        if value.is_null() {
            return Ok(FieldValue::Null);
        }
        match kind {
            FieldKind::Text => match value.as_str() {
                Some(s) => Ok(FieldValue::Text(s.to_string())),
                None => Err(CoreError::InvalidData(format!(
                    "expected string for text field, got {value}"
                ))),
            },
            FieldKind::Integer => match value.as_i64() {
                Some(n) => Ok(FieldValue::Integer(n)),
                None => Err(CoreError::InvalidData(format!(
                    "expected integer for integer field, got {value}"
                ))),
            },
            FieldKind::Decimal => match value.as_f64() {
                Some(n) => Ok(FieldValue::Decimal(n)),
                None => Err(CoreError::InvalidData(format!(
                    "expected number for decimal field, got {value}"
                ))),
            },
            FieldKind::Boolean => match value.as_bool() {
                Some(b) => Ok(FieldValue::Boolean(b)),
                None => Err(CoreError::InvalidData(format!(
                    "expected boolean for boolean field, got {value}"
                ))),
            },
            _ => Err(CoreError::InvalidData(format!(
                "field kind {kind} does not carry a scalar value"
            ))),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            FieldValue::Null => serde_json::Value::Null,
            FieldValue::Text(s) => serde_json::Value::String(s.clone()),
            FieldValue::Integer(n) => serde_json::Value::from(*n),
            FieldValue::Decimal(n) => serde_json::Value::from(*n),
            FieldValue::Boolean(b) => serde_json::Value::Bool(*b),
        }
    }

    pub fn to_msgpack(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec(self)
    }

    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, rmp_serde::decode::Error> {
        rmp_serde::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn msgpack_round_trip() {
        let values = [
            FieldValue::Null,
            FieldValue::Text("olivine".into()),
            FieldValue::Integer(-42),
            FieldValue::Decimal(3.25),
            FieldValue::Boolean(true),
        ];
        for v in values {
            let bytes = v.to_msgpack().unwrap();
            assert_eq!(FieldValue::from_msgpack(&bytes).unwrap(), v);
        }
    }

    #[test]
    fn json_narrowing_respects_kind() {
        let v = FieldValue::from_json(FieldKind::Integer, &serde_json::json!(7)).unwrap();
        assert_eq!(v, FieldValue::Integer(7));

        let err = FieldValue::from_json(FieldKind::Integer, &serde_json::json!("seven"));
        assert!(err.is_err());

        let null = FieldValue::from_json(FieldKind::Text, &serde_json::Value::Null).unwrap();
        assert!(null.is_null());
    }

    #[test]
    fn decimal_equality_uses_total_order() {
        assert_eq!(FieldValue::Decimal(f64::NAN), FieldValue::Decimal(f64::NAN));
        assert_ne!(FieldValue::Decimal(0.1), FieldValue::Decimal(0.2));
    }
}
