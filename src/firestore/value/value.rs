use std::collections::BTreeMap;

use crate::firestore::model::{GeoPoint, Timestamp};
use crate::firestore::value::{ArrayValue, BytesValue, MapValue};

#[derive(Clone, Debug, PartialEq)]
pub struct FirestoreValue {
    kind: ValueKind,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ValueKind {
    Null,
    Boolean(bool),
    Integer(i64),
    Double(f64),
    Timestamp(Timestamp),
    String(String),
    Bytes(BytesValue),
    /// Fully qualified document name.
    Reference(String),
    GeoPoint(GeoPoint),
    Array(ArrayValue),
    Map(MapValue),
}

impl FirestoreValue {
    pub fn null() -> Self {
        Self::from_kind(ValueKind::Null)
    }

    pub fn from_kind(kind: ValueKind) -> Self {
        Self { kind }
    }

    pub fn from_bool(value: bool) -> Self {
        Self::from_kind(ValueKind::Boolean(value))
    }

    pub fn from_integer(value: i64) -> Self {
        Self::from_kind(ValueKind::Integer(value))
    }

    pub fn from_double(value: f64) -> Self {
        Self::from_kind(ValueKind::Double(value))
    }

    pub fn from_timestamp(value: Timestamp) -> Self {
        Self::from_kind(ValueKind::Timestamp(value))
    }

    pub fn from_string(value: impl Into<String>) -> Self {
        Self::from_kind(ValueKind::String(value.into()))
    }

    pub fn from_bytes(value: BytesValue) -> Self {
        Self::from_kind(ValueKind::Bytes(value))
    }

    pub fn from_reference(name: impl Into<String>) -> Self {
        Self::from_kind(ValueKind::Reference(name.into()))
    }

    pub fn from_geo_point(value: GeoPoint) -> Self {
        Self::from_kind(ValueKind::GeoPoint(value))
    }

    pub fn from_array(values: Vec<FirestoreValue>) -> Self {
        Self::from_kind(ValueKind::Array(ArrayValue::new(values)))
    }

    pub fn from_map(map: BTreeMap<String, FirestoreValue>) -> Self {
        Self::from_kind(ValueKind::Map(MapValue::new(map)))
    }

    pub fn kind(&self) -> &ValueKind {
        &self.kind
    }

    pub(crate) fn kind_mut(&mut self) -> &mut ValueKind {
        &mut self.kind
    }

    pub fn into_kind(self) -> ValueKind {
        self.kind
    }

    pub fn is_null(&self) -> bool {
        matches!(self.kind, ValueKind::Null)
    }

    pub fn is_nan(&self) -> bool {
        matches!(self.kind, ValueKind::Double(value) if value.is_nan())
    }

    pub fn is_number(&self) -> bool {
        matches!(self.kind, ValueKind::Integer(_) | ValueKind::Double(_))
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self.kind {
            ValueKind::Integer(value) => Some(value),
            _ => None,
        }
    }

    /// Numeric value widened to `f64`.
    pub fn as_f64(&self) -> Option<f64> {
        match self.kind {
            ValueKind::Integer(value) => Some(value as f64),
            ValueKind::Double(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match &self.kind {
            ValueKind::String(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&ArrayValue> {
        match &self.kind {
            ValueKind::Array(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&MapValue> {
        match &self.kind {
            ValueKind::Map(value) => Some(value),
            _ => None,
        }
    }
}

impl From<i64> for FirestoreValue {
    fn from(value: i64) -> Self {
        Self::from_integer(value)
    }
}

impl From<f64> for FirestoreValue {
    fn from(value: f64) -> Self {
        Self::from_double(value)
    }
}

impl From<bool> for FirestoreValue {
    fn from(value: bool) -> Self {
        Self::from_bool(value)
    }
}

impl From<&str> for FirestoreValue {
    fn from(value: &str) -> Self {
        Self::from_string(value)
    }
}

impl From<String> for FirestoreValue {
    fn from(value: String) -> Self {
        Self::from_string(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exposes_typed_accessors() {
        assert_eq!(FirestoreValue::from(3).as_f64(), Some(3.0));
        assert_eq!(FirestoreValue::from("hi").as_str(), Some("hi"));
        assert!(FirestoreValue::from(f64::NAN).is_nan());
        assert!(FirestoreValue::null().is_null());
        assert!(FirestoreValue::from(true).as_array().is_none());
    }
}
