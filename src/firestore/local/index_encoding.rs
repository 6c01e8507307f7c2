//! Order-preserving byte encoding of values for index entries.
//!
//! Encoded values compare with plain byte comparison in the same order
//! [`compare_values`](crate::firestore::value::compare_values) puts them.
//! Every encoding is prefix free, so a descending segment is written as the
//! bitwise inverse of its ascending form and segments can be concatenated.
//! Integers are encoded through `f64`, so very large integers may collide;
//! index scans are always re-filtered against the query.

use crate::firestore::model::IndexKind;
use crate::firestore::value::ordering::reference_path;
use crate::firestore::value::{FirestoreValue, MapValue, ValueKind};

const TYPE_NULL: u8 = 5;
const TYPE_BOOLEAN: u8 = 10;
const TYPE_NAN: u8 = 13;
const TYPE_NUMBER: u8 = 15;
const TYPE_TIMESTAMP: u8 = 20;
const TYPE_STRING: u8 = 25;
const TYPE_BLOB: u8 = 30;
const TYPE_REFERENCE: u8 = 37;
const TYPE_GEOPOINT: u8 = 45;
const TYPE_ARRAY: u8 = 50;
const TYPE_MAP: u8 = 55;
const TYPE_REFERENCE_SEGMENT: u8 = 60;

/// Closes arrays, maps, references and every top-level value. Sorts below
/// all type tags so shorter containers come first.
const END_MARKER: u8 = 2;

const ESCAPE: u8 = 0x00;
const ESCAPED_NUL: u8 = 0xff;
const TERMINATOR: u8 = 0x01;

/// Byte above the first byte of any encoded segment. Appended to a prefix
/// to form an inclusive upper bound over everything that starts with it.
pub const UPPER_SENTINEL: u8 = 0xff;

/// Encodes `value` as one index segment.
pub fn encode_segment(value: &FirestoreValue, kind: IndexKind) -> Vec<u8> {
    let mut out = Vec::new();
    write_value(value, &mut out);
    out.push(END_MARKER);
    if kind == IndexKind::Descending {
        for byte in &mut out {
            *byte = !*byte;
        }
    }
    out
}

fn write_value(value: &FirestoreValue, out: &mut Vec<u8>) {
    match value.kind() {
        ValueKind::Null => out.push(TYPE_NULL),
        ValueKind::Boolean(flag) => {
            out.push(TYPE_BOOLEAN);
            out.push(u8::from(*flag));
        }
        ValueKind::Integer(number) => write_double(*number as f64, out),
        ValueKind::Double(number) => write_double(*number, out),
        ValueKind::Timestamp(timestamp) => {
            out.push(TYPE_TIMESTAMP);
            write_signed(timestamp.seconds, out);
            out.extend_from_slice(&(timestamp.nanos.max(0) as u32).to_be_bytes());
        }
        ValueKind::String(text) => {
            out.push(TYPE_STRING);
            write_escaped(text.as_bytes(), out);
        }
        ValueKind::Bytes(bytes) => {
            out.push(TYPE_BLOB);
            write_escaped(bytes.as_slice(), out);
        }
        ValueKind::Reference(name) => {
            out.push(TYPE_REFERENCE);
            for segment in reference_path(name).split('/').filter(|s| !s.is_empty()) {
                out.push(TYPE_REFERENCE_SEGMENT);
                write_escaped(segment.as_bytes(), out);
            }
            out.push(END_MARKER);
        }
        ValueKind::GeoPoint(point) => {
            out.push(TYPE_GEOPOINT);
            out.extend_from_slice(&ordered_double(point.latitude()));
            out.extend_from_slice(&ordered_double(point.longitude()));
        }
        ValueKind::Array(array) => {
            out.push(TYPE_ARRAY);
            for element in array.values() {
                write_value(element, out);
            }
            out.push(END_MARKER);
        }
        ValueKind::Map(map) => write_map(map, out),
    }
}

fn write_map(map: &MapValue, out: &mut Vec<u8>) {
    out.push(TYPE_MAP);
    for (key, value) in map.fields() {
        out.push(TYPE_STRING);
        write_escaped(key.as_bytes(), out);
        write_value(value, out);
    }
    out.push(END_MARKER);
}

fn write_double(number: f64, out: &mut Vec<u8>) {
    if number.is_nan() {
        out.push(TYPE_NAN);
        return;
    }
    out.push(TYPE_NUMBER);
    out.extend_from_slice(&ordered_double(number));
}

fn ordered_double(number: f64) -> [u8; 8] {
    // -0.0 and 0.0 compare equal.
    let number = if number == 0.0 { 0.0 } else { number };
    let bits = number.to_bits();
    let ordered = if bits >> 63 == 1 { !bits } else { bits | (1 << 63) };
    ordered.to_be_bytes()
}

fn write_signed(number: i64, out: &mut Vec<u8>) {
    out.extend_from_slice(&((number as u64) ^ (1 << 63)).to_be_bytes());
}

fn write_escaped(bytes: &[u8], out: &mut Vec<u8>) {
    for &byte in bytes {
        out.push(byte);
        if byte == ESCAPE {
            out.push(ESCAPED_NUL);
        }
    }
    out.push(ESCAPE);
    out.push(TERMINATOR);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::Timestamp;
    use crate::firestore::value::BytesValue;
    use std::collections::BTreeMap;

    fn asc(value: FirestoreValue) -> Vec<u8> {
        encode_segment(&value, IndexKind::Ascending)
    }

    #[test]
    fn preserves_value_order() {
        let ordered = vec![
            FirestoreValue::null(),
            FirestoreValue::from(false),
            FirestoreValue::from(true),
            FirestoreValue::from(f64::NAN),
            FirestoreValue::from(f64::NEG_INFINITY),
            FirestoreValue::from_integer(-3),
            FirestoreValue::from(-0.5),
            FirestoreValue::from_integer(0),
            FirestoreValue::from(2.5),
            FirestoreValue::from_integer(7),
            FirestoreValue::from_timestamp(Timestamp::new(-5, 0)),
            FirestoreValue::from_timestamp(Timestamp::new(10, 1)),
            FirestoreValue::from(""),
            FirestoreValue::from("a"),
            FirestoreValue::from("a\0"),
            FirestoreValue::from("ab"),
            FirestoreValue::from_bytes(BytesValue::new(vec![0])),
            FirestoreValue::from_reference("rooms/a"),
            FirestoreValue::from_reference("rooms/a/messages/b"),
            FirestoreValue::from_reference("rooms/b"),
            FirestoreValue::from_array(vec![]),
            FirestoreValue::from_array(vec![1i64.into()]),
            FirestoreValue::from_array(vec![1i64.into(), 2i64.into()]),
            FirestoreValue::from_array(vec![2i64.into()]),
            FirestoreValue::from_map(BTreeMap::new()),
        ];
        for pair in ordered.windows(2) {
            let (left, right) = (asc(pair[0].clone()), asc(pair[1].clone()));
            assert!(left < right, "{:?} should sort before {:?}", pair[0], pair[1]);
        }
    }

    #[test]
    fn descending_segments_reverse_order() {
        let small = encode_segment(&FirestoreValue::from("a"), IndexKind::Descending);
        let large = encode_segment(&FirestoreValue::from("ab"), IndexKind::Descending);
        assert!(large < small);
        assert!(small[0] < UPPER_SENTINEL);
        assert_eq!(asc(FirestoreValue::from(0.0)), asc(FirestoreValue::from(-0.0)));
    }
}
