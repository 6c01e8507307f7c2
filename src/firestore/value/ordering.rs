//! Backend ordering and equality semantics for values.

use std::cmp::Ordering;

use crate::firestore::value::{FirestoreValue, MapValue, ValueKind};

/// Cross-type ordering buckets. Integers and doubles share one bucket.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum TypeOrder {
    Null,
    Boolean,
    Number,
    Timestamp,
    String,
    Bytes,
    Reference,
    GeoPoint,
    Array,
    Map,
}

pub fn type_order(value: &FirestoreValue) -> TypeOrder {
    match value.kind() {
        ValueKind::Null => TypeOrder::Null,
        ValueKind::Boolean(_) => TypeOrder::Boolean,
        ValueKind::Integer(_) | ValueKind::Double(_) => TypeOrder::Number,
        ValueKind::Timestamp(_) => TypeOrder::Timestamp,
        ValueKind::String(_) => TypeOrder::String,
        ValueKind::Bytes(_) => TypeOrder::Bytes,
        ValueKind::Reference(_) => TypeOrder::Reference,
        ValueKind::GeoPoint(_) => TypeOrder::GeoPoint,
        ValueKind::Array(_) => TypeOrder::Array,
        ValueKind::Map(_) => TypeOrder::Map,
    }
}

/// Total order over all values. NaN sorts before every other number and
/// equals itself.
pub fn compare_values(left: &FirestoreValue, right: &FirestoreValue) -> Ordering {
    let (left_type, right_type) = (type_order(left), type_order(right));
    if left_type != right_type {
        return left_type.cmp(&right_type);
    }

    match (left.kind(), right.kind()) {
        (ValueKind::Null, ValueKind::Null) => Ordering::Equal,
        (ValueKind::Boolean(a), ValueKind::Boolean(b)) => a.cmp(b),
        (ValueKind::Integer(a), ValueKind::Integer(b)) => a.cmp(b),
        (ValueKind::Integer(a), ValueKind::Double(b)) => compare_mixed(*a, *b),
        (ValueKind::Double(a), ValueKind::Integer(b)) => compare_mixed(*b, *a).reverse(),
        (ValueKind::Double(a), ValueKind::Double(b)) => compare_doubles(*a, *b),
        (ValueKind::Timestamp(a), ValueKind::Timestamp(b)) => a.cmp(b),
        (ValueKind::String(a), ValueKind::String(b)) => a.cmp(b),
        (ValueKind::Bytes(a), ValueKind::Bytes(b)) => a.cmp(b),
        (ValueKind::Reference(a), ValueKind::Reference(b)) => {
            reference_path(a).split('/').cmp(reference_path(b).split('/'))
        }
        (ValueKind::GeoPoint(a), ValueKind::GeoPoint(b)) => a.compare(b),
        (ValueKind::Array(a), ValueKind::Array(b)) => {
            for (l, r) in a.values().iter().zip(b.values()) {
                match compare_values(l, r) {
                    Ordering::Equal => continue,
                    ordering => return ordering,
                }
            }
            a.len().cmp(&b.len())
        }
        (ValueKind::Map(a), ValueKind::Map(b)) => compare_maps(a, b),
        _ => Ordering::Equal,
    }
}

/// Database-relative document path of a reference value. References built
/// locally may already be relative.
pub(crate) fn reference_path(name: &str) -> &str {
    const DOCUMENTS: &str = "/documents/";
    match name.find(DOCUMENTS) {
        Some(index) if name.starts_with("projects/") => &name[index + DOCUMENTS.len()..],
        _ => name,
    }
}

fn compare_doubles(left: f64, right: f64) -> Ordering {
    match (left.is_nan(), right.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        // -0.0 and 0.0 compare equal.
        (false, false) => left.partial_cmp(&right).unwrap_or(Ordering::Equal),
    }
}

fn compare_mixed(integer: i64, double: f64) -> Ordering {
    const TWO_POW_63: f64 = 9_223_372_036_854_775_808.0;
    if double.is_nan() {
        return Ordering::Greater;
    }
    if double >= TWO_POW_63 {
        return Ordering::Less;
    }
    if double < -TWO_POW_63 {
        return Ordering::Greater;
    }
    integer.cmp(&(double.trunc() as i64)).then_with(|| {
        let fract = double.fract();
        if fract > 0.0 {
            Ordering::Less
        } else if fract < 0.0 {
            Ordering::Greater
        } else {
            Ordering::Equal
        }
    })
}

fn compare_maps(left: &MapValue, right: &MapValue) -> Ordering {
    let mut left_iter = left.fields().iter();
    let mut right_iter = right.fields().iter();
    loop {
        match (left_iter.next(), right_iter.next()) {
            (Some((lk, lv)), Some((rk, rv))) => {
                let ordering = lk.cmp(rk).then_with(|| compare_values(lv, rv));
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            (Some(_), None) => return Ordering::Greater,
            (None, Some(_)) => return Ordering::Less,
            (None, None) => return Ordering::Equal,
        }
    }
}

/// Backend equality: numbers compare by value across integer and double.
pub fn values_equal(left: &FirestoreValue, right: &FirestoreValue) -> bool {
    compare_values(left, right) == Ordering::Equal
}

/// Stable textual form used in query and target canonical ids.
pub fn canonical_id(value: &FirestoreValue) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &FirestoreValue, out: &mut String) {
    match value.kind() {
        ValueKind::Null => out.push_str("null"),
        ValueKind::Boolean(b) => out.push_str(if *b { "true" } else { "false" }),
        ValueKind::Integer(i) => out.push_str(&i.to_string()),
        ValueKind::Double(d) => out.push_str(&format!("{d:?}")),
        ValueKind::Timestamp(t) => out.push_str(&format!("time({},{})", t.seconds, t.nanos)),
        ValueKind::String(s) => out.push_str(s),
        ValueKind::Bytes(b) => out.push_str(&b.to_base64()),
        ValueKind::Reference(r) => out.push_str(r),
        ValueKind::GeoPoint(g) => {
            out.push_str(&format!("geo({:?},{:?})", g.latitude(), g.longitude()))
        }
        ValueKind::Array(array) => {
            out.push('[');
            for (i, element) in array.values().iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(element, out);
            }
            out.push(']');
        }
        ValueKind::Map(map) => {
            out.push('{');
            for (i, (key, element)) in map.fields().iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(key);
                out.push(':');
                write_canonical(element, out);
            }
            out.push('}');
        }
    }
}

/// Smallest value of the given type bucket.
pub fn min_value_for(order: TypeOrder) -> FirestoreValue {
    use crate::firestore::model::{GeoPoint, Timestamp};
    use crate::firestore::value::BytesValue;
    use std::collections::BTreeMap;

    match order {
        TypeOrder::Null => FirestoreValue::null(),
        TypeOrder::Boolean => FirestoreValue::from_bool(false),
        TypeOrder::Number => FirestoreValue::from_double(f64::NAN),
        TypeOrder::Timestamp => FirestoreValue::from_timestamp(Timestamp::new(i64::MIN / 2, 0)),
        TypeOrder::String => FirestoreValue::from_string(""),
        TypeOrder::Bytes => FirestoreValue::from_bytes(BytesValue::default()),
        TypeOrder::Reference => FirestoreValue::from_reference(""),
        TypeOrder::GeoPoint => GeoPoint::new(-90.0, -180.0)
            .map(FirestoreValue::from_geo_point)
            .unwrap_or_else(|_| FirestoreValue::null()),
        TypeOrder::Array => FirestoreValue::from_array(Vec::new()),
        TypeOrder::Map => FirestoreValue::from_map(BTreeMap::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::Timestamp;
    use std::collections::BTreeMap;

    #[test]
    fn orders_across_types() {
        let ordered = vec![
            FirestoreValue::null(),
            FirestoreValue::from(false),
            FirestoreValue::from(f64::NAN),
            FirestoreValue::from(-1),
            FirestoreValue::from(0.5),
            FirestoreValue::from(1),
            FirestoreValue::from_timestamp(Timestamp::new(1, 0)),
            FirestoreValue::from(""),
            FirestoreValue::from("a"),
            FirestoreValue::from_array(vec![]),
            FirestoreValue::from_map(BTreeMap::new()),
        ];
        for pair in ordered.windows(2) {
            assert_eq!(compare_values(&pair[0], &pair[1]), Ordering::Less, "{pair:?}");
        }
    }

    #[test]
    fn numbers_compare_by_value() {
        assert!(values_equal(&FirestoreValue::from(1), &FirestoreValue::from(1.0)));
        assert!(values_equal(&FirestoreValue::from(f64::NAN), &FirestoreValue::from(f64::NAN)));
        assert!(values_equal(&FirestoreValue::from(-0.0), &FirestoreValue::from(0.0)));
        assert_eq!(
            compare_values(&FirestoreValue::from(i64::MAX), &FirestoreValue::from(9.223372036854776e18)),
            Ordering::Less
        );
    }

    #[test]
    fn canonical_ids_are_stable() {
        let mut map = BTreeMap::new();
        map.insert("b".to_string(), FirestoreValue::from(2));
        map.insert("a".to_string(), FirestoreValue::from_array(vec![1.into(), "x".into()]));
        assert_eq!(canonical_id(&FirestoreValue::from_map(map)), "{a:[1,x],b:2}");
    }
}
