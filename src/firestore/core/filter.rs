use std::fmt::{Display, Formatter};

use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::model::{Document, DocumentKey, FieldPath, ResourcePath};
use crate::firestore::value::ordering::reference_path;
use crate::firestore::value::{
    canonical_id, compare_values, type_order, FirestoreValue, ValueKind,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Operator {
    LessThan,
    LessThanOrEqual,
    Equal,
    NotEqual,
    GreaterThan,
    GreaterThanOrEqual,
    ArrayContains,
    ArrayContainsAny,
    In,
    NotIn,
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::LessThan => "<",
            Operator::LessThanOrEqual => "<=",
            Operator::Equal => "==",
            Operator::NotEqual => "!=",
            Operator::GreaterThan => ">",
            Operator::GreaterThanOrEqual => ">=",
            Operator::ArrayContains => "array-contains",
            Operator::ArrayContainsAny => "array-contains-any",
            Operator::In => "in",
            Operator::NotIn => "not-in",
        }
    }

    pub fn wire_name(&self) -> &'static str {
        match self {
            Operator::LessThan => "LESS_THAN",
            Operator::LessThanOrEqual => "LESS_THAN_OR_EQUAL",
            Operator::Equal => "EQUAL",
            Operator::NotEqual => "NOT_EQUAL",
            Operator::GreaterThan => "GREATER_THAN",
            Operator::GreaterThanOrEqual => "GREATER_THAN_OR_EQUAL",
            Operator::ArrayContains => "ARRAY_CONTAINS",
            Operator::ArrayContainsAny => "ARRAY_CONTAINS_ANY",
            Operator::In => "IN",
            Operator::NotIn => "NOT_IN",
        }
    }

    pub fn from_wire_name(name: &str) -> Option<Self> {
        Some(match name {
            "LESS_THAN" => Operator::LessThan,
            "LESS_THAN_OR_EQUAL" => Operator::LessThanOrEqual,
            "EQUAL" => Operator::Equal,
            "NOT_EQUAL" => Operator::NotEqual,
            "GREATER_THAN" => Operator::GreaterThan,
            "GREATER_THAN_OR_EQUAL" => Operator::GreaterThanOrEqual,
            "ARRAY_CONTAINS" => Operator::ArrayContains,
            "ARRAY_CONTAINS_ANY" => Operator::ArrayContainsAny,
            "IN" => Operator::In,
            "NOT_IN" => Operator::NotIn,
            _ => return None,
        })
    }

    /// Operators that constrain a field to a range rather than a point.
    pub fn is_inequality(&self) -> bool {
        matches!(
            self,
            Operator::LessThan
                | Operator::LessThanOrEqual
                | Operator::GreaterThan
                | Operator::GreaterThanOrEqual
                | Operator::NotEqual
                | Operator::NotIn
        )
    }

    fn takes_array(&self) -> bool {
        matches!(
            self,
            Operator::In | Operator::NotIn | Operator::ArrayContainsAny
        )
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldFilter {
    pub field: FieldPath,
    pub op: Operator,
    pub value: FirestoreValue,
}

impl FieldFilter {
    pub fn new(field: FieldPath, op: Operator, value: FirestoreValue) -> FirestoreResult<Self> {
        if op.takes_array() {
            match value.as_array() {
                Some(array) if !array.is_empty() => {}
                _ => {
                    return Err(invalid_argument(format!(
                        "A non-empty array is required for '{}' filters.",
                        op.as_str()
                    )))
                }
            }
        }
        if field.is_key_field() {
            if matches!(op, Operator::ArrayContains | Operator::ArrayContainsAny) {
                return Err(invalid_argument(format!(
                    "Invalid query. You can't perform '{}' queries on the document id.",
                    op.as_str()
                )));
            }
            let references_ok = match value.as_array() {
                Some(array) if op.takes_array() => array
                    .values()
                    .iter()
                    .all(|element| reference_key(element).is_some()),
                _ => reference_key(&value).is_some(),
            };
            if !references_ok {
                return Err(invalid_argument(
                    "Filters on the document id must use document references.",
                ));
            }
        }
        Ok(Self { field, op, value })
    }

    pub fn matches(&self, document: &Document) -> bool {
        if self.field.is_key_field() {
            return self.matches_key(document.key());
        }
        let other = document.field(&self.field);
        match self.op {
            Operator::NotEqual => other.is_some_and(|other| {
                !other.is_null() && self.matches_comparison(compare_values(other, &self.value))
            }),
            Operator::ArrayContains => other
                .and_then(FirestoreValue::as_array)
                .is_some_and(|array| array.contains(&self.value)),
            Operator::ArrayContainsAny => {
                let (Some(array), Some(candidates)) =
                    (other.and_then(FirestoreValue::as_array), self.value.as_array())
                else {
                    return false;
                };
                candidates
                    .values()
                    .iter()
                    .any(|candidate| array.contains(candidate))
            }
            Operator::In => match (other, self.value.as_array()) {
                (Some(other), Some(candidates)) => candidates.contains(other),
                _ => false,
            },
            Operator::NotIn => {
                let Some(candidates) = self.value.as_array() else {
                    return false;
                };
                if candidates.contains(&FirestoreValue::null()) {
                    return false;
                }
                other.is_some_and(|other| !other.is_null() && !candidates.contains(other))
            }
            _ => other.is_some_and(|other| {
                type_order(other) == type_order(&self.value)
                    && self.matches_comparison(compare_values(other, &self.value))
            }),
        }
    }

    fn matches_key(&self, key: &DocumentKey) -> bool {
        match self.op {
            Operator::In | Operator::NotIn => {
                let contained = self.value.as_array().is_some_and(|array| {
                    array
                        .values()
                        .iter()
                        .filter_map(reference_key)
                        .any(|candidate| &candidate == key)
                });
                contained == (self.op == Operator::In)
            }
            _ => reference_key(&self.value)
                .is_some_and(|other| self.matches_comparison(key.cmp(&other))),
        }
    }

    fn matches_comparison(&self, ordering: std::cmp::Ordering) -> bool {
        use std::cmp::Ordering::*;
        match self.op {
            Operator::LessThan => ordering == Less,
            Operator::LessThanOrEqual => ordering != Greater,
            Operator::Equal => ordering == Equal,
            Operator::NotEqual => ordering != Equal,
            Operator::GreaterThan => ordering == Greater,
            Operator::GreaterThanOrEqual => ordering != Less,
            _ => false,
        }
    }

    pub fn is_inequality(&self) -> bool {
        self.op.is_inequality()
    }

    pub fn canonical_id(&self) -> String {
        format!(
            "{}{}{}",
            self.field.canonical_string(),
            self.op.as_str(),
            canonical_id(&self.value)
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompositeOperator {
    And,
    Or,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CompositeFilter {
    pub op: CompositeOperator,
    pub filters: Vec<Filter>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Filter {
    Field(FieldFilter),
    Composite(CompositeFilter),
}

impl Filter {
    pub fn field(field: FieldPath, op: Operator, value: FirestoreValue) -> FirestoreResult<Self> {
        FieldFilter::new(field, op, value).map(Filter::Field)
    }

    pub fn and(filters: Vec<Filter>) -> Self {
        Filter::Composite(CompositeFilter {
            op: CompositeOperator::And,
            filters,
        })
    }

    pub fn or(filters: Vec<Filter>) -> Self {
        Filter::Composite(CompositeFilter {
            op: CompositeOperator::Or,
            filters,
        })
    }

    pub fn matches(&self, document: &Document) -> bool {
        match self {
            Filter::Field(filter) => filter.matches(document),
            Filter::Composite(composite) => match composite.op {
                CompositeOperator::And => composite.filters.iter().all(|f| f.matches(document)),
                CompositeOperator::Or => composite.filters.iter().any(|f| f.matches(document)),
            },
        }
    }

    /// Every field filter nested in this filter.
    pub fn flattened(&self) -> Vec<&FieldFilter> {
        match self {
            Filter::Field(filter) => vec![filter],
            Filter::Composite(composite) => composite
                .filters
                .iter()
                .flat_map(Filter::flattened)
                .collect(),
        }
    }

    /// True for a field filter or an AND of field filters.
    pub fn is_flat_conjunction(&self) -> bool {
        match self {
            Filter::Field(_) => true,
            Filter::Composite(composite) => {
                composite.op == CompositeOperator::And
                    && composite
                        .filters
                        .iter()
                        .all(|f| matches!(f, Filter::Field(_)))
            }
        }
    }

    pub fn canonical_id(&self) -> String {
        match self {
            Filter::Field(filter) => filter.canonical_id(),
            Filter::Composite(composite) => {
                let op = match composite.op {
                    CompositeOperator::And => "and",
                    CompositeOperator::Or => "or",
                };
                let inner: Vec<String> =
                    composite.filters.iter().map(Filter::canonical_id).collect();
                format!("{op}({})", inner.join(","))
            }
        }
    }
}

impl Display for Filter {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.canonical_id())
    }
}

/// Document key named by a reference value. Accepts both fully qualified
/// resource names and database-relative paths.
pub fn reference_key(value: &FirestoreValue) -> Option<DocumentKey> {
    let ValueKind::Reference(name) = value.kind() else {
        return None;
    };
    let path = ResourcePath::from_string(reference_path(name)).ok()?;
    DocumentKey::from_path(path).ok()
}

/// Reference value pointing at `key`, in database-relative form.
pub fn key_reference(key: &DocumentKey) -> FirestoreValue {
    FirestoreValue::from_reference(key.path().canonical_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::{SnapshotVersion, Timestamp};
    use crate::firestore::value::MapValue;
    use std::collections::BTreeMap;

    fn doc(path: &str, fields: &[(&str, FirestoreValue)]) -> Document {
        let map: BTreeMap<String, FirestoreValue> = fields
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        Document::new_found(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::from_timestamp(Timestamp::new(1, 0)),
            MapValue::new(map),
        )
    }

    fn field(name: &str) -> FieldPath {
        FieldPath::from_dot_separated(name).unwrap()
    }

    #[test]
    fn comparisons_require_matching_types() {
        let filter = Filter::field(field("a"), Operator::GreaterThan, 1i64.into()).unwrap();
        assert!(filter.matches(&doc("c/1", &[("a", 2i64.into())])));
        assert!(filter.matches(&doc("c/1", &[("a", 1.5.into())])));
        assert!(!filter.matches(&doc("c/1", &[("a", "2".into())])));
        assert!(!filter.matches(&doc("c/1", &[])));
    }

    #[test]
    fn not_equal_skips_missing_and_null() {
        let filter = Filter::field(field("a"), Operator::NotEqual, 1i64.into()).unwrap();
        assert!(filter.matches(&doc("c/1", &[("a", 2i64.into())])));
        assert!(!filter.matches(&doc("c/1", &[("a", FirestoreValue::null())])));
        assert!(!filter.matches(&doc("c/1", &[])));
    }

    #[test]
    fn array_and_in_operators() {
        let tags = FirestoreValue::from_array(vec!["x".into(), "y".into()]);
        let contains = Filter::field(field("tags"), Operator::ArrayContains, "y".into()).unwrap();
        assert!(contains.matches(&doc("c/1", &[("tags", tags.clone())])));
        let any = Filter::field(
            field("tags"),
            Operator::ArrayContainsAny,
            FirestoreValue::from_array(vec!["z".into(), "x".into()]),
        )
        .unwrap();
        assert!(any.matches(&doc("c/1", &[("tags", tags)])));
        let within = Filter::field(
            field("a"),
            Operator::In,
            FirestoreValue::from_array(vec![1i64.into(), 2i64.into()]),
        )
        .unwrap();
        assert!(within.matches(&doc("c/1", &[("a", 2.0.into())])));
        assert!(Filter::field(field("a"), Operator::In, FirestoreValue::from_array(vec![])).is_err());
    }

    #[test]
    fn composite_filters() {
        let a = Filter::field(field("a"), Operator::Equal, 1i64.into()).unwrap();
        let b = Filter::field(field("b"), Operator::Equal, 2i64.into()).unwrap();
        let either = Filter::or(vec![a.clone(), b.clone()]);
        let both = Filter::and(vec![a, b]);
        let document = doc("c/1", &[("a", 1i64.into())]);
        assert!(either.matches(&document));
        assert!(!both.matches(&document));
        assert_eq!(either.canonical_id(), "or(a==1,b==2)");
    }

    #[test]
    fn key_filters_compare_document_keys() {
        let filter = Filter::field(
            FieldPath::key_path(),
            Operator::LessThan,
            FirestoreValue::from_reference("projects/p/databases/(default)/documents/c/m"),
        )
        .unwrap();
        assert!(filter.matches(&doc("c/a", &[])));
        assert!(!filter.matches(&doc("c/z", &[])));
    }
}
