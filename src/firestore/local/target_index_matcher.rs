use std::collections::BTreeSet;

use crate::firestore::core::{Direction, FieldFilter, OrderBy, Operator, Target};
use crate::firestore::model::{FieldIndex, FieldPath, IndexKind, IndexSegment};

/// Decides whether a field index can serve a conjunctive target, and builds
/// the index a target would want.
///
/// An index serves a target when its segments are, in order: the equality
/// filters (any order), then optionally the inequality field matching the
/// first order-by, then a prefix of the remaining order-bys. A `Contains`
/// segment must be matched by an array filter.
#[derive(Debug)]
pub struct TargetIndexMatcher {
    collection_id: String,
    order_bys: Vec<OrderBy>,
    inequality_filters: Vec<FieldFilter>,
    equality_filters: Vec<FieldFilter>,
}

impl TargetIndexMatcher {
    pub fn new(target: &Target) -> Self {
        let mut inequality_filters: Vec<FieldFilter> = Vec::new();
        let mut equality_filters = Vec::new();
        for filter in target.filters().iter().flat_map(|f| f.flattened()) {
            if filter.is_inequality() {
                inequality_filters.push(filter.clone());
            } else {
                equality_filters.push(filter.clone());
            }
        }
        inequality_filters.sort_by(|left, right| left.field.cmp(&right.field));
        Self {
            collection_id: target.collection_id().unwrap_or_default().to_string(),
            order_bys: target.order_by().to_vec(),
            inequality_filters,
            equality_filters,
        }
    }

    fn has_multiple_inequality(&self) -> bool {
        self.inequality_filters
            .iter()
            .map(|filter| &filter.field)
            .collect::<BTreeSet<_>>()
            .len()
            > 1
    }

    pub fn served_by_index(&self, index: &FieldIndex) -> bool {
        if index.collection_group != self.collection_id || self.has_multiple_inequality() {
            return false;
        }
        if let Some(segment) = index.array_segment() {
            if !self.has_matching_equality_filter(segment) {
                return false;
            }
        }

        let segments = index.directional_segments();
        let mut equality_fields = BTreeSet::new();
        let mut position = 0;
        while position < segments.len() && self.has_matching_equality_filter(segments[position]) {
            equality_fields.insert(&segments[position].field_path);
            position += 1;
        }
        if position == segments.len() {
            return true;
        }

        let mut order_bys = self.order_bys.iter();
        if let Some(inequality) = self.inequality_filters.first() {
            if !equality_fields.contains(&inequality.field) {
                let segment = segments[position];
                if !matches_filter(inequality, segment)
                    || !order_bys.next().is_some_and(|order| matches_order_by(order, segment))
                {
                    return false;
                }
            }
            position += 1;
        }

        segments[position.min(segments.len())..]
            .iter()
            .all(|segment| order_bys.next().is_some_and(|order| matches_order_by(order, segment)))
    }

    /// The index this target would ideally use: equality fields ascending
    /// (array filters as `Contains`), then every order-by except the key.
    pub fn build_target_index(&self) -> FieldIndex {
        let mut unique_fields: BTreeSet<FieldPath> = BTreeSet::new();
        let mut segments = Vec::new();

        for filter in &self.equality_filters {
            if filter.field.is_key_field() {
                continue;
            }
            if is_array_operator(filter.op) {
                segments.push(IndexSegment::new(filter.field.clone(), IndexKind::Contains));
            } else if unique_fields.insert(filter.field.clone()) {
                segments.push(IndexSegment::new(filter.field.clone(), IndexKind::Ascending));
            }
        }

        for order in &self.order_bys {
            if order.field.is_key_field() || !unique_fields.insert(order.field.clone()) {
                continue;
            }
            let kind = match order.direction {
                Direction::Ascending => IndexKind::Ascending,
                Direction::Descending => IndexKind::Descending,
            };
            segments.push(IndexSegment::new(order.field.clone(), kind));
        }

        FieldIndex::new(self.collection_id.clone(), segments)
    }

    fn has_matching_equality_filter(&self, segment: &IndexSegment) -> bool {
        self.equality_filters
            .iter()
            .any(|filter| matches_filter(filter, segment))
    }
}

fn is_array_operator(op: Operator) -> bool {
    matches!(op, Operator::ArrayContains | Operator::ArrayContainsAny)
}

fn matches_filter(filter: &FieldFilter, segment: &IndexSegment) -> bool {
    filter.field == segment.field_path
        && (segment.kind == IndexKind::Contains) == is_array_operator(filter.op)
}

fn matches_order_by(order: &OrderBy, segment: &IndexSegment) -> bool {
    order.field == segment.field_path
        && matches!(
            (segment.kind, order.direction),
            (IndexKind::Ascending, Direction::Ascending) | (IndexKind::Descending, Direction::Descending)
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::{Filter, Query};
    use crate::firestore::value::FirestoreValue;

    fn field(path: &str) -> FieldPath {
        FieldPath::from_dot_separated(path).unwrap()
    }

    fn filter(path: &str, op: Operator, value: FirestoreValue) -> Filter {
        Filter::field(field(path), op, value).unwrap()
    }

    fn index(segments: &[(&str, IndexKind)]) -> FieldIndex {
        FieldIndex::new(
            "rooms",
            segments
                .iter()
                .map(|(path, kind)| IndexSegment::new(field(path), *kind))
                .collect(),
        )
    }

    #[test]
    fn equalities_then_inequality_then_order() {
        let query = Query::collection("rooms")
            .unwrap()
            .with_filter(filter("a", Operator::Equal, FirestoreValue::from("x")))
            .with_filter(filter("b", Operator::GreaterThan, FirestoreValue::from_integer(1)));
        let matcher = TargetIndexMatcher::new(&query.to_target());

        assert!(matcher.served_by_index(&index(&[("a", IndexKind::Ascending)])));
        assert!(matcher.served_by_index(&index(&[
            ("a", IndexKind::Ascending),
            ("b", IndexKind::Ascending)
        ])));
        assert!(!matcher.served_by_index(&index(&[
            ("b", IndexKind::Ascending),
            ("a", IndexKind::Ascending)
        ])));
        assert!(!matcher.served_by_index(&index(&[
            ("a", IndexKind::Ascending),
            ("b", IndexKind::Descending)
        ])));
    }

    #[test]
    fn array_segments_need_array_filters() {
        let query = Query::collection("rooms").unwrap().with_filter(filter(
            "tags",
            Operator::ArrayContains,
            FirestoreValue::from("x"),
        ));
        let matcher = TargetIndexMatcher::new(&query.to_target());
        assert!(matcher.served_by_index(&index(&[("tags", IndexKind::Contains)])));
        assert!(!matcher.served_by_index(&index(&[("tags", IndexKind::Ascending)])));

        let built = matcher.build_target_index();
        assert_eq!(built.segments, vec![IndexSegment::new(field("tags"), IndexKind::Contains)]);
        assert!(matcher.served_by_index(&built));
    }

    #[test]
    fn built_index_skips_duplicate_and_key_fields() {
        let query = Query::collection("rooms")
            .unwrap()
            .with_filter(filter("a", Operator::Equal, FirestoreValue::from_integer(3)))
            .with_order_by(OrderBy::new(field("a"), Direction::Ascending))
            .with_order_by(OrderBy::new(field("c"), Direction::Descending));
        let built = TargetIndexMatcher::new(&query.to_target()).build_target_index();
        assert_eq!(
            built.segments,
            vec![
                IndexSegment::new(field("a"), IndexKind::Ascending),
                IndexSegment::new(field("c"), IndexKind::Descending),
            ]
        );
    }
}
