use std::cmp::Ordering;
use std::fmt::{Display, Formatter};

use crate::firestore::core::filter::{reference_key, Filter};
use crate::firestore::core::target::Target;
use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::model::{Document, DocumentKey, FieldPath, ResourcePath};
use crate::firestore::value::{canonical_id, compare_values, FirestoreValue};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    Ascending,
    Descending,
}

impl Direction {
    fn flipped(self) -> Self {
        match self {
            Direction::Ascending => Direction::Descending,
            Direction::Descending => Direction::Ascending,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct OrderBy {
    pub field: FieldPath,
    pub direction: Direction,
}

impl OrderBy {
    pub fn new(field: FieldPath, direction: Direction) -> Self {
        Self { field, direction }
    }

    pub fn ascending(field: FieldPath) -> Self {
        Self::new(field, Direction::Ascending)
    }

    fn compare(&self, left: &Document, right: &Document) -> Ordering {
        let ordering = if self.field.is_key_field() {
            left.key().cmp(right.key())
        } else {
            match (left.field(&self.field), right.field(&self.field)) {
                (Some(l), Some(r)) => compare_values(l, r),
                // Documents without the field never match an ordered query;
                // order them deterministically anyway.
                (Some(_), None) => Ordering::Greater,
                (None, Some(_)) => Ordering::Less,
                (None, None) => Ordering::Equal,
            }
        };
        match self.direction {
            Direction::Ascending => ordering,
            Direction::Descending => ordering.reverse(),
        }
    }

    fn canonical_id(&self) -> String {
        let direction = match self.direction {
            Direction::Ascending => "asc",
            Direction::Descending => "desc",
        };
        format!("{}{direction}", self.field.canonical_string())
    }
}

/// Query cursor: a position in the order-by values of a query.
#[derive(Clone, Debug, PartialEq)]
pub struct Bound {
    pub position: Vec<FirestoreValue>,
    pub inclusive: bool,
}

impl Bound {
    pub fn new(position: Vec<FirestoreValue>, inclusive: bool) -> Self {
        Self {
            position,
            inclusive,
        }
    }

    /// Compares the cursor position with `document` along `order_by`.
    fn compare_to_document(&self, order_by: &[OrderBy], document: &Document) -> Ordering {
        for (component, order) in self.position.iter().zip(order_by) {
            let ordering = if order.field.is_key_field() {
                match reference_key(component) {
                    Some(key) => key.cmp(document.key()),
                    None => Ordering::Less,
                }
            } else {
                match document.field(&order.field) {
                    Some(value) => compare_values(component, value),
                    None => Ordering::Greater,
                }
            };
            let ordering = match order.direction {
                Direction::Ascending => ordering,
                Direction::Descending => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }

    /// True when the cursor sorts before `document`, i.e. `document` is
    /// past a start cursor.
    pub fn sorts_before_document(&self, order_by: &[OrderBy], document: &Document) -> bool {
        let ordering = self.compare_to_document(order_by, document);
        if self.inclusive {
            ordering != Ordering::Greater
        } else {
            ordering == Ordering::Less
        }
    }

    /// True when the cursor sorts after `document`, i.e. `document` is
    /// before an end cursor.
    pub fn sorts_after_document(&self, order_by: &[OrderBy], document: &Document) -> bool {
        let ordering = self.compare_to_document(order_by, document);
        if self.inclusive {
            ordering != Ordering::Less
        } else {
            ordering == Ordering::Greater
        }
    }

    pub(crate) fn canonical_id(&self) -> String {
        let prefix = if self.inclusive { "b:" } else { "a:" };
        let values: Vec<String> = self.position.iter().map(canonical_id).collect();
        format!("{prefix}{}", values.join(","))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LimitType {
    First,
    Last,
}

/// A query as issued by the application. Converted to a [`Target`] before
/// it is sent to the backend or used for index planning.
#[derive(Clone, Debug, PartialEq)]
pub struct Query {
    path: ResourcePath,
    collection_group: Option<String>,
    filters: Vec<Filter>,
    explicit_order_by: Vec<OrderBy>,
    limit: Option<u32>,
    limit_type: LimitType,
    start_at: Option<Bound>,
    end_at: Option<Bound>,
}

impl Query {
    /// Query over the collection or single document at `path`.
    pub fn at_path(path: ResourcePath) -> Self {
        Self {
            path,
            collection_group: None,
            filters: Vec::new(),
            explicit_order_by: Vec::new(),
            limit: None,
            limit_type: LimitType::First,
            start_at: None,
            end_at: None,
        }
    }

    pub fn collection(path: &str) -> FirestoreResult<Self> {
        let path = ResourcePath::from_string(path)?;
        if path.len() % 2 != 1 {
            return Err(invalid_argument(format!(
                "Invalid collection path {path}: collections need an odd number of segments"
            )));
        }
        Ok(Self::at_path(path))
    }

    pub fn document(key: &DocumentKey) -> Self {
        Self::at_path(key.path().clone())
    }

    /// Query over every collection named `collection_id`.
    pub fn collection_group(collection_id: impl Into<String>) -> Self {
        let mut query = Self::at_path(ResourcePath::root());
        query.collection_group = Some(collection_id.into());
        query
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn with_order_by(mut self, order_by: OrderBy) -> Self {
        self.explicit_order_by.push(order_by);
        self
    }

    pub fn with_limit_to_first(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self.limit_type = LimitType::First;
        self
    }

    pub fn with_limit_to_last(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self.limit_type = LimitType::Last;
        self
    }

    pub fn without_limit(mut self) -> Self {
        self.limit = None;
        self.limit_type = LimitType::First;
        self
    }

    pub fn with_start_at(mut self, bound: Bound) -> Self {
        self.start_at = Some(bound);
        self
    }

    pub fn with_end_at(mut self, bound: Bound) -> Self {
        self.end_at = Some(bound);
        self
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn collection_group_id(&self) -> Option<&str> {
        self.collection_group.as_deref()
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    pub fn explicit_order_by(&self) -> &[OrderBy] {
        &self.explicit_order_by
    }

    pub fn limit(&self) -> Option<u32> {
        self.limit
    }

    pub fn limit_type(&self) -> LimitType {
        self.limit_type
    }

    pub fn start_at(&self) -> Option<&Bound> {
        self.start_at.as_ref()
    }

    pub fn end_at(&self) -> Option<&Bound> {
        self.end_at.as_ref()
    }

    pub fn has_limit(&self) -> bool {
        self.limit.is_some()
    }

    pub fn is_document_query(&self) -> bool {
        self.collection_group.is_none()
            && DocumentKey::is_document_key(&self.path)
            && self.filters.is_empty()
    }

    pub fn is_collection_group_query(&self) -> bool {
        self.collection_group.is_some()
    }

    /// True when every document in the collection matches.
    pub fn matches_all_documents(&self) -> bool {
        self.filters.is_empty()
            && self.limit.is_none()
            && self.start_at.is_none()
            && self.end_at.is_none()
            && (self.explicit_order_by.is_empty()
                || (self.explicit_order_by.len() == 1
                    && self.explicit_order_by[0].field.is_key_field()))
    }

    /// Fields constrained by inequality filters, in field order.
    pub fn inequality_fields(&self) -> Vec<FieldPath> {
        let mut fields: Vec<FieldPath> = self
            .filters
            .iter()
            .flat_map(Filter::flattened)
            .filter(|filter| filter.is_inequality())
            .map(|filter| filter.field.clone())
            .collect();
        fields.sort();
        fields.dedup();
        fields
    }

    /// Explicit orderings, then inequality fields not ordered explicitly,
    /// then the document key in the direction of the last ordering.
    pub fn normalized_order_by(&self) -> Vec<OrderBy> {
        let mut order_by = self.explicit_order_by.clone();
        let last_direction = order_by
            .last()
            .map(|order| order.direction)
            .unwrap_or(Direction::Ascending);
        for field in self.inequality_fields() {
            if !field.is_key_field() && !order_by.iter().any(|order| order.field == field) {
                order_by.push(OrderBy::new(field, last_direction));
            }
        }
        if !order_by.iter().any(|order| order.field.is_key_field()) {
            order_by.push(OrderBy::new(FieldPath::key_path(), last_direction));
        }
        order_by
    }

    pub fn matches(&self, document: &Document) -> bool {
        document.is_found_document()
            && self.matches_path(document.key())
            && self.matches_order_by(document)
            && self.filters.iter().all(|filter| filter.matches(document))
            && self.matches_bounds(document)
    }

    fn matches_path(&self, key: &DocumentKey) -> bool {
        let path = key.path();
        if let Some(group) = &self.collection_group {
            key.has_collection_id(group) && self.path.is_prefix_of(path)
        } else if DocumentKey::is_document_key(&self.path) {
            &self.path == path
        } else {
            self.path.is_immediate_parent_of(path)
        }
    }

    fn matches_order_by(&self, document: &Document) -> bool {
        self.explicit_order_by
            .iter()
            .filter(|order| !order.field.is_key_field())
            .all(|order| document.field(&order.field).is_some())
    }

    fn matches_bounds(&self, document: &Document) -> bool {
        let order_by = self.normalized_order_by();
        if let Some(start) = &self.start_at {
            if !start.sorts_before_document(&order_by, document) {
                return false;
            }
        }
        if let Some(end) = &self.end_at {
            if !end.sorts_after_document(&order_by, document) {
                return false;
            }
        }
        true
    }

    /// Orders documents the way the query returns them.
    pub fn compare_documents(&self, left: &Document, right: &Document) -> Ordering {
        compare_documents_by(&self.normalized_order_by(), left, right)
    }

    /// The same query rooted at a single collection, used to split
    /// collection group queries per parent.
    pub fn as_collection_query_at_path(&self, path: ResourcePath) -> Self {
        Self {
            path,
            collection_group: None,
            ..self.clone()
        }
    }

    /// Backend target for this query. Limit-to-last queries are sent with
    /// flipped orderings and cursors.
    pub fn to_target(&self) -> Target {
        let order_by = self.normalized_order_by();
        if self.limit_type == LimitType::First {
            return Target::new(
                self.path.clone(),
                self.collection_group.clone(),
                self.filters.clone(),
                order_by,
                self.limit,
                self.start_at.clone(),
                self.end_at.clone(),
            );
        }
        let flipped = order_by
            .into_iter()
            .map(|order| OrderBy::new(order.field, order.direction.flipped()))
            .collect();
        Target::new(
            self.path.clone(),
            self.collection_group.clone(),
            self.filters.clone(),
            flipped,
            self.limit,
            self.end_at.clone(),
            self.start_at.clone(),
        )
    }

    /// Rebuilds a limit-to-first query from a target, for targets whose
    /// originating query lives in another client.
    pub fn from_target(target: &Target) -> Self {
        Self {
            path: target.path().clone(),
            collection_group: target.collection_group().map(str::to_string),
            filters: target.filters().to_vec(),
            explicit_order_by: target.order_by().to_vec(),
            limit: target.limit(),
            limit_type: LimitType::First,
            start_at: target.start_at().cloned(),
            end_at: target.end_at().cloned(),
        }
    }

    /// Inverse of [`to_target`](Self::to_target) for a known limit type.
    pub fn from_target_with_limit_type(target: &Target, limit_type: LimitType) -> Self {
        let query = Self::from_target(target);
        match (limit_type, query.limit) {
            (LimitType::Last, Some(limit)) => Self {
                explicit_order_by: query
                    .explicit_order_by
                    .iter()
                    .map(|order| OrderBy::new(order.field.clone(), order.direction.flipped()))
                    .collect(),
                start_at: query.end_at.clone(),
                end_at: query.start_at.clone(),
                ..query
            }
            .with_limit_to_last(limit),
            _ => query,
        }
    }

    pub fn canonical_id(&self) -> String {
        let limit_type = match self.limit_type {
            LimitType::First => "F",
            LimitType::Last => "L",
        };
        format!("{}|lt:{limit_type}", self.to_target().canonical_id())
    }
}

impl Display for Query {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Query({})", self.canonical_id())
    }
}

/// Compares documents along the given orderings. The orderings must end in
/// the key ordering for the result to be total.
pub fn compare_documents_by(order_by: &[OrderBy], left: &Document, right: &Document) -> Ordering {
    for order in order_by {
        let ordering = order.compare(left, right);
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    left.key().cmp(right.key())
}

pub(crate) fn order_by_canonical_id(order_by: &[OrderBy]) -> String {
    order_by
        .iter()
        .map(OrderBy::canonical_id)
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::filter::Operator;
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
    fn collection_queries_match_direct_children_only() {
        let query = Query::collection("rooms").unwrap();
        assert!(query.matches(&doc("rooms/a", &[])));
        assert!(!query.matches(&doc("rooms/a/messages/1", &[])));
        assert!(!query.matches(&doc("other/a", &[])));
        assert!(Query::collection("rooms/a").is_err());
    }

    #[test]
    fn collection_group_queries_match_any_depth() {
        let query = Query::collection_group("messages");
        assert!(query.matches(&doc("rooms/a/messages/1", &[])));
        assert!(query.matches(&doc("messages/2", &[])));
        assert!(!query.matches(&doc("rooms/a", &[])));
    }

    #[test]
    fn normalizes_order_by_with_inequalities_and_key() {
        let query = Query::collection("c")
            .unwrap()
            .with_filter(Filter::field(field("b"), Operator::GreaterThan, 1i64.into()).unwrap())
            .with_order_by(OrderBy::new(field("a"), Direction::Descending));
        let order_by = query.normalized_order_by();
        assert_eq!(order_by.len(), 3);
        assert_eq!(order_by[1], OrderBy::new(field("b"), Direction::Descending));
        assert!(order_by[2].field.is_key_field());
        assert_eq!(order_by[2].direction, Direction::Descending);
    }

    #[test]
    fn order_by_excludes_documents_missing_the_field() {
        let query = Query::collection("c")
            .unwrap()
            .with_order_by(OrderBy::ascending(field("a")));
        assert!(query.matches(&doc("c/1", &[("a", 1i64.into())])));
        assert!(!query.matches(&doc("c/2", &[])));
    }

    #[test]
    fn cursors_bound_results() {
        let query = Query::collection("c")
            .unwrap()
            .with_order_by(OrderBy::ascending(field("a")))
            .with_start_at(Bound::new(vec![2i64.into()], true))
            .with_end_at(Bound::new(vec![4i64.into()], false));
        let matching: Vec<i64> = (1..=5)
            .filter(|value| query.matches(&doc(&format!("c/{value}"), &[("a", (*value).into())])))
            .collect();
        assert_eq!(matching, vec![2, 3]);
    }

    #[test]
    fn limit_to_last_flips_target_ordering() {
        let query = Query::collection("c")
            .unwrap()
            .with_order_by(OrderBy::ascending(field("a")))
            .with_limit_to_last(2);
        let target = query.to_target();
        assert_eq!(target.order_by()[0].direction, Direction::Descending);
        assert_ne!(
            query.canonical_id(),
            query.clone().with_limit_to_first(2).canonical_id()
        );
    }

    #[test]
    fn compares_by_order_then_key() {
        let query = Query::collection("c")
            .unwrap()
            .with_order_by(OrderBy::ascending(field("a")));
        let one = doc("c/z", &[("a", 1i64.into())]);
        let two = doc("c/a", &[("a", 2i64.into())]);
        assert_eq!(query.compare_documents(&one, &two), Ordering::Less);
    }
}
