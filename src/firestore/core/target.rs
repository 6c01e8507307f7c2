use std::fmt::{Display, Formatter};

use crate::firestore::core::filter::{FieldFilter, Filter};
use crate::firestore::core::query::{order_by_canonical_id, Bound, OrderBy};
use crate::firestore::model::{DocumentKey, FieldPath, ResourcePath};

/// The backend-facing form of a query: the set of documents a listen
/// covers. Two queries that differ only in their limit type share a target.
#[derive(Clone, Debug, PartialEq)]
pub struct Target {
    path: ResourcePath,
    collection_group: Option<String>,
    filters: Vec<Filter>,
    order_by: Vec<OrderBy>,
    limit: Option<u32>,
    start_at: Option<Bound>,
    end_at: Option<Bound>,
}

impl Target {
    pub fn new(
        path: ResourcePath,
        collection_group: Option<String>,
        filters: Vec<Filter>,
        order_by: Vec<OrderBy>,
        limit: Option<u32>,
        start_at: Option<Bound>,
        end_at: Option<Bound>,
    ) -> Self {
        Self {
            path,
            collection_group,
            filters,
            order_by,
            limit,
            start_at,
            end_at,
        }
    }

    /// Target that listens to a single document, as used for limbo
    /// resolution.
    pub fn for_document(key: &DocumentKey) -> Self {
        Self::new(key.path().clone(), None, Vec::new(), Vec::new(), None, None, None)
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn collection_group(&self) -> Option<&str> {
        self.collection_group.as_deref()
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    pub fn order_by(&self) -> &[OrderBy] {
        &self.order_by
    }

    pub fn limit(&self) -> Option<u32> {
        self.limit
    }

    pub fn start_at(&self) -> Option<&Bound> {
        self.start_at.as_ref()
    }

    pub fn end_at(&self) -> Option<&Bound> {
        self.end_at.as_ref()
    }

    pub fn is_document_query(&self) -> bool {
        DocumentKey::is_document_key(&self.path)
            && self.collection_group.is_none()
            && self.filters.is_empty()
    }

    /// Collection id the target reads from, for index lookups.
    pub fn collection_id(&self) -> Option<&str> {
        match &self.collection_group {
            Some(group) => Some(group.as_str()),
            None => self.path.last_segment(),
        }
    }

    /// Field filters on `field` at the top level of the conjunction.
    pub fn field_filters_for(&self, field: &FieldPath) -> Vec<&FieldFilter> {
        self.filters
            .iter()
            .flat_map(Filter::flattened)
            .filter(|filter| &filter.field == field)
            .collect()
    }

    /// True when the filters can be planned against a single index without
    /// a disjunctive rewrite.
    pub fn has_only_conjunctive_filters(&self) -> bool {
        self.filters.iter().all(Filter::is_flat_conjunction)
    }

    pub fn canonical_id(&self) -> String {
        let mut id = self.path.canonical_string();
        if let Some(group) = &self.collection_group {
            id.push_str("|cg:");
            id.push_str(group);
        }
        id.push_str("|f:");
        id.push_str(
            &self
                .filters
                .iter()
                .map(Filter::canonical_id)
                .collect::<Vec<_>>()
                .join(""),
        );
        id.push_str("|ob:");
        id.push_str(&order_by_canonical_id(&self.order_by));
        if let Some(limit) = self.limit {
            id.push_str(&format!("|l:{limit}"));
        }
        if let Some(start) = &self.start_at {
            id.push_str("|lb:");
            id.push_str(&start.canonical_id());
        }
        if let Some(end) = &self.end_at {
            id.push_str("|ub:");
            id.push_str(&end.canonical_id());
        }
        id
    }
}

impl Display for Target {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Target({})", self.canonical_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::filter::Operator;
    use crate::firestore::core::query::Query;

    fn field(name: &str) -> FieldPath {
        FieldPath::from_dot_separated(name).unwrap()
    }

    #[test]
    fn canonical_id_covers_every_component() {
        let target = Query::collection("rooms")
            .unwrap()
            .with_filter(Filter::field(field("size"), Operator::GreaterThan, 3i64.into()).unwrap())
            .with_limit_to_first(5)
            .to_target();
        assert_eq!(
            target.canonical_id(),
            "rooms|f:size>3|ob:sizeasc,__name__asc|l:5"
        );
    }

    #[test]
    fn document_targets() {
        let key = DocumentKey::from_string("rooms/a").unwrap();
        let target = Target::for_document(&key);
        assert!(target.is_document_query());
        assert_eq!(target.canonical_id(), "rooms/a|f:|ob:");
        assert_eq!(target.collection_id(), Some("a"));
    }

    #[test]
    fn finds_filters_by_field() {
        let target = Query::collection("c")
            .unwrap()
            .with_filter(Filter::field(field("a"), Operator::Equal, 1i64.into()).unwrap())
            .with_filter(Filter::field(field("b"), Operator::Equal, 2i64.into()).unwrap())
            .to_target();
        assert_eq!(target.field_filters_for(&field("a")).len(), 1);
        assert!(target.has_only_conjunctive_filters());
    }
}
