//! Disjunctive normal form for query filters.
//!
//! Index planning can only serve a conjunction of field filters per index
//! scan, so composite filters are rewritten into an OR of such conjunctions.
//! `in` and `array-contains-any` are expanded into one term per value along
//! the way.

use crate::firestore::core::filter::{CompositeOperator, FieldFilter, Filter, Operator};

/// A conjunction of field filters.
pub type DnfTerm = Vec<FieldFilter>;

/// Rewrites the implicit AND of `filters` into its DNF terms. A query
/// without filters has a single empty term.
pub fn dnf_terms(filters: &[Filter]) -> Vec<DnfTerm> {
    let mut terms: Vec<DnfTerm> = vec![Vec::new()];
    for filter in filters {
        terms = distribute(&terms, &filter_terms(filter));
    }
    terms
}

/// DNF of a single filter, as a filter tree of depth at most two.
pub fn compute_dnf(filter: &Filter) -> Filter {
    let mut terms: Vec<Filter> = filter_terms(filter)
        .into_iter()
        .map(term_to_filter)
        .collect();
    if terms.len() == 1 {
        return terms.remove(0);
    }
    Filter::or(terms)
}

fn filter_terms(filter: &Filter) -> Vec<DnfTerm> {
    match filter {
        Filter::Field(field_filter) => expand_field_filter(field_filter)
            .into_iter()
            .map(|single| vec![single])
            .collect(),
        Filter::Composite(composite) => match composite.op {
            CompositeOperator::And => {
                let mut terms: Vec<DnfTerm> = vec![Vec::new()];
                for child in &composite.filters {
                    terms = distribute(&terms, &filter_terms(child));
                }
                terms
            }
            CompositeOperator::Or => composite.filters.iter().flat_map(filter_terms).collect(),
        },
    }
}

fn expand_field_filter(filter: &FieldFilter) -> Vec<FieldFilter> {
    let single_op = match filter.op {
        Operator::In => Operator::Equal,
        Operator::ArrayContainsAny => Operator::ArrayContains,
        _ => return vec![filter.clone()],
    };
    let Some(values) = filter.value.as_array() else {
        return vec![filter.clone()];
    };
    values
        .values()
        .iter()
        .map(|value| FieldFilter {
            field: filter.field.clone(),
            op: single_op,
            value: value.clone(),
        })
        .collect()
}

fn distribute(left: &[DnfTerm], right: &[DnfTerm]) -> Vec<DnfTerm> {
    let mut result = Vec::with_capacity(left.len() * right.len());
    for l in left {
        for r in right {
            let mut term = l.clone();
            term.extend(r.iter().cloned());
            result.push(term);
        }
    }
    result
}

fn term_to_filter(mut term: DnfTerm) -> Filter {
    if term.len() == 1 {
        return Filter::Field(term.remove(0));
    }
    Filter::and(term.into_iter().map(Filter::Field).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::FieldPath;
    use crate::firestore::value::FirestoreValue;

    fn eq(name: &str, value: i64) -> Filter {
        Filter::field(
            FieldPath::from_dot_separated(name).unwrap(),
            Operator::Equal,
            value.into(),
        )
        .unwrap()
    }

    #[test]
    fn distributes_and_over_or() {
        let filter = Filter::and(vec![eq("a", 1), Filter::or(vec![eq("b", 2), eq("c", 3)])]);
        assert_eq!(
            compute_dnf(&filter).canonical_id(),
            "or(and(a==1,b==2),and(a==1,c==3))"
        );
    }

    #[test]
    fn expands_in_filters() {
        let filter = Filter::field(
            FieldPath::from_dot_separated("a").unwrap(),
            Operator::In,
            FirestoreValue::from_array(vec![1i64.into(), 2i64.into()]),
        )
        .unwrap();
        let terms = dnf_terms(&[filter, eq("b", 5)]);
        assert_eq!(terms.len(), 2);
        assert!(terms.iter().all(|term| term.len() == 2));
        assert_eq!(terms[1][0].canonical_id(), "a==2");
    }

    #[test]
    fn no_filters_yield_one_empty_term() {
        assert_eq!(dnf_terms(&[]), vec![Vec::new()]);
    }
}
