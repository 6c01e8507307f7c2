use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::model::FieldPath;
use crate::firestore::value::{FirestoreValue, ValueKind};

/// Document data, addressable by [`FieldPath`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MapValue {
    fields: BTreeMap<String, FirestoreValue>,
}

impl MapValue {
    pub fn new(fields: BTreeMap<String, FirestoreValue>) -> Self {
        Self { fields }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn fields(&self) -> &BTreeMap<String, FirestoreValue> {
        &self.fields
    }

    pub fn into_fields(self) -> BTreeMap<String, FirestoreValue> {
        self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn field(&self, path: &FieldPath) -> Option<&FirestoreValue> {
        let (last, parents) = path.segments().split_last()?;
        let mut current = &self.fields;
        for segment in parents {
            match current.get(segment).map(FirestoreValue::kind) {
                Some(ValueKind::Map(child)) => current = &child.fields,
                _ => return None,
            }
        }
        current.get(last)
    }

    /// Sets `path`, replacing any non-map value found along the way.
    pub fn set(&mut self, path: &FieldPath, value: FirestoreValue) {
        let Some((last, parents)) = path.segments().split_last() else {
            return;
        };
        let mut current = &mut self.fields;
        for segment in parents {
            let entry = current
                .entry(segment.clone())
                .or_insert_with(|| FirestoreValue::from_map(BTreeMap::new()));
            if entry.as_map().is_none() {
                *entry = FirestoreValue::from_map(BTreeMap::new());
            }
            current = match entry.kind_mut() {
                ValueKind::Map(child) => &mut child.fields,
                _ => return,
            };
        }
        current.insert(last.clone(), value);
    }

    pub fn delete(&mut self, path: &FieldPath) {
        let Some((last, parents)) = path.segments().split_last() else {
            return;
        };
        let mut current = &mut self.fields;
        for segment in parents {
            current = match current.get_mut(segment).map(FirestoreValue::kind_mut) {
                Some(ValueKind::Map(child)) => &mut child.fields,
                _ => return,
            };
        }
        current.remove(last);
    }

    /// Leaf paths of every field. Empty nested maps count as leaves.
    pub fn field_mask(&self) -> BTreeSet<FieldPath> {
        let mut mask = BTreeSet::new();
        collect_paths(&self.fields, &[], &mut mask);
        mask
    }
}

fn collect_paths(
    fields: &BTreeMap<String, FirestoreValue>,
    prefix: &[String],
    out: &mut BTreeSet<FieldPath>,
) {
    for (key, value) in fields {
        let mut segments = prefix.to_vec();
        segments.push(key.clone());
        match value.kind() {
            ValueKind::Map(child) if !child.is_empty() => {
                collect_paths(&child.fields, &segments, out)
            }
            _ => {
                if let Ok(path) = FieldPath::new(segments) {
                    out.insert(path);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(value: &str) -> FieldPath {
        FieldPath::from_dot_separated(value).unwrap()
    }

    #[test]
    fn sets_and_reads_nested_fields() {
        let mut map = MapValue::empty();
        map.set(&path("a.b.c"), FirestoreValue::from(1));
        map.set(&path("a.d"), FirestoreValue::from("x"));
        assert_eq!(map.field(&path("a.b.c")), Some(&FirestoreValue::from(1)));
        assert_eq!(map.field(&path("a.d")).and_then(FirestoreValue::as_str), Some("x"));
        assert!(map.field(&path("a.d.e")).is_none());
    }

    #[test]
    fn overwrites_scalars_with_maps() {
        let mut map = MapValue::empty();
        map.set(&path("a"), FirestoreValue::from(1));
        map.set(&path("a.b"), FirestoreValue::from(2));
        assert_eq!(map.field(&path("a.b")), Some(&FirestoreValue::from(2)));
    }

    #[test]
    fn deletes_and_lists_leaf_paths() {
        let mut map = MapValue::empty();
        map.set(&path("a.b"), FirestoreValue::from(1));
        map.set(&path("a.c"), FirestoreValue::from(2));
        map.set(&path("z"), FirestoreValue::from_map(BTreeMap::new()));
        map.delete(&path("a.b"));
        let mask: Vec<String> = map.field_mask().iter().map(|p| p.canonical_string()).collect();
        assert_eq!(mask, vec!["a.c".to_string(), "z".to_string()]);
    }
}
