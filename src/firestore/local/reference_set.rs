use std::collections::BTreeSet;

use crate::firestore::model::DocumentKey;

/// Two-way index of `(document key, owner id)` pairs. Owners are target ids
/// or batch ids depending on the set's use.
#[derive(Clone, Debug, Default)]
pub struct ReferenceSet {
    by_key: BTreeSet<(DocumentKey, i32)>,
    by_id: BTreeSet<(i32, DocumentKey)>,
}

impl ReferenceSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    pub fn add_reference(&mut self, key: DocumentKey, id: i32) {
        self.by_id.insert((id, key.clone()));
        self.by_key.insert((key, id));
    }

    pub fn add_references(&mut self, keys: impl IntoIterator<Item = DocumentKey>, id: i32) {
        for key in keys {
            self.add_reference(key, id);
        }
    }

    pub fn remove_reference(&mut self, key: &DocumentKey, id: i32) {
        self.by_id.remove(&(id, key.clone()));
        self.by_key.remove(&(key.clone(), id));
    }

    pub fn remove_references<'a>(&mut self, keys: impl IntoIterator<Item = &'a DocumentKey>, id: i32) {
        for key in keys {
            self.remove_reference(key, id);
        }
    }

    /// Drops every reference owned by `id` and returns the released keys.
    pub fn remove_references_for_id(&mut self, id: i32) -> BTreeSet<DocumentKey> {
        let keys = self.references_for_id(id);
        for key in &keys {
            self.remove_reference(key, id);
        }
        keys
    }

    pub fn remove_all_references(&mut self) -> BTreeSet<DocumentKey> {
        let keys = self.by_key.iter().map(|(key, _)| key.clone()).collect();
        self.by_key.clear();
        self.by_id.clear();
        keys
    }

    pub fn references_for_id(&self, id: i32) -> BTreeSet<DocumentKey> {
        self.by_id
            .range((id, DocumentKey::empty())..)
            .take_while(|(owner, _)| *owner == id)
            .map(|(_, key)| key.clone())
            .collect()
    }

    pub fn contains_key(&self, key: &DocumentKey) -> bool {
        self.by_key
            .range((key.clone(), i32::MIN)..)
            .next()
            .is_some_and(|(candidate, _)| candidate == key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    #[test]
    fn tracks_references_by_owner() {
        let mut set = ReferenceSet::new();
        set.add_references([key("a/1"), key("a/2")], 2);
        set.add_reference(key("a/2"), 4);

        assert_eq!(set.references_for_id(2).len(), 2);
        assert!(set.contains_key(&key("a/2")));

        let released = set.remove_references_for_id(2);
        assert_eq!(released.len(), 2);
        assert!(!set.contains_key(&key("a/1")));
        assert!(set.contains_key(&key("a/2")));

        set.remove_reference(&key("a/2"), 4);
        assert!(set.is_empty());
    }
}
