use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::firestore::core::query::{compare_documents_by, Query};
use crate::firestore::model::{Document, DocumentKey};

pub type DocumentComparator = Arc<dyn Fn(&Document, &Document) -> Ordering + Send + Sync>;

/// Documents kept both in query order and addressable by key.
#[derive(Clone)]
pub struct DocumentSet {
    comparator: DocumentComparator,
    by_key: BTreeMap<DocumentKey, Document>,
    sorted: Vec<Document>,
}

impl DocumentSet {
    pub fn new(comparator: DocumentComparator) -> Self {
        Self {
            comparator,
            by_key: BTreeMap::new(),
            sorted: Vec::new(),
        }
    }

    /// Empty set ordered the way `query` returns results.
    pub fn for_query(query: &Query) -> Self {
        let order_by = query.normalized_order_by();
        Self::new(Arc::new(move |left, right| {
            compare_documents_by(&order_by, left, right)
        }))
    }

    pub fn key_ordered() -> Self {
        Self::new(Arc::new(|left: &Document, right: &Document| left.key().cmp(right.key())))
    }

    pub fn comparator(&self) -> DocumentComparator {
        Arc::clone(&self.comparator)
    }

    pub fn len(&self) -> usize {
        self.sorted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sorted.is_empty()
    }

    pub fn contains(&self, key: &DocumentKey) -> bool {
        self.by_key.contains_key(key)
    }

    pub fn get(&self, key: &DocumentKey) -> Option<&Document> {
        self.by_key.get(key)
    }

    pub fn first(&self) -> Option<&Document> {
        self.sorted.first()
    }

    pub fn last(&self) -> Option<&Document> {
        self.sorted.last()
    }

    pub fn index_of(&self, key: &DocumentKey) -> Option<usize> {
        let document = self.by_key.get(key)?;
        self.position(document).ok()
    }

    /// Inserts `document`, replacing any document with the same key.
    pub fn insert(&mut self, document: Document) {
        self.remove(document.key());
        let index = match self.position(&document) {
            Ok(index) | Err(index) => index,
        };
        self.sorted.insert(index, document.clone());
        self.by_key.insert(document.key().clone(), document);
    }

    pub fn remove(&mut self, key: &DocumentKey) -> Option<Document> {
        let document = self.by_key.remove(key)?;
        match self.position(&document) {
            Ok(index) => {
                self.sorted.remove(index);
            }
            Err(_) => self.sorted.retain(|existing| existing.key() != key),
        }
        Some(document)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Document> {
        self.sorted.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &DocumentKey> {
        self.sorted.iter().map(Document::key)
    }

    fn position(&self, document: &Document) -> Result<usize, usize> {
        self.sorted
            .binary_search_by(|existing| (self.comparator)(existing, document))
    }
}

impl PartialEq for DocumentSet {
    fn eq(&self, other: &Self) -> bool {
        self.sorted == other.sorted
    }
}

impl fmt::Debug for DocumentSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::query::OrderBy;
    use crate::firestore::model::{FieldPath, SnapshotVersion, Timestamp};
    use crate::firestore::value::MapValue;
    use std::collections::BTreeMap;

    fn doc(path: &str, sort: i64) -> Document {
        let mut fields = BTreeMap::new();
        fields.insert("sort".to_string(), sort.into());
        Document::new_found(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::from_timestamp(Timestamp::new(1, 0)),
            MapValue::new(fields),
        )
    }

    #[test]
    fn keeps_query_order_across_updates() {
        let query = Query::collection("c")
            .unwrap()
            .with_order_by(OrderBy::ascending(FieldPath::from_dot_separated("sort").unwrap()));
        let mut set = DocumentSet::for_query(&query);
        set.insert(doc("c/a", 3));
        set.insert(doc("c/b", 1));
        set.insert(doc("c/c", 2));
        let keys: Vec<String> = set.keys().map(ToString::to_string).collect();
        assert_eq!(keys, vec!["c/b", "c/c", "c/a"]);

        set.insert(doc("c/b", 5));
        assert_eq!(set.last().unwrap().key().to_string(), "c/b");
        assert_eq!(set.len(), 3);
        assert_eq!(set.index_of(&DocumentKey::from_string("c/c").unwrap()), Some(0));

        set.remove(&DocumentKey::from_string("c/a").unwrap());
        assert_eq!(set.len(), 2);
        assert!(!set.contains(&DocumentKey::from_string("c/a").unwrap()));
    }
}
