use std::cmp::Ordering;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::firestore::error::{invalid_argument, FirestoreResult};

/// Slash separated path to a collection or document, relative to the
/// database root.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourcePath {
    segments: Vec<String>,
}

impl ResourcePath {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn from_segments<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            segments: segments.into_iter().map(Into::into).collect(),
        }
    }

    pub fn from_string(path: &str) -> FirestoreResult<Self> {
        if path.contains("//") {
            return Err(invalid_argument(format!(
                "Invalid path ({path}). Paths must not contain // in them."
            )));
        }
        Ok(Self::from_segments(
            path.split('/').filter(|segment| !segment.is_empty()),
        ))
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn segment(&self, index: usize) -> Option<&str> {
        self.segments.get(index).map(String::as_str)
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn first_segment(&self) -> Option<&str> {
        self.segments.first().map(String::as_str)
    }

    pub fn last_segment(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.segments.clone();
        segments.push(segment.into());
        Self { segments }
    }

    pub fn append(&self, other: &ResourcePath) -> Self {
        let mut segments = self.segments.clone();
        segments.extend(other.segments.iter().cloned());
        Self { segments }
    }

    /// The path without its last segment; the root stays the root.
    pub fn parent(&self) -> Self {
        let end = self.segments.len().saturating_sub(1);
        Self {
            segments: self.segments[..end].to_vec(),
        }
    }

    pub fn pop_first(&self, count: usize) -> Self {
        let start = count.min(self.segments.len());
        Self {
            segments: self.segments[start..].to_vec(),
        }
    }

    pub fn is_prefix_of(&self, other: &ResourcePath) -> bool {
        self.len() <= other.len() && other.segments[..self.len()] == self.segments[..]
    }

    pub fn is_immediate_parent_of(&self, other: &ResourcePath) -> bool {
        self.len() + 1 == other.len() && self.is_prefix_of(other)
    }

    pub fn canonical_string(&self) -> String {
        self.segments.join("/")
    }
}

impl Ord for ResourcePath {
    fn cmp(&self, other: &Self) -> Ordering {
        for (left, right) in self.segments.iter().zip(other.segments.iter()) {
            match compare_segments(left, right) {
                Ordering::Equal => continue,
                ordering => return ordering,
            }
        }
        self.len().cmp(&other.len())
    }
}

impl PartialOrd for ResourcePath {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Auto-generated numeric ids (`__id123__`) sort numerically and before
/// every regular segment, matching the backend.
fn compare_segments(left: &str, right: &str) -> Ordering {
    match (numeric_id(left), numeric_id(right)) {
        (Some(l), Some(r)) => l.cmp(&r),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => left.cmp(right),
    }
}

fn numeric_id(segment: &str) -> Option<i64> {
    segment
        .strip_prefix("__id")
        .and_then(|rest| rest.strip_suffix("__"))
        .and_then(|digits| digits.parse().ok())
}

impl Display for ResourcePath {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.canonical_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_navigates() {
        let path = ResourcePath::from_string("rooms/eros/messages/1").unwrap();
        assert_eq!(path.len(), 4);
        assert_eq!(path.last_segment(), Some("1"));
        assert_eq!(path.parent().canonical_string(), "rooms/eros/messages");
        assert_eq!(path.pop_first(2).canonical_string(), "messages/1");
        assert!(ResourcePath::from_string("rooms").unwrap().is_prefix_of(&path));
        assert!(ResourcePath::root().parent().is_empty());
    }

    #[test]
    fn rejects_empty_segments() {
        let err = ResourcePath::from_string("rooms//eros").unwrap_err();
        assert_eq!(err.code_str(), "firestore/invalid-argument");
    }

    #[test]
    fn orders_segment_wise_then_by_length() {
        let a = ResourcePath::from_string("a/b").unwrap();
        let ab = ResourcePath::from_string("a/b/c").unwrap();
        let b = ResourcePath::from_string("b").unwrap();
        assert!(a < ab);
        assert!(ab < b);
        let numeric = ResourcePath::from_string("a/__id2__").unwrap();
        let numeric_big = ResourcePath::from_string("a/__id10__").unwrap();
        let named = ResourcePath::from_string("a/0").unwrap();
        assert!(numeric < numeric_big);
        assert!(numeric_big < named);
    }
}
