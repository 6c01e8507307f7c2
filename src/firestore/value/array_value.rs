use crate::firestore::value::{values_equal, FirestoreValue};

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ArrayValue {
    values: Vec<FirestoreValue>,
}

impl ArrayValue {
    pub fn new(values: Vec<FirestoreValue>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[FirestoreValue] {
        &self.values
    }

    pub fn into_values(self) -> Vec<FirestoreValue> {
        self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Membership using backend value equality, so `1` matches `1.0`.
    pub fn contains(&self, needle: &FirestoreValue) -> bool {
        self.values.iter().any(|value| values_equal(value, needle))
    }

    /// Appends each element that is not already present.
    pub fn union(&self, elements: &[FirestoreValue]) -> Self {
        let mut values = self.values.clone();
        for element in elements {
            if !values.iter().any(|existing| values_equal(existing, element)) {
                values.push(element.clone());
            }
        }
        Self::new(values)
    }

    /// Drops every occurrence of each element.
    pub fn remove_all(&self, elements: &[FirestoreValue]) -> Self {
        let values = self
            .values
            .iter()
            .filter(|value| !elements.iter().any(|element| values_equal(value, element)))
            .cloned()
            .collect();
        Self::new(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn union_and_remove() {
        let array = ArrayValue::new(vec![1.into(), 2.into(), 1.into()]);
        let unioned = array.union(&[2.into(), 3.into()]);
        assert_eq!(unioned.len(), 4);
        let removed = unioned.remove_all(&[FirestoreValue::from(1.0)]);
        assert_eq!(
            removed.values().to_vec(),
            vec![FirestoreValue::from(2), FirestoreValue::from(3)]
        );
    }
}
