use md5::{Digest, Md5};

use crate::firestore::error::{invalid_argument, FirestoreResult};

/// Probabilistic set of document names. Membership tests never report
/// false negatives.
#[derive(Clone, Debug)]
pub struct BloomFilter {
    bitmap: Vec<u8>,
    hash_count: u32,
    bit_count: u64,
}

impl BloomFilter {
    pub fn new(bitmap: Vec<u8>, padding: i32, hash_count: i32) -> FirestoreResult<Self> {
        if !(0..8).contains(&padding) {
            return Err(invalid_argument(format!("Invalid padding: {padding}")));
        }
        if hash_count < 0 {
            return Err(invalid_argument(format!("Invalid hash count: {hash_count}")));
        }
        if bitmap.is_empty() && padding != 0 {
            return Err(invalid_argument(format!(
                "Invalid padding when bitmap length is 0: {padding}"
            )));
        }
        if !bitmap.is_empty() && hash_count == 0 {
            return Err(invalid_argument("Invalid hash count: 0"));
        }
        let bit_count = (bitmap.len() as u64) * 8 - padding as u64;
        Ok(Self {
            bitmap,
            hash_count: hash_count as u32,
            bit_count,
        })
    }

    pub fn bit_count(&self) -> u64 {
        self.bit_count
    }

    pub fn might_contain(&self, value: &str) -> bool {
        if self.bit_count == 0 {
            return false;
        }
        let (h1, h2) = hashes(value);
        (0..self.hash_count).all(|i| self.is_bit_set(self.bit_index(h1, h2, i)))
    }

    fn bit_index(&self, h1: u64, h2: u64, i: u32) -> u64 {
        h1.wrapping_add(h2.wrapping_mul(i as u64)) % self.bit_count
    }

    fn is_bit_set(&self, index: u64) -> bool {
        let byte = self.bitmap[(index / 8) as usize];
        byte & (1 << (index % 8)) != 0
    }

    #[cfg(test)]
    fn insert(&mut self, value: &str) {
        let (h1, h2) = hashes(value);
        for i in 0..self.hash_count {
            let index = self.bit_index(h1, h2, i);
            self.bitmap[(index / 8) as usize] |= 1 << (index % 8);
        }
    }
}

fn hashes(value: &str) -> (u64, u64) {
    let digest = Md5::digest(value.as_bytes());
    let mut first = [0u8; 8];
    let mut second = [0u8; 8];
    first.copy_from_slice(&digest[..8]);
    second.copy_from_slice(&digest[8..16]);
    (u64::from_le_bytes(first), u64::from_le_bytes(second))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const PREFIX: &str = "projects/p/databases/(default)/documents/rooms/";

    #[test]
    fn rejects_malformed_parameters() {
        assert!(BloomFilter::new(vec![], 1, 1).is_err());
        assert!(BloomFilter::new(vec![1], 8, 1).is_err());
        assert!(BloomFilter::new(vec![1], -1, 1).is_err());
        assert!(BloomFilter::new(vec![1], 0, 0).is_err());
        assert!(BloomFilter::new(vec![1], 0, -1).is_err());
        assert!(BloomFilter::new(vec![], 0, 0).is_ok());
    }

    #[test]
    fn empty_filter_contains_nothing() {
        let filter = BloomFilter::new(vec![], 0, 0).unwrap();
        assert_eq!(filter.bit_count(), 0);
        assert!(!filter.might_contain(&format!("{PREFIX}a")));
    }

    #[test]
    fn inserted_names_are_always_found() {
        let mut filter = BloomFilter::new(vec![0; 64], 3, 7).unwrap();
        let names: Vec<String> = (0..40).map(|i| format!("{PREFIX}doc{i}")).collect();
        for name in &names {
            filter.insert(name);
        }
        assert!(names.iter().all(|name| filter.might_contain(name)));
    }

    #[test]
    fn false_positive_rate_stays_low() {
        let mut filter = BloomFilter::new(vec![0; 128], 0, 7).unwrap();
        for i in 0..50 {
            filter.insert(&format!("{PREFIX}present{i}"));
        }
        let mut rng = StdRng::seed_from_u64(7);
        let trials = 2000;
        let false_positives = (0..trials)
            .filter(|_| filter.might_contain(&format!("{PREFIX}absent{}", rng.gen::<u64>())))
            .count();
        assert!(false_positives < trials / 20, "{false_positives} false positives");
    }
}
