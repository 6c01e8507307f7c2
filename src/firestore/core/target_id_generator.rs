use crate::firestore::model::TargetId;

/// Hands out target ids from disjoint sequences: even ids for query
/// targets persisted in the target cache, odd ids for limbo resolution
/// targets owned by the sync engine.
#[derive(Clone, Debug)]
pub struct TargetIdGenerator {
    last_id: TargetId,
}

impl TargetIdGenerator {
    /// First id is 2, then every following even number. Seeded with the
    /// highest id persisted so far so ids are never reused.
    pub fn for_target_cache(highest_persisted: TargetId) -> Self {
        let highest_even = highest_persisted.max(0) & !1;
        Self {
            last_id: highest_even,
        }
    }

    /// First id is 1, then every following odd number.
    pub fn for_sync_engine() -> Self {
        Self { last_id: -1 }
    }

    pub fn next(&mut self) -> TargetId {
        self.last_id += 2;
        self.last_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequences_do_not_overlap() {
        let mut cache = TargetIdGenerator::for_target_cache(0);
        let mut sync = TargetIdGenerator::for_sync_engine();
        assert_eq!([cache.next(), cache.next()], [2, 4]);
        assert_eq!([sync.next(), sync.next()], [1, 3]);
    }

    #[test]
    fn resumes_after_persisted_ids() {
        let mut cache = TargetIdGenerator::for_target_cache(10);
        assert_eq!(cache.next(), 12);
        let mut cache = TargetIdGenerator::for_target_cache(11);
        assert_eq!(cache.next(), 12);
    }
}
