use serde_json::{json, Value as JsonValue};

use crate::db_key;
use crate::firestore::core::{LimitType, Query};
use crate::firestore::error::{data_loss, FirestoreResult};
use crate::firestore::local::local_serializer::LocalSerializer;
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::local::schema::{DbBundle, DbNamedQuery, BUNDLES_STORE, NAMED_QUERIES_STORE};
use crate::firestore::model::{Document, SnapshotVersion};

/// Metadata of a loaded bundle.
#[derive(Clone, Debug, PartialEq)]
pub struct BundleMetadata {
    pub id: String,
    pub version: i64,
    pub create_time: SnapshotVersion,
}

/// A query saved from a bundle, with the read time its results reflect.
#[derive(Clone, Debug, PartialEq)]
pub struct NamedQuery {
    pub name: String,
    pub query: Query,
    pub read_time: SnapshotVersion,
}

/// A document carried by a bundle and the named queries it belongs to.
#[derive(Clone, Debug, PartialEq)]
pub struct BundledDocument {
    pub document: Document,
    pub queries: Vec<String>,
}

/// Decoded contents of a bundle, ready to be loaded into the cache.
#[derive(Clone, Debug, PartialEq)]
pub struct Bundle {
    pub metadata: BundleMetadata,
    pub named_queries: Vec<NamedQuery>,
    pub documents: Vec<BundledDocument>,
}

#[derive(Clone, Debug)]
pub struct BundleCache {
    serializer: LocalSerializer,
}

impl BundleCache {
    pub fn new(serializer: LocalSerializer) -> Self {
        Self { serializer }
    }

    pub fn get_bundle_metadata(
        &self,
        txn: &PersistenceTransaction<'_, '_>,
        bundle_id: &str,
    ) -> FirestoreResult<Option<BundleMetadata>> {
        Ok(txn
            .get::<DbBundle>(BUNDLES_STORE, &db_key![bundle_id])?
            .map(|row| BundleMetadata {
                id: row.bundle_id,
                version: row.version,
                create_time: SnapshotVersion::from_timestamp(row.create_time),
            }))
    }

    pub fn save_bundle_metadata(
        &self,
        txn: &mut PersistenceTransaction<'_, '_>,
        metadata: &BundleMetadata,
    ) -> FirestoreResult<()> {
        let row = DbBundle {
            bundle_id: metadata.id.clone(),
            create_time: metadata.create_time.timestamp(),
            version: metadata.version,
        };
        txn.put(BUNDLES_STORE, db_key![metadata.id.as_str()], &row)
    }

    pub fn get_named_query(
        &self,
        txn: &PersistenceTransaction<'_, '_>,
        name: &str,
    ) -> FirestoreResult<Option<NamedQuery>> {
        txn.get::<DbNamedQuery>(NAMED_QUERIES_STORE, &db_key![name])?
            .map(|row| self.decode_named_query(row))
            .transpose()
    }

    pub fn save_named_query(
        &self,
        txn: &mut PersistenceTransaction<'_, '_>,
        query: &NamedQuery,
    ) -> FirestoreResult<()> {
        let limit_type = match query.query.limit_type() {
            LimitType::First => "FIRST",
            LimitType::Last => "LAST",
        };
        let row = DbNamedQuery {
            name: query.name.clone(),
            read_time: query.read_time.timestamp(),
            bundled_query: json!({
                "target": self.serializer.encode_target(&query.query.to_target()),
                "limitType": limit_type,
            }),
        };
        txn.put(NAMED_QUERIES_STORE, db_key![query.name.as_str()], &row)
    }

    fn decode_named_query(&self, row: DbNamedQuery) -> FirestoreResult<NamedQuery> {
        let target = row
            .bundled_query
            .get("target")
            .ok_or_else(|| data_loss(format!("Named query {} has no target", row.name)))?;
        let target = self.serializer.decode_target(target)?;
        let limit_type = match row.bundled_query.get("limitType").and_then(JsonValue::as_str) {
            Some("LAST") => LimitType::Last,
            _ => LimitType::First,
        };
        Ok(NamedQuery {
            name: row.name,
            query: Query::from_target_with_limit_type(&target, limit_type),
            read_time: SnapshotVersion::from_timestamp(row.read_time),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::{Direction, OrderBy};
    use crate::firestore::local::persistence::TransactionMode;
    use crate::firestore::local::test_persistence;
    use crate::firestore::model::{FieldPath, Timestamp};

    #[tokio::test]
    async fn named_queries_keep_their_limit_type() {
        let persistence = test_persistence().await;
        let cache = BundleCache::new(persistence.serializer().clone());
        let query = Query::collection("rooms")
            .unwrap()
            .with_order_by(OrderBy::new(FieldPath::from_dot_separated("size").unwrap(), Direction::Descending))
            .with_limit_to_last(3);
        let named = NamedQuery {
            name: "largest".to_string(),
            query: query.clone(),
            read_time: SnapshotVersion::from_timestamp(Timestamp::new(30, 0)),
        };
        let metadata = BundleMetadata {
            id: "bundle-1".to_string(),
            version: 1,
            create_time: SnapshotVersion::from_timestamp(Timestamp::new(20, 0)),
        };

        persistence
            .run_transaction("save", TransactionMode::ReadWrite, |txn| {
                cache.save_bundle_metadata(txn, &metadata)?;
                cache.save_named_query(txn, &named)
            })
            .unwrap();

        let (loaded_metadata, loaded_query, missing) = persistence
            .run_transaction("load", TransactionMode::ReadOnly, |txn| {
                Ok((
                    cache.get_bundle_metadata(txn, "bundle-1")?,
                    cache.get_named_query(txn, "largest")?,
                    cache.get_named_query(txn, "other")?,
                ))
            })
            .unwrap();
        assert_eq!(loaded_metadata, Some(metadata));
        let loaded_query = loaded_query.unwrap();
        assert_eq!(loaded_query.query.canonical_id(), query.canonical_id());
        assert_eq!(loaded_query.query.limit_type(), LimitType::Last);
        assert!(missing.is_none());
    }
}
