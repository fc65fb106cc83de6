//! In-memory collection/partition/segment catalog kept once per replica
//! (streaming, historical), plus the per-replica query lock used to gate
//! reads during release (§4.3, §5).
//!
//! Grounded on `meta/src/hummock/manager/mod.rs`'s `HummockManager`: several
//! named locks guarding maps, acquired in a documented order ("compaction
//! lock should be requested before versioning lock"). Here there is a
//! single catalog lock plus the dedicated query lock, and the acquisition
//! order that matters is: query lock held only around the release-time
//! write, never nested under the catalog lock.

use std::collections::{HashMap, HashSet};
use std::fmt;

use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

use crate::error::{QueryNodeError, Result};
use crate::model::{Collection, CollectionSchema, SegmentLoadInfo, Timestamp, UniqueId};

/// Which of the two parallel replicas a [`ReplicaRegistry`] backs. Carried
/// only for logging; the two replicas are otherwise structurally identical.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplicaKind {
    Streaming,
    Historical,
}

impl fmt::Display for ReplicaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplicaKind::Streaming => write!(f, "streaming"),
            ReplicaKind::Historical => write!(f, "historical"),
        }
    }
}

#[derive(Default)]
struct Catalog {
    collections: HashMap<UniqueId, Collection>,
    partitions: HashMap<UniqueId, HashSet<UniqueId>>,
    excluded_segments: HashMap<UniqueId, Vec<SegmentLoadInfo>>,
    /// segment-id -> collection-id, for growing segments only; used to
    /// support the WatchDmChannels rollback path and tolerate double-remove.
    growing_segments: HashMap<UniqueId, UniqueId>,
}

/// One replica's catalog plus its coarse query lock.
pub struct ReplicaRegistry {
    kind: ReplicaKind,
    catalog: RwLock<Catalog>,
    /// Held as a writer during release to block new reads (§4.2.5); held as
    /// a reader by the data plane. `tokio::sync::RwLock` serves fairly
    /// enough to approximate the writer-preferring semantics §4.3 asks for.
    query_lock: RwLock<()>,
}

impl ReplicaRegistry {
    pub fn new(kind: ReplicaKind) -> Self {
        ReplicaRegistry {
            kind,
            catalog: RwLock::new(Catalog::default()),
            query_lock: RwLock::new(()),
        }
    }

    pub fn kind(&self) -> ReplicaKind {
        self.kind
    }

    /// Idempotent add by id: if the collection already exists, it is left
    /// untouched and its current state is returned.
    pub async fn add_collection(&self, id: UniqueId, schema: CollectionSchema) -> Collection {
        let mut catalog = self.catalog.write().await;
        let entry = catalog
            .collections
            .entry(id)
            .or_insert_with(|| Collection::new(id, schema));
        debug!(replica = %self.kind, collection_id = id, "collection present");
        entry.clone()
    }

    pub async fn has_collection(&self, id: UniqueId) -> bool {
        self.catalog.read().await.collections.contains_key(&id)
    }

    pub async fn get_collection(&self, id: UniqueId) -> Option<Collection> {
        self.catalog.read().await.collections.get(&id).cloned()
    }

    /// Applies `mutate` to the collection's in-place record, if present.
    pub async fn mutate_collection<F>(&self, id: UniqueId, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut Collection),
    {
        let mut catalog = self.catalog.write().await;
        match catalog.collections.get_mut(&id) {
            Some(c) => {
                mutate(c);
                Ok(())
            }
            None => Err(QueryNodeError::collection_not_found(id)),
        }
    }

    pub async fn remove_collection(&self, id: UniqueId) {
        let mut catalog = self.catalog.write().await;
        catalog.collections.remove(&id);
        catalog.partitions.remove(&id);
        catalog.growing_segments.retain(|_, cid| *cid != id);
    }

    pub async fn add_partition(&self, collection_id: UniqueId, partition_id: UniqueId) {
        let mut catalog = self.catalog.write().await;
        catalog
            .partitions
            .entry(collection_id)
            .or_default()
            .insert(partition_id);
    }

    pub async fn has_partition(&self, collection_id: UniqueId, partition_id: UniqueId) -> bool {
        self.catalog
            .read()
            .await
            .partitions
            .get(&collection_id)
            .is_some_and(|set| set.contains(&partition_id))
    }

    /// Best-effort: returns `false` (never an error) if the partition was
    /// not present, so `ReleasePartitionsTask` can log-and-continue (§4.2.6).
    pub async fn remove_partition(&self, collection_id: UniqueId, partition_id: UniqueId) -> bool {
        self.catalog
            .write()
            .await
            .partitions
            .get_mut(&collection_id)
            .is_some_and(|set| set.remove(&partition_id))
    }

    pub async fn add_growing_segment(&self, collection_id: UniqueId, segment_id: UniqueId) {
        self.catalog
            .write()
            .await
            .growing_segments
            .insert(segment_id, collection_id);
    }

    /// Tolerates double-remove (§5 Shared-resource policy): removing a
    /// segment id that is not present is a no-op, not an error.
    pub async fn remove_segment(&self, segment_id: UniqueId) {
        self.catalog.write().await.growing_segments.remove(&segment_id);
    }

    pub async fn has_growing_segment(&self, segment_id: UniqueId) -> bool {
        self.catalog
            .read()
            .await
            .growing_segments
            .contains_key(&segment_id)
    }

    pub async fn add_excluded_segments(&self, collection_id: UniqueId, infos: Vec<SegmentLoadInfo>) {
        if infos.is_empty() {
            return;
        }
        self.catalog
            .write()
            .await
            .excluded_segments
            .entry(collection_id)
            .or_default()
            .extend(infos);
    }

    pub async fn excluded_segments(&self, collection_id: UniqueId) -> Vec<SegmentLoadInfo> {
        self.catalog
            .read()
            .await
            .excluded_segments
            .get(&collection_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn remove_excluded_segments(&self, collection_id: UniqueId) {
        self.catalog.write().await.excluded_segments.remove(&collection_id);
    }

    /// Stamps the collection's release time. Must be called while holding
    /// the write side of the query lock (§4.2.5): "record the request
    /// timestamp as the collection's release-time" happens before the lock
    /// is released.
    pub async fn set_release_time(&self, id: UniqueId, ts: Timestamp) -> Result<()> {
        self.mutate_collection(id, |c| c.release_time = ts).await
    }

    pub async fn query_read(&self) -> RwLockReadGuard<'_, ()> {
        self.query_lock.read().await
    }

    pub async fn query_write(&self) -> RwLockWriteGuard<'_, ()> {
        self.query_lock.write().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DmlPosition;

    fn schema() -> CollectionSchema {
        CollectionSchema {
            name: "test".into(),
            field_names: vec!["id".into(), "vector".into()],
        }
    }

    #[tokio::test]
    async fn add_collection_is_idempotent() {
        let reg = ReplicaRegistry::new(ReplicaKind::Streaming);
        reg.add_collection(1, schema()).await;
        reg.mutate_collection(1, |c| c.release_time = 42).await.unwrap();
        reg.add_collection(1, schema()).await;
        assert_eq!(reg.get_collection(1).await.unwrap().release_time, 42);
    }

    #[tokio::test]
    async fn partitions_are_tracked_independently_of_collection() {
        let reg = ReplicaRegistry::new(ReplicaKind::Historical);
        reg.add_partition(5, 1).await;
        assert!(reg.has_partition(5, 1).await);
        assert!(!reg.has_partition(5, 2).await);
        assert!(reg.remove_partition(5, 1).await);
        assert!(!reg.has_partition(5, 1).await);
        // removing again is tolerated
        assert!(!reg.remove_partition(5, 1).await);
    }

    #[tokio::test]
    async fn double_remove_segment_is_a_no_op() {
        let reg = ReplicaRegistry::new(ReplicaKind::Streaming);
        reg.add_growing_segment(1, 7).await;
        assert!(reg.has_growing_segment(7).await);
        reg.remove_segment(7).await;
        reg.remove_segment(7).await;
        assert!(!reg.has_growing_segment(7).await);
    }

    #[tokio::test]
    async fn remove_collection_clears_everything_that_release_does_not_handle_separately() {
        let reg = ReplicaRegistry::new(ReplicaKind::Streaming);
        reg.add_collection(1, schema()).await;
        reg.add_partition(1, 9).await;
        reg.add_growing_segment(1, 7).await;
        reg.remove_collection(1).await;
        assert!(!reg.has_collection(1).await);
        assert!(!reg.has_partition(1, 9).await);
        assert!(!reg.has_growing_segment(7).await);
    }

    #[tokio::test]
    async fn excluded_segments_accumulate_per_collection() {
        let reg = ReplicaRegistry::new(ReplicaKind::Streaming);
        let info = SegmentLoadInfo {
            segment_id: 7,
            partition_id: 1,
            collection_id: 100,
            binlog_paths: vec!["a".into()],
            statslog_paths: vec![],
            deltalog_paths: vec![],
            num_of_rows: 10,
            dml_position: Some(DmlPosition {
                channel_name: "c0".into(),
                timestamp: 100,
            }),
        };
        reg.add_excluded_segments(100, vec![info.clone()]).await;
        assert_eq!(reg.excluded_segments(100).await, vec![info]);
        reg.remove_excluded_segments(100).await;
        assert!(reg.excluded_segments(100).await.is_empty());
    }
}
