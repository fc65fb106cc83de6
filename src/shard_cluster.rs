//! Per-(collection, replica, vchannel) shard-cluster registry (§4.1 table,
//! §3 ShardCluster). Opaque to this spec beyond lifecycle, so the registry
//! is a thin, synchronous map — grounded on the same `channel_map: Mutex<
//! HashMap<..>>` shape as the teacher's `SharedContext`, but using
//! `parking_lot::RwLock` since, unlike `FlowGraphService`, no collaborator
//! I/O ever happens while this lock is held.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::model::UniqueId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ShardClusterKey {
    pub collection_id: UniqueId,
    pub replica_id: UniqueId,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShardCluster {
    pub collection_id: UniqueId,
    pub replica_id: UniqueId,
    pub vchannel: String,
}

#[derive(Default)]
pub struct ShardClusterService {
    clusters: RwLock<HashMap<(ShardClusterKey, String), ShardCluster>>,
}

impl ShardClusterService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, collection_id: UniqueId, replica_id: UniqueId, vchannel: &str) {
        let key = ShardClusterKey {
            collection_id,
            replica_id,
        };
        self.clusters.write().insert(
            (key, vchannel.to_string()),
            ShardCluster {
                collection_id,
                replica_id,
                vchannel: vchannel.to_string(),
            },
        );
    }

    pub fn has(&self, collection_id: UniqueId, replica_id: UniqueId, vchannel: &str) -> bool {
        let key = ShardClusterKey {
            collection_id,
            replica_id,
        };
        self.clusters.read().contains_key(&(key, vchannel.to_string()))
    }

    pub fn remove_for_collection(&self, collection_id: UniqueId) {
        self.clusters
            .write()
            .retain(|(key, _), _| key.collection_id != collection_id);
    }

    pub fn count(&self) -> usize {
        self.clusters.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_remove() {
        let svc = ShardClusterService::new();
        svc.register(1, 0, "c0");
        svc.register(1, 0, "c1");
        assert!(svc.has(1, 0, "c0"));
        assert_eq!(svc.count(), 2);
        svc.remove_for_collection(1);
        assert_eq!(svc.count(), 0);
    }
}
