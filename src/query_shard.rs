//! Per-DML-channel query shards, and the per-collection query-response
//! channel handle `AddQueryChannelTask` subscribes on the bus (§4.1 table,
//! §4.5, §4.2.1).
//!
//! Grounded on the same registry shape as [`crate::shard_cluster`], with one
//! addition: [`QueryShard::watch_dml_tsafe`]/`watch_delta_tsafe` are async
//! because attaching a tSafe watch is itself a collaborator call whose
//! failure is logged but non-fatal (§7 kind 4) — the `Fn`-hook injection
//! point here plays the same placeholder role
//! `connector/src/source/dummy_connector.rs`'s `DummySplitReader` plays for
//! a real bus client.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::{QueryNodeError, Result};
use crate::model::{Position, UniqueId};

/// Lifecycle of a bus consumer used for the query-response channel: attach
/// (either from-latest or seek) then start. Kept distinct from
/// [`crate::flow_graph::FlowGraph`] since a query channel carries no DAG.
#[async_trait]
pub trait BusConsumer: Send + Sync {
    async fn as_consumer(&self, physical_channel: &str, sub_name: &str, position: Option<Position>) -> Result<()>;
    async fn start(&self) -> Result<()>;
}

pub trait BusConsumerFactory: Send + Sync {
    fn create(&self, collection_id: UniqueId) -> Arc<dyn BusConsumer>;
}

pub struct InMemoryBusConsumer {
    attached: Mutex<bool>,
    started: AtomicBool,
}

impl Default for InMemoryBusConsumer {
    fn default() -> Self {
        InMemoryBusConsumer {
            attached: Mutex::new(false),
            started: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl BusConsumer for InMemoryBusConsumer {
    async fn as_consumer(&self, _physical_channel: &str, _sub_name: &str, _position: Option<Position>) -> Result<()> {
        *self.attached.lock().await = true;
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryBusConsumerFactory;

impl BusConsumerFactory for InMemoryBusConsumerFactory {
    fn create(&self, _collection_id: UniqueId) -> Arc<dyn BusConsumer> {
        Arc::new(InMemoryBusConsumer::default())
    }
}

/// A per-(collection-id, dml-vchannel, replica-id) read handler owning its
/// DML and Delta tSafe watches (§3 QueryShard).
pub struct QueryShard {
    pub collection_id: UniqueId,
    pub dml_channel: String,
    pub replica_id: UniqueId,
    dml_watched: AtomicBool,
    delta_watched: AtomicBool,
    watch_hook: Option<Arc<dyn Fn() -> Result<()> + Send + Sync>>,
}

impl QueryShard {
    fn new(
        collection_id: UniqueId,
        dml_channel: String,
        replica_id: UniqueId,
        watch_hook: Option<Arc<dyn Fn() -> Result<()> + Send + Sync>>,
    ) -> Self {
        QueryShard {
            collection_id,
            dml_channel,
            replica_id,
            dml_watched: AtomicBool::new(false),
            delta_watched: AtomicBool::new(false),
            watch_hook,
        }
    }

    /// Attaches the DML tSafe watch. Per §4.2.2 stage 13, failures here are
    /// logged, never surfaced as the task's error.
    pub async fn watch_dml_tsafe(&self) {
        match self.try_watch() {
            Ok(()) => self.dml_watched.store(true, Ordering::SeqCst),
            Err(e) => warn!(channel = %self.dml_channel, error = %e, "dml tsafe watch failed, continuing"),
        }
    }

    /// Attaches the Delta tSafe watch (§4.2.3), same non-fatal contract.
    pub async fn watch_delta_tsafe(&self) {
        match self.try_watch() {
            Ok(()) => self.delta_watched.store(true, Ordering::SeqCst),
            Err(e) => warn!(channel = %self.dml_channel, error = %e, "delta tsafe watch failed, continuing"),
        }
    }

    fn try_watch(&self) -> Result<()> {
        match &self.watch_hook {
            Some(hook) => hook(),
            None => Ok(()),
        }
    }

    pub fn has_dml_watch(&self) -> bool {
        self.dml_watched.load(Ordering::SeqCst)
    }

    pub fn has_delta_watch(&self) -> bool {
        self.delta_watched.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub struct QueryShardService {
    channel_factory: Option<Arc<dyn BusConsumerFactory>>,
    query_channels: RwLock<HashMap<UniqueId, Arc<dyn BusConsumer>>>,
    shards: RwLock<HashMap<String, Arc<QueryShard>>>,
    watch_hook: Option<Arc<dyn Fn() -> Result<()> + Send + Sync>>,
}

impl QueryShardService {
    pub fn new(channel_factory: Arc<dyn BusConsumerFactory>) -> Self {
        QueryShardService {
            channel_factory: Some(channel_factory),
            query_channels: RwLock::new(HashMap::new()),
            shards: RwLock::new(HashMap::new()),
            watch_hook: None,
        }
    }

    /// Injects a hook every subsequently-created shard's watch calls run,
    /// for exercising the non-fatal-failure path in tests.
    pub fn with_watch_hook(mut self, hook: Arc<dyn Fn() -> Result<()> + Send + Sync>) -> Self {
        self.watch_hook = Some(hook);
        self
    }

    /// Idempotent: returns the existing channel handle for `collection_id`
    /// if one was already created.
    pub fn get_query_channel(&self, collection_id: UniqueId) -> Result<Arc<dyn BusConsumer>> {
        if let Some(existing) = self.query_channels.read().get(&collection_id) {
            return Ok(existing.clone());
        }
        let factory = self
            .channel_factory
            .as_ref()
            .ok_or_else(|| QueryNodeError::Internal("query channel factory not configured".into()))?;
        let handle = factory.create(collection_id);
        self.query_channels.write().insert(collection_id, handle.clone());
        Ok(handle)
    }

    pub fn has_query_shard(&self, dml_channel: &str) -> bool {
        self.shards.read().contains_key(dml_channel)
    }

    pub fn get_query_shard(&self, dml_channel: &str) -> Option<Arc<QueryShard>> {
        self.shards.read().get(dml_channel).cloned()
    }

    /// Creates a shard if missing, with `replica_id`. Returns the existing
    /// or newly-created shard (§4.2.2 stage 13).
    pub fn ensure_query_shard(
        &self,
        collection_id: UniqueId,
        dml_channel: &str,
        replica_id: UniqueId,
    ) -> Arc<QueryShard> {
        if let Some(existing) = self.shards.read().get(dml_channel) {
            return existing.clone();
        }
        let shard = Arc::new(QueryShard::new(
            collection_id,
            dml_channel.to_string(),
            replica_id,
            self.watch_hook.clone(),
        ));
        self.shards
            .write()
            .insert(dml_channel.to_string(), shard.clone());
        shard
    }

    pub fn release_collection(&self, collection_id: UniqueId) {
        self.query_channels.write().remove(&collection_id);
        self.shards
            .write()
            .retain(|_, shard| shard.collection_id != collection_id);
    }

    pub fn shard_count(&self) -> usize {
        self.shards.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::QueryNodeError;

    fn service() -> QueryShardService {
        QueryShardService::new(Arc::new(InMemoryBusConsumerFactory))
    }

    #[test]
    fn ensure_query_shard_is_idempotent() {
        let svc = service();
        let a = svc.ensure_query_shard(1, "c0", 0);
        let b = svc.ensure_query_shard(1, "c0", 0);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(svc.shard_count(), 1);
    }

    #[test]
    fn release_collection_clears_shards_and_channel() {
        let svc = service();
        svc.ensure_query_shard(1, "c0", 0);
        svc.get_query_channel(1).unwrap();
        svc.release_collection(1);
        assert_eq!(svc.shard_count(), 0);
        assert!(svc.query_channels.read().is_empty());
    }

    #[tokio::test]
    async fn watch_failure_is_logged_not_surfaced() {
        let svc = service().with_watch_hook(Arc::new(|| {
            Err(QueryNodeError::Collaborator("watch down".into()))
        }));
        let shard = svc.ensure_query_shard(1, "c0", 0);
        shard.watch_dml_tsafe().await;
        assert!(!shard.has_dml_watch());
    }
}
