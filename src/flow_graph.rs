//! Registers and removes DML/Delta flow-graphs, and exposes per-graph
//! consume/seek control (§4.4).
//!
//! Grounded on the teacher's `SharedContext` (`stream/src/task/mod.rs`):
//! exclusive creation into a shared map (`add_channel_pairs` asserts no
//! double-insert), concurrent reads otherwise. The DAG execution itself is
//! out of scope (§1); [`FlowGraph`] is the seam, and [`InMemoryFlowGraph`]
//! is the test fake, grounded on `connector/src/source/dummy_connector.rs`'s
//! `DummySplitReader` placeholder.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{info, instrument};

use crate::error::{QueryNodeError, Result};
use crate::model::{Position, UniqueId};

/// One DAG pipeline consuming a channel and applying updates to a replica.
/// DAG execution itself is an external collaborator; this crate only needs
/// its lifecycle.
#[async_trait]
pub trait FlowGraph: Send + Sync {
    async fn consume_from_latest(&self, physical_channel: &str, sub_name: &str) -> Result<()>;
    async fn seek(&self, position: Position) -> Result<()>;
    async fn start(&self) -> Result<()>;
    async fn close(&self);
}

/// Builds a fresh, unstarted [`FlowGraph`] for one vchannel. Production code
/// backs this with the real DAG engine; tests use
/// [`InMemoryFlowGraphFactory`].
pub trait FlowGraphFactory: Send + Sync {
    fn create(&self, collection_id: UniqueId, vchannel: &str) -> Arc<dyn FlowGraph>;
}

#[derive(Default)]
pub struct FlowGraphService {
    factory: Option<Arc<dyn FlowGraphFactory>>,
    dml: RwLock<HashMap<String, Arc<dyn FlowGraph>>>,
    delta: RwLock<HashMap<String, Arc<dyn FlowGraph>>>,
}

impl FlowGraphService {
    pub fn new(factory: Arc<dyn FlowGraphFactory>) -> Self {
        FlowGraphService {
            factory: Some(factory),
            dml: RwLock::new(HashMap::new()),
            delta: RwLock::new(HashMap::new()),
        }
    }

    #[instrument(skip(self), fields(collection_id))]
    pub async fn add_dml_channels(
        &self,
        collection_id: UniqueId,
        vchannels: &[String],
    ) -> Result<HashMap<String, Arc<dyn FlowGraph>>> {
        self.add_channels(&self.dml, collection_id, vchannels).await
    }

    #[instrument(skip(self), fields(collection_id))]
    pub async fn add_delta_channels(
        &self,
        collection_id: UniqueId,
        vchannels: &[String],
    ) -> Result<HashMap<String, Arc<dyn FlowGraph>>> {
        self.add_channels(&self.delta, collection_id, vchannels).await
    }

    async fn add_channels(
        &self,
        target: &RwLock<HashMap<String, Arc<dyn FlowGraph>>>,
        collection_id: UniqueId,
        vchannels: &[String],
    ) -> Result<HashMap<String, Arc<dyn FlowGraph>>> {
        let factory = self
            .factory
            .as_ref()
            .ok_or_else(|| QueryNodeError::Internal("flow graph factory not configured".into()))?;
        let mut guard = target.write().await;

        // Check the whole batch for collisions, against both the live map
        // and duplicates within the batch itself, before creating or
        // inserting anything. A batch that fails partway through must never
        // leave an earlier vchannel in this call committed to `guard` with
        // no `created` entry to roll it back (SPEC_FULL.md's "no partial
        // flow-graphs" invariant).
        let mut seen = std::collections::HashSet::with_capacity(vchannels.len());
        for vchannel in vchannels {
            if guard.contains_key(vchannel) || !seen.insert(vchannel) {
                return Err(QueryNodeError::Internal(format!(
                    "flow graph already exists for {vchannel}"
                )));
            }
        }

        let mut created = HashMap::with_capacity(vchannels.len());
        for vchannel in vchannels {
            let graph = factory.create(collection_id, vchannel);
            guard.insert(vchannel.clone(), graph.clone());
            created.insert(vchannel.clone(), graph);
        }
        info!(collection_id, count = created.len(), "flow graphs registered");
        Ok(created)
    }

    pub async fn remove_by_dml_channels(&self, vchannels: &[String]) {
        let mut guard = self.dml.write().await;
        for v in vchannels {
            guard.remove(v);
        }
    }

    pub async fn remove_by_delta_channels(&self, vchannels: &[String]) {
        let mut guard = self.delta.write().await;
        for v in vchannels {
            guard.remove(v);
        }
    }

    pub async fn has_dml_graph(&self, vchannel: &str) -> bool {
        self.dml.read().await.contains_key(vchannel)
    }

    pub async fn has_delta_graph(&self, vchannel: &str) -> bool {
        self.delta.read().await.contains_key(vchannel)
    }

    pub async fn dml_graph_count(&self) -> usize {
        self.dml.read().await.len()
    }

    pub async fn delta_graph_count(&self) -> usize {
        self.delta.read().await.len()
    }
}

/// Closes and removes every flow graph in `created`, in that order, per the
/// rollback steps of §4.2.2 stage 10 / §4.2.3. Best-effort: close errors are
/// not possible by contract (`close` returns `()`), so this never fails.
pub async fn rollback_flow_graphs(
    service: &FlowGraphService,
    created: &HashMap<String, Arc<dyn FlowGraph>>,
    is_delta: bool,
) {
    for graph in created.values() {
        graph.close().await;
    }
    let vchannels: Vec<String> = created.keys().cloned().collect();
    if is_delta {
        service.remove_by_delta_channels(&vchannels).await;
    } else {
        service.remove_by_dml_channels(&vchannels).await;
    }
}

/// Test/demo [`FlowGraph`] that records the calls made to it and can be
/// told to fail its next `seek`/`consume_from_latest` call, standing in for
/// a real bus outage.
pub struct InMemoryFlowGraph {
    pub vchannel: String,
    fail_attach: std::sync::atomic::AtomicBool,
    state: tokio::sync::Mutex<InMemoryFlowGraphState>,
}

#[derive(Default)]
struct InMemoryFlowGraphState {
    attached: Option<AttachMode>,
    started: bool,
    closed: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AttachMode {
    FromLatest { physical_channel: String, sub_name: String },
    Seek(Position),
}

impl InMemoryFlowGraph {
    pub fn new(vchannel: impl Into<String>) -> Self {
        InMemoryFlowGraph {
            vchannel: vchannel.into(),
            fail_attach: std::sync::atomic::AtomicBool::new(false),
            state: tokio::sync::Mutex::new(InMemoryFlowGraphState::default()),
        }
    }

    pub fn failing(vchannel: impl Into<String>) -> Self {
        let graph = Self::new(vchannel);
        graph
            .fail_attach
            .store(true, std::sync::atomic::Ordering::SeqCst);
        graph
    }

    pub async fn attach_mode(&self) -> Option<AttachMode> {
        self.state.lock().await.attached.clone()
    }

    pub async fn is_started(&self) -> bool {
        self.state.lock().await.started
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }
}

#[async_trait]
impl FlowGraph for InMemoryFlowGraph {
    async fn consume_from_latest(&self, physical_channel: &str, sub_name: &str) -> Result<()> {
        if self.fail_attach.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(QueryNodeError::Collaborator(format!(
                "bus consume failed for {physical_channel}"
            )));
        }
        let mut state = self.state.lock().await;
        state.attached = Some(AttachMode::FromLatest {
            physical_channel: physical_channel.to_string(),
            sub_name: sub_name.to_string(),
        });
        Ok(())
    }

    async fn seek(&self, position: Position) -> Result<()> {
        if self.fail_attach.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(QueryNodeError::Collaborator(format!(
                "bus seek failed for {}",
                position.channel_name
            )));
        }
        let mut state = self.state.lock().await;
        state.attached = Some(AttachMode::Seek(position));
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        self.state.lock().await.started = true;
        Ok(())
    }

    async fn close(&self) {
        self.state.lock().await.closed = true;
    }
}

/// Creates [`InMemoryFlowGraph`]s; `failing_vchannels` names channels whose
/// graph should fail its first attach call, for rollback tests.
#[derive(Default)]
pub struct InMemoryFlowGraphFactory {
    failing_vchannels: std::collections::HashSet<String>,
}

impl InMemoryFlowGraphFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failing(mut self, vchannel: impl Into<String>) -> Self {
        self.failing_vchannels.insert(vchannel.into());
        self
    }
}

impl FlowGraphFactory for InMemoryFlowGraphFactory {
    fn create(&self, _collection_id: UniqueId, vchannel: &str) -> Arc<dyn FlowGraph> {
        if self.failing_vchannels.contains(vchannel) {
            Arc::new(InMemoryFlowGraph::failing(vchannel))
        } else {
            Arc::new(InMemoryFlowGraph::new(vchannel))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> FlowGraphService {
        FlowGraphService::new(Arc::new(InMemoryFlowGraphFactory::new()))
    }

    #[tokio::test]
    async fn add_then_remove_dml_channels() {
        let svc = service();
        let created = svc
            .add_dml_channels(1, &["c0".to_string(), "c1".to_string()])
            .await
            .unwrap();
        assert_eq!(created.len(), 2);
        assert!(svc.has_dml_graph("c0").await);
        svc.remove_by_dml_channels(&["c0".to_string()]).await;
        assert!(!svc.has_dml_graph("c0").await);
        assert!(svc.has_dml_graph("c1").await);
    }

    #[tokio::test]
    async fn duplicate_vchannel_registration_fails() {
        let svc = service();
        svc.add_dml_channels(1, &["c0".to_string()]).await.unwrap();
        assert!(svc.add_dml_channels(1, &["c0".to_string()]).await.is_err());
    }

    #[tokio::test]
    async fn rollback_closes_and_removes() {
        let svc = service();
        let created = svc
            .add_dml_channels(1, &["c0".to_string()])
            .await
            .unwrap();
        rollback_flow_graphs(&svc, &created, false).await;
        assert_eq!(svc.dml_graph_count().await, 0);
    }
}
