//! `LoadSegmentsTask` (§4.2.4): loads sealed segments into the historical
//! replica. Idempotent in the face of repeated requests for the same
//! partitions (§8 "LoadSegments idempotence").

use std::sync::Arc;

use async_trait::async_trait;
use tracing::instrument;

use crate::error::Result;
use crate::model::{CollectionSchema, SegmentLoadInfo, Timestamp, UniqueId};
use crate::segment_loader::LoadMode;
use crate::task::{Task, TaskContext, TaskId};
use crate::NodeContext;

pub struct LoadSegmentsTask {
    ctx: Arc<NodeContext>,
    id: TaskId,
    base_msg_id: Option<TaskId>,
    base_timestamp: Option<Timestamp>,
    pub collection_id: UniqueId,
    pub schema: CollectionSchema,
    pub partition_ids: Vec<UniqueId>,
    pub infos: Vec<SegmentLoadInfo>,
}

impl LoadSegmentsTask {
    pub fn new(
        ctx: Arc<NodeContext>,
        base_msg_id: Option<TaskId>,
        base_timestamp: Option<Timestamp>,
        collection_id: UniqueId,
        schema: CollectionSchema,
        partition_ids: Vec<UniqueId>,
        infos: Vec<SegmentLoadInfo>,
    ) -> Self {
        LoadSegmentsTask {
            ctx,
            id: 0,
            base_msg_id,
            base_timestamp,
            collection_id,
            schema,
            partition_ids,
            infos,
        }
    }
}

#[async_trait]
impl Task for LoadSegmentsTask {
    fn kind(&self) -> &'static str {
        "load_segments"
    }

    fn id(&self) -> TaskId {
        self.id
    }

    fn set_id(&mut self, id: TaskId) {
        self.id = id;
    }

    fn base_msg_id(&self) -> Option<TaskId> {
        self.base_msg_id
    }

    fn base_timestamp(&self) -> Option<Timestamp> {
        self.base_timestamp
    }

    #[instrument(skip(self, ctx), fields(collection_id = self.collection_id))]
    async fn execute(&mut self, ctx: &TaskContext) -> Result<()> {
        let node = &self.ctx;
        let cid = self.collection_id;

        // Idempotent: both `add_collection` and `add_partition` are no-ops
        // on an existing entry (§8 "LoadSegments idempotence"). Added to
        // both replicas (§4.2.4), even though only the historical replica
        // ends up holding the sealed segments themselves.
        node.streaming.add_collection(cid, self.schema.clone()).await;
        node.historical.add_collection(cid, self.schema.clone()).await;

        ctx.check()?;

        for pid in &self.partition_ids {
            node.streaming.add_partition(cid, *pid).await;
            node.historical.add_partition(cid, *pid).await;
        }

        if !self.infos.is_empty() {
            node.segment_loader
                .load_segment(&self.infos, LoadMode::Sealed)
                .await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NodeConfig, QueryNodeOpts};
    use crate::flow_graph::{FlowGraphService, InMemoryFlowGraphFactory};
    use crate::query_shard::{InMemoryBusConsumerFactory, QueryShardService};
    use crate::segment_loader::InMemorySegmentLoader;
    use crate::task::on_enqueue;

    fn node_ctx() -> Arc<NodeContext> {
        Arc::new(NodeContext::new(
            NodeConfig::from_sources(&QueryNodeOpts::default()).unwrap(),
            Arc::new(InMemorySegmentLoader::new()),
            Arc::new(FlowGraphService::new(Arc::new(InMemoryFlowGraphFactory::new()))),
            Arc::new(QueryShardService::new(Arc::new(InMemoryBusConsumerFactory))),
        ))
    }

    fn seg(id: UniqueId, partition_id: UniqueId) -> SegmentLoadInfo {
        SegmentLoadInfo {
            segment_id: id,
            partition_id,
            collection_id: 100,
            binlog_paths: vec!["a".into()],
            statslog_paths: vec![],
            deltalog_paths: vec![],
            num_of_rows: 10,
            dml_position: None,
        }
    }

    #[tokio::test]
    async fn repeated_load_of_same_partitions_is_idempotent() {
        let ctx = node_ctx();
        for _ in 0..2 {
            let mut task = LoadSegmentsTask::new(
                ctx.clone(),
                Some(1),
                Some(500),
                100,
                CollectionSchema::default(),
                vec![1, 2],
                vec![seg(10, 1), seg(11, 2)],
            );
            on_enqueue(&mut task);
            task.execute(&TaskContext::default()).await.unwrap();
        }

        assert!(ctx.historical.has_partition(100, 1).await);
        assert!(ctx.historical.has_partition(100, 2).await);

        // The loader itself tolerates being asked to load the same segment
        // ids twice; no duplication or error at the collaborator level.
        let recording = InMemorySegmentLoader::new();
        recording.load_segment(&[seg(10, 1), seg(11, 2)], LoadMode::Sealed).await.unwrap();
        recording.load_segment(&[seg(10, 1), seg(11, 2)], LoadMode::Sealed).await.unwrap();
        assert_eq!(recording.sealed_segments().len(), 2);
    }
}
