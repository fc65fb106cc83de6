//! `ReleaseCollectionTask` (§4.2.5): detaches a collection from both
//! replicas, after a graceful delay that gives in-flight reads a chance to
//! drain. Release completeness (§8) requires that nothing named by the
//! collection survives in either replica once this returns.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, instrument};

use crate::error::Result;
use crate::model::{Timestamp, UniqueId};
use crate::replica::ReplicaRegistry;
use crate::task::{timestamp, Task, TaskContext, TaskId};
use crate::NodeContext;

pub struct ReleaseCollectionTask {
    ctx: Arc<NodeContext>,
    id: TaskId,
    base_msg_id: Option<TaskId>,
    base_timestamp: Option<Timestamp>,
    pub collection_id: UniqueId,
}

impl ReleaseCollectionTask {
    pub fn new(
        ctx: Arc<NodeContext>,
        base_msg_id: Option<TaskId>,
        base_timestamp: Option<Timestamp>,
        collection_id: UniqueId,
    ) -> Self {
        ReleaseCollectionTask {
            ctx,
            id: 0,
            base_msg_id,
            base_timestamp,
            collection_id,
        }
    }
}

#[async_trait]
impl Task for ReleaseCollectionTask {
    fn kind(&self) -> &'static str {
        "release_collection"
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
        let release_ts = timestamp(self);

        // Let in-flight reads drain before touching either replica.
        tokio::time::sleep(node.config.graceful_release).await;
        ctx.check()?;

        release_from(&node.streaming, cid, release_ts, &node.tsafe, &node.flow_graphs, false).await?;
        release_from(&node.historical, cid, release_ts, &node.tsafe, &node.flow_graphs, true).await?;

        node.shard_clusters.remove_for_collection(cid);
        node.query_shards.release_collection(cid);

        // "Return OS-level memory" has no portable cross-platform
        // equivalent at this layer; logged so the boundary is visible
        // rather than silently absent (see `DESIGN.md`).
        info!(collection_id = cid, "collection released, memory reclaim is OS-managed");

        Ok(())
    }
}

/// Releases one replica's half of a collection: flow-graphs, tSafe entries,
/// the excluded-segment set, then the collection entry itself. Acquires the
/// query write-lock only around recording the release time, per
/// `ReplicaRegistry::set_release_time`'s contract.
async fn release_from(
    replica: &ReplicaRegistry,
    cid: UniqueId,
    release_ts: Timestamp,
    tsafe: &crate::tsafe::TSafeReplica,
    flow_graphs: &crate::flow_graph::FlowGraphService,
    is_historical: bool,
) -> Result<()> {
    {
        let _guard = replica.query_write().await;
        if !replica.has_collection(cid).await {
            return Err(crate::error::QueryNodeError::collection_not_found(cid));
        }
        replica.set_release_time(cid, release_ts).await?;
    }

    let collection = replica.get_collection(cid).await.expect("checked above under lock");
    let channels = if is_historical {
        collection.vdelta_channels.clone()
    } else {
        collection.vchannels.clone()
    };

    if is_historical {
        flow_graphs.remove_by_delta_channels(&channels).await;
    } else {
        flow_graphs.remove_by_dml_channels(&channels).await;
    }
    for v in &channels {
        tsafe.remove_tsafe(v);
    }

    replica.remove_excluded_segments(cid).await;
    replica.remove_collection(cid).await;

    Ok(())
}
