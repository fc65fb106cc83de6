//! `ReleasePartitionsTask` (§4.2.6): releases specific partitions from a
//! collection without detaching its channels. An unknown partition-id is a
//! warning, not a failure (§8 boundary behavior).

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{instrument, warn};

use crate::error::{QueryNodeError, Result};
use crate::model::{Timestamp, UniqueId};
use crate::task::{Task, TaskContext, TaskId};
use crate::NodeContext;

pub struct ReleasePartitionsTask {
    ctx: Arc<NodeContext>,
    id: TaskId,
    base_msg_id: Option<TaskId>,
    base_timestamp: Option<Timestamp>,
    pub collection_id: UniqueId,
    pub partition_ids: Vec<UniqueId>,
}

impl ReleasePartitionsTask {
    pub fn new(
        ctx: Arc<NodeContext>,
        base_msg_id: Option<TaskId>,
        base_timestamp: Option<Timestamp>,
        collection_id: UniqueId,
        partition_ids: Vec<UniqueId>,
    ) -> Self {
        ReleasePartitionsTask {
            ctx,
            id: 0,
            base_msg_id,
            base_timestamp,
            collection_id,
            partition_ids,
        }
    }
}

#[async_trait]
impl Task for ReleasePartitionsTask {
    fn kind(&self) -> &'static str {
        "release_partitions"
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

        tokio::time::sleep(node.config.graceful_release).await;
        ctx.check()?;

        if !node.historical.has_collection(cid).await || !node.streaming.has_collection(cid).await {
            return Err(QueryNodeError::collection_not_found(cid));
        }

        for pid in &self.partition_ids {
            // Historical first, then streaming; neither removal's absence
            // aborts the task (§4.2.6 "logs a warning and continues").
            if !node.historical.remove_partition(cid, *pid).await {
                warn!(collection_id = cid, partition_id = pid, "partition not present in historical replica");
            }
            if !node.streaming.remove_partition(cid, *pid).await {
                warn!(collection_id = cid, partition_id = pid, "partition not present in streaming replica");
            }
        }

        Ok(())
    }
}
