//! `AddQueryChannelTask` (§4.2.1): attaches the query-shard service to the
//! coordinator-named query response channel for a collection.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::instrument;

use crate::channel::{physical, sub_name};
use crate::error::Result;
use crate::model::{Position, Timestamp, UniqueId};
use crate::task::{Task, TaskContext, TaskId};
use crate::NodeContext;

pub struct AddQueryChannelTask {
    ctx: Arc<NodeContext>,
    id: TaskId,
    base_msg_id: Option<TaskId>,
    base_timestamp: Option<Timestamp>,
    pub collection_id: UniqueId,
    pub query_channel: String,
    pub seek_position: Position,
}

impl AddQueryChannelTask {
    pub fn new(
        ctx: Arc<NodeContext>,
        base_msg_id: Option<TaskId>,
        base_timestamp: Option<Timestamp>,
        collection_id: UniqueId,
        query_channel: impl Into<String>,
        seek_position: Position,
    ) -> Self {
        AddQueryChannelTask {
            ctx,
            id: 0,
            base_msg_id,
            base_timestamp,
            collection_id,
            query_channel: query_channel.into(),
            seek_position,
        }
    }
}

#[async_trait]
impl Task for AddQueryChannelTask {
    fn kind(&self) -> &'static str {
        "add_query_channel"
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
        ctx.check()?;

        let consumer = self.ctx.query_shards.get_query_channel(self.collection_id)?;
        let sub = sub_name(
            &self.ctx.config.sub_name_prefix,
            self.collection_id,
            self.ctx.config.node_id,
        );
        let physical_channel = physical(&self.query_channel);
        let position = if self.seek_position.is_consume_latest() {
            None
        } else {
            Some(self.seek_position.clone())
        };

        // AsConsumer errors abort and surface (§4.2.1 "Failure").
        consumer.as_consumer(&physical_channel, &sub, position).await?;
        consumer.start().await?;
        Ok(())
    }
}
