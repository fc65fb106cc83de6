//! `WatchDeltaChannelsTask` (§4.2.3): attaches Delta channels for a
//! collection that must already be watching DML channels. Mirrors
//! `WatchDmChannelsTask`'s rollback shape but is simpler: every delta
//! flow-graph consumes from latest, and deletes are replayed from the DML
//! checkpoint rather than loaded as growing segments.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{instrument, warn};

use crate::channel::{dml_of, physical, sub_name};
use crate::error::{QueryNodeError, Result};
use crate::flow_graph::rollback_flow_graphs;
use crate::model::{Collection, Position, Timestamp, UniqueId};
use crate::task::{Task, TaskContext, TaskId};
use crate::NodeContext;

/// One `Infos[]` entry of the `WatchDeltaChannels` request body (§6).
#[derive(Clone, Debug, Default)]
pub struct DeltaChannelInfo {
    pub channel_name: String,
    pub seek_position: Position,
}

pub struct WatchDeltaChannelsTask {
    ctx: Arc<NodeContext>,
    id: TaskId,
    base_msg_id: Option<TaskId>,
    base_timestamp: Option<Timestamp>,
    pub collection_id: UniqueId,
    pub replica_id: UniqueId,
    pub infos: Vec<DeltaChannelInfo>,
}

impl WatchDeltaChannelsTask {
    pub fn new(
        ctx: Arc<NodeContext>,
        base_msg_id: Option<TaskId>,
        base_timestamp: Option<Timestamp>,
        collection_id: UniqueId,
        replica_id: UniqueId,
        infos: Vec<DeltaChannelInfo>,
    ) -> Self {
        WatchDeltaChannelsTask {
            ctx,
            id: 0,
            base_msg_id,
            base_timestamp,
            collection_id,
            replica_id,
            infos,
        }
    }
}

#[async_trait]
impl Task for WatchDeltaChannelsTask {
    fn kind(&self) -> &'static str {
        "watch_delta_channels"
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

        // The collection must already exist: WatchDeltaChannels never
        // creates one (§4.2.3 precondition; end-to-end scenario 4).
        if !node.streaming.has_collection(cid).await {
            return Err(QueryNodeError::collection_not_found(cid));
        }

        let vchannels: Vec<String> = self.infos.iter().map(|i| i.channel_name.clone()).collect();
        let pchannels: Vec<String> = vchannels.iter().map(|v| physical(v)).collect();

        ctx.check()?;

        // Every delta flow-graph consumes from latest (§4.2.3: "unlike DML
        // channels, delta channels are never seeked to a position").
        let sub = sub_name(&node.config.sub_name_prefix, cid, node.config.node_id);
        let positions: HashMap<String, Position> = self
            .infos
            .iter()
            .map(|i| (i.channel_name.clone(), i.seek_position.clone()))
            .collect();

        // Rollback boundary: any failure from here on closes and removes
        // every delta flow-graph created below.
        let created = node.flow_graphs.add_delta_channels(cid, &vchannels).await?;
        let result = self
            .attach_and_start(ctx, cid, &created, &vchannels, &pchannels, &sub, &positions)
            .await;
        if let Err(e) = result {
            rollback_flow_graphs(&node.flow_graphs, &created, true).await;
            return Err(e);
        }
        Ok(())
    }
}

impl WatchDeltaChannelsTask {
    #[allow(clippy::too_many_arguments)]
    async fn attach_and_start(
        &self,
        ctx: &TaskContext,
        cid: UniqueId,
        created: &HashMap<String, Arc<dyn crate::flow_graph::FlowGraph>>,
        vchannels: &[String],
        pchannels: &[String],
        sub: &str,
        positions: &HashMap<String, Position>,
    ) -> Result<()> {
        let node = &self.ctx;

        for v in vchannels {
            let graph = created.get(v).expect("just created");
            let p = physical(v);
            graph.consume_from_latest(&p, sub).await?;
        }

        // Replays deletes up to the DML checkpoint, once every delta
        // channel has successfully attached (§4.2.3).
        node.segment_loader
            .from_dml_cp_load_delete(cid, positions)
            .await?;

        ctx.check()?;

        node.streaming
            .mutate_collection(cid, |c: &mut Collection| {
                c.add_delta_channels(vchannels, pchannels);
            })
            .await?;
        node.historical
            .mutate_collection(cid, |c: &mut Collection| {
                c.add_delta_channels(vchannels, pchannels);
            })
            .await?;

        for v in vchannels {
            node.tsafe.add_tsafe(v);

            // Pair each delta vchannel with its DML vchannel to find the
            // query shard to attach the delta tSafe watch to; a channel
            // that doesn't convert is skipped and logged, not fatal
            // (§4.2.3 "skip shard attach on conversion failure").
            match dml_of(v, &node.config.delta_channel_prefix, &node.config.dml_channel_prefix) {
                Some(dml_vchannel) => {
                    let shard = node.query_shards.ensure_query_shard(cid, &dml_vchannel, self.replica_id);
                    shard.watch_delta_tsafe().await;
                    if !shard.has_delta_watch() {
                        warn!(channel = %v, "delta tsafe watch did not attach");
                    }
                }
                None => warn!(channel = %v, "could not derive dml channel for delta channel, skipping shard attach"),
            }
        }

        for v in vchannels {
            let graph = created.get(v).expect("just created");
            graph.start().await?;
        }

        Ok(())
    }
}
