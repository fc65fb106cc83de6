//! `WatchDmChannelsTask` (§4.2.2) — the most intricate task. Attaches the
//! node to DML channels for a collection so that live inserts flow into the
//! streaming replica, through the fourteen strictly-ordered stages the spec
//! lays out.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use itertools::Itertools;
use tracing::{instrument, warn};

use crate::channel::{physical, sub_name};
use crate::error::{QueryNodeError, Result};
use crate::flow_graph::rollback_flow_graphs;
use crate::model::{Collection, CollectionSchema, DmlPosition, LoadType, Position, SegmentLoadInfo, Timestamp, UniqueId};
use crate::segment_loader::LoadMode;
use crate::task::{Task, TaskContext, TaskId};
use crate::NodeContext;

/// One `Infos[]` entry of the `WatchDmChannels` request body (§6).
#[derive(Clone, Debug, Default)]
pub struct ChannelInfo {
    pub channel_name: String,
    pub seek_position: Position,
    pub unflushed_segments: Vec<SegmentLoadInfo>,
    pub flushed_segments: Vec<SegmentLoadInfo>,
    pub dropped_segments: Vec<SegmentLoadInfo>,
}

/// `LoadMeta` of the request body.
#[derive(Clone, Debug, Default)]
pub struct LoadMeta {
    pub load_type: LoadType,
    pub partition_ids: Vec<UniqueId>,
}

pub struct WatchDmChannelsTask {
    ctx: Arc<NodeContext>,
    id: TaskId,
    base_msg_id: Option<TaskId>,
    base_timestamp: Option<Timestamp>,
    pub collection_id: UniqueId,
    pub schema: CollectionSchema,
    pub replica_id: UniqueId,
    pub infos: Vec<ChannelInfo>,
    pub load_meta: LoadMeta,
}

impl WatchDmChannelsTask {
    pub fn new(
        ctx: Arc<NodeContext>,
        base_msg_id: Option<TaskId>,
        base_timestamp: Option<Timestamp>,
        collection_id: UniqueId,
        schema: CollectionSchema,
        replica_id: UniqueId,
        infos: Vec<ChannelInfo>,
        load_meta: LoadMeta,
    ) -> Self {
        WatchDmChannelsTask {
            ctx,
            id: 0,
            base_msg_id,
            base_timestamp,
            collection_id,
            schema,
            replica_id,
            infos,
            load_meta,
        }
    }
}

/// Guards the nil-dereference hazard noted in the source (Open Question a,
/// `DESIGN.md`): a segment with no `DmlPosition` is never excluded by a
/// seek position, rather than unwrapped.
fn is_excluded_by_seek(dml_position: Option<&DmlPosition>, seek_positions: &HashMap<String, Timestamp>) -> bool {
    match dml_position {
        None => false,
        Some(pos) => seek_positions
            .get(&pos.channel_name)
            .is_some_and(|seek_ts| pos.timestamp > *seek_ts),
    }
}

#[async_trait]
impl Task for WatchDmChannelsTask {
    fn kind(&self) -> &'static str {
        "watch_dm_channels"
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

        // Stage 1: determine load type.
        let load_type = match self.load_meta.load_type {
            LoadType::Unknown => {
                if self.load_meta.partition_ids.is_empty() {
                    LoadType::Collection
                } else {
                    LoadType::Partition
                }
            }
            other => other,
        };

        // Stage 2: compute channels, assert vchannel uniqueness.
        if let Some(dup) = self.infos.iter().map(|i| &i.channel_name).duplicates().next() {
            return Err(QueryNodeError::duplicate_vchannel(dup));
        }
        let vchannels: Vec<String> = self.infos.iter().map(|i| i.channel_name.clone()).collect();
        let pchannels: Vec<String> = vchannels.iter().map(|v| physical(v)).collect();

        // Stage 3: create collection in both replicas (idempotent).
        node.streaming.add_collection(cid, self.schema.clone()).await;
        node.historical.add_collection(cid, self.schema.clone()).await;

        // Stage 4: register shard-cluster for each vchannel.
        for v in &vchannels {
            node.shard_clusters.register(cid, self.replica_id, v);
        }

        ctx.check()?;

        // Stage 5: load growing (unflushed) segments.
        let growing_infos: Vec<SegmentLoadInfo> = self
            .infos
            .iter()
            .flat_map(|info| info.unflushed_segments.iter())
            .filter(|s| s.has_binlogs())
            .cloned()
            .collect();
        if !growing_infos.is_empty() {
            node.segment_loader
                .load_segment(&growing_infos, LoadMode::Growing)
                .await?;
        }
        for seg in &growing_infos {
            node.streaming.add_partition(cid, seg.partition_id).await;
            node.historical.add_partition(cid, seg.partition_id).await;
            node.streaming.add_growing_segment(cid, seg.segment_id).await;
        }
        for pid in &self.load_meta.partition_ids {
            node.streaming.add_partition(cid, *pid).await;
            node.historical.add_partition(cid, *pid).await;
        }

        // Stage 6: growing-load rollback hook is now armed — any failure
        // from here on unwinds `growing_infos` from the streaming replica.
        let loaded_segment_ids: Vec<UniqueId> = growing_infos.iter().map(|s| s.segment_id).collect();

        let result = self
            .attach_channels(ctx, cid, &vchannels, &pchannels, load_type)
            .await;

        if let Err(e) = result {
            for sid in &loaded_segment_ids {
                node.streaming.remove_segment(*sid).await;
            }
            return Err(e);
        }
        Ok(())
    }
}

impl WatchDmChannelsTask {
    /// Stages 7-14: everything after the growing-load rollback hook is
    /// armed. Factored out so `execute` can unwind growing segments on any
    /// failure from this point without duplicating the unwind call at
    /// every `?`.
    async fn attach_channels(
        &self,
        ctx: &TaskContext,
        cid: UniqueId,
        vchannels: &[String],
        pchannels: &[String],
        load_type: LoadType,
    ) -> Result<()> {
        let node = &self.ctx;

        // Stage 7: classify seek vs consume-from-latest.
        let sub = sub_name(&node.config.sub_name_prefix, cid, node.config.node_id);
        let mut seek_positions: HashMap<String, Timestamp> = HashMap::new();
        let mut classified: HashMap<String, Option<Position>> = HashMap::new();
        for info in &self.infos {
            if info.seek_position.is_consume_latest() {
                classified.insert(info.channel_name.clone(), None);
            } else {
                let mut pos = info.seek_position.clone();
                seek_positions.insert(pos.channel_name.clone(), pos.timestamp);
                pos.msg_group = sub.clone();
                classified.insert(info.channel_name.clone(), Some(pos));
            }
        }

        // Stage 8: excluded-segment bookkeeping.
        let mut excluded: Vec<SegmentLoadInfo> = self
            .infos
            .iter()
            .flat_map(|info| info.unflushed_segments.iter())
            .cloned()
            .collect();
        for info in &self.infos {
            excluded.extend(
                info.flushed_segments
                    .iter()
                    .filter(|s| is_excluded_by_seek(s.dml_position.as_ref(), &seek_positions))
                    .cloned(),
            );
            excluded.extend(
                info.dropped_segments
                    .iter()
                    .filter(|s| is_excluded_by_seek(s.dml_position.as_ref(), &seek_positions))
                    .cloned(),
            );
        }
        node.streaming.add_excluded_segments(cid, excluded).await;

        ctx.check()?;

        // Stage 9: create DML flow-graphs for every vchannel. This is the
        // rollback boundary: any failure from here through stage 14 closes
        // and removes every graph created here before returning.
        let created = node.flow_graphs.add_dml_channels(cid, vchannels).await?;

        let result = self
            .attach_and_start(ctx, cid, &created, vchannels, pchannels, load_type, &classified, &sub)
            .await;
        if let Err(e) = result {
            rollback_flow_graphs(&node.flow_graphs, &created, false).await;
            return Err(e);
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn attach_and_start(
        &self,
        ctx: &TaskContext,
        cid: UniqueId,
        created: &HashMap<String, Arc<dyn crate::flow_graph::FlowGraph>>,
        vchannels: &[String],
        pchannels: &[String],
        load_type: LoadType,
        classified: &HashMap<String, Option<Position>>,
        sub: &str,
    ) -> Result<()> {
        let node = &self.ctx;

        // Stage 10: attach each flow-graph to the bus.
        for v in vchannels {
            let graph = created.get(v).expect("just created");
            match classified.get(v).and_then(|c| c.clone()) {
                None => {
                    let p = physical(v);
                    graph.consume_from_latest(&p, sub).await?;
                }
                Some(mut position) => {
                    position.channel_name = physical(v);
                    graph.seek(position).await?;
                }
            }
        }

        ctx.check()?;

        // Stage 11: update collection metadata in both replicas.
        node.streaming
            .mutate_collection(cid, |c: &mut Collection| {
                c.add_dml_channels(vchannels, pchannels);
                c.load_type = load_type;
            })
            .await?;
        node.historical
            .mutate_collection(cid, |c: &mut Collection| {
                c.add_dml_channels(vchannels, pchannels);
                c.load_type = load_type;
            })
            .await?;

        // Stage 12: create tSafe entries for every vchannel.
        for v in vchannels {
            node.tsafe.add_tsafe(v);
        }

        // Stage 13: ensure a query shard exists per vchannel, attach its
        // DML tSafe watch (logged, non-fatal on failure).
        for v in vchannels {
            let shard = node.query_shards.ensure_query_shard(cid, v, self.replica_id);
            shard.watch_dml_tsafe().await;
            if !shard.has_dml_watch() {
                warn!(channel = %v, "dml tsafe watch did not attach");
            }
        }

        // Stage 14: start the flow-graphs, only now that every preceding
        // stage has succeeded.
        for v in vchannels {
            let graph = created.get(v).expect("just created");
            graph.start().await?;
        }

        Ok(())
    }
}
