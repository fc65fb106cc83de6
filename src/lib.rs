//! QueryNode control-plane task subsystem.
//!
//! A `QueryNode` is a worker process serving vector similarity queries over
//! sharded collections, maintaining a streaming replica (fed by live
//! message-bus channels) and a historical replica (populated from durable
//! segment files). This crate implements the control plane only: the
//! multi-stage transactions that attach/detach channels and load/release
//! state, reimplemented against the teacher's map-of-registries,
//! shared-context idiom (see `DESIGN.md`).

pub mod channel;
pub mod config;
pub mod error;
pub mod flow_graph;
pub mod model;
pub mod query_shard;
pub mod replica;
pub mod segment_loader;
pub mod shard_cluster;
pub mod task;
pub mod tsafe;

use std::sync::Arc;

use tracing::info;

use crate::config::NodeConfig;
use crate::flow_graph::FlowGraphService;
use crate::query_shard::QueryShardService;
use crate::replica::{ReplicaKind, ReplicaRegistry};
use crate::segment_loader::SegmentLoader;
use crate::shard_cluster::ShardClusterService;
use crate::task::{EnqueuedTask, Task, TaskContext, TaskQueue};
use crate::tsafe::TSafeReplica;

/// Everything a [`Task`] needs to interact with the rest of the node,
/// bundled the way the teacher's `SharedContext`
/// (`stream/src/task/mod.rs`) bundles `channel_map`/`actor_infos`/
/// `barrier_manager` for its own executors.
pub struct NodeContext {
    pub config: NodeConfig,
    pub streaming: Arc<ReplicaRegistry>,
    pub historical: Arc<ReplicaRegistry>,
    pub shard_clusters: Arc<ShardClusterService>,
    pub flow_graphs: Arc<FlowGraphService>,
    pub tsafe: Arc<TSafeReplica>,
    pub query_shards: Arc<QueryShardService>,
    pub segment_loader: Arc<dyn SegmentLoader>,
}

impl NodeContext {
    pub fn new(config: NodeConfig, segment_loader: Arc<dyn SegmentLoader>, flow_graphs: Arc<FlowGraphService>, query_shards: Arc<QueryShardService>) -> Self {
        NodeContext {
            config,
            streaming: Arc::new(ReplicaRegistry::new(ReplicaKind::Streaming)),
            historical: Arc::new(ReplicaRegistry::new(ReplicaKind::Historical)),
            shard_clusters: Arc::new(ShardClusterService::new()),
            flow_graphs,
            tsafe: Arc::new(TSafeReplica::new()),
            query_shards,
            segment_loader,
        }
    }
}

/// The node-level facade: owns the task queue and the shared context every
/// task is built against.
pub struct QueryNode {
    ctx: Arc<NodeContext>,
    queue: TaskQueue,
}

impl QueryNode {
    pub fn new(ctx: Arc<NodeContext>) -> Self {
        info!(node_id = ctx.config.node_id, "query node starting");
        QueryNode {
            ctx,
            queue: TaskQueue::new(),
        }
    }

    pub fn context(&self) -> &Arc<NodeContext> {
        &self.ctx
    }

    /// Enqueues a task for execution and returns a handle on its outcome.
    /// Mirrors the orchestrator RPC -> `TaskQueue.enqueue` control flow of
    /// §2: this is the single entry point every inbound request goes
    /// through.
    pub fn submit(&self, task: Box<dyn Task>, ctx: TaskContext) -> EnqueuedTask {
        self.queue.enqueue(task, ctx)
    }
}
