//! End-to-end scenarios spanning the full task lifecycle through the
//! public `QueryNode` facade, rather than exercising one task in
//! isolation as the per-module unit tests do.

use std::sync::Arc;

use querynode_core::config::{NodeConfig, QueryNodeOpts};
use querynode_core::flow_graph::{FlowGraphService, InMemoryFlowGraphFactory};
use querynode_core::model::{CollectionSchema, LoadType, Position, SegmentLoadInfo};
use querynode_core::query_shard::{InMemoryBusConsumerFactory, QueryShardService};
use querynode_core::segment_loader::InMemorySegmentLoader;
use querynode_core::task::load_segments::LoadSegmentsTask;
use querynode_core::task::release_collection::ReleaseCollectionTask;
use querynode_core::task::release_partitions::ReleasePartitionsTask;
use querynode_core::task::watch_delta_channels::{DeltaChannelInfo, WatchDeltaChannelsTask};
use querynode_core::task::watch_dm_channels::{ChannelInfo, LoadMeta, WatchDmChannelsTask};
use querynode_core::task::TaskContext;
use querynode_core::{NodeContext, QueryNode};

fn node(factory: InMemoryFlowGraphFactory) -> (QueryNode, Arc<NodeContext>) {
    let mut opts = QueryNodeOpts::default();
    opts.graceful_release_millis = Some(0);
    let ctx = Arc::new(NodeContext::new(
        NodeConfig::from_sources(&opts).unwrap(),
        Arc::new(InMemorySegmentLoader::new()),
        Arc::new(FlowGraphService::new(Arc::new(factory))),
        Arc::new(QueryShardService::new(Arc::new(InMemoryBusConsumerFactory))),
    ));
    (QueryNode::new(ctx.clone()), ctx)
}

fn seek(channel: &str, ts: u64) -> Position {
    Position {
        channel_name: channel.to_string(),
        msg_id: b"x".to_vec(),
        timestamp: ts,
        msg_group: String::new(),
    }
}

fn growing_segment(id: i64, partition_id: i64) -> SegmentLoadInfo {
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

/// Scenario 1: Happy WatchDm.
#[tokio::test]
async fn happy_watch_dm() {
    let (node, ctx) = node(InMemoryFlowGraphFactory::new());
    let task = WatchDmChannelsTask::new(
        ctx.clone(),
        Some(1),
        Some(500),
        100,
        CollectionSchema::default(),
        0,
        vec![ChannelInfo {
            channel_name: "by-dev-rootcoord-dml_0".into(),
            seek_position: seek("by-dev-rootcoord-dml_0", 500),
            unflushed_segments: vec![growing_segment(7, 1)],
            flushed_segments: vec![],
            dropped_segments: vec![],
        }],
        LoadMeta {
            load_type: LoadType::Collection,
            partition_ids: vec![],
        },
    );
    node.submit(Box::new(task), TaskContext::default())
        .wait_to_finish()
        .await
        .unwrap();

    assert!(ctx.streaming.has_collection(100).await);
    assert!(ctx.historical.has_collection(100).await);
    assert!(ctx.streaming.has_partition(100, 1).await);
    assert_eq!(ctx.streaming.excluded_segments(100).await.len(), 1);
    assert!(ctx.flow_graphs.has_dml_graph("by-dev-rootcoord-dml_0").await);
    assert_eq!(ctx.flow_graphs.dml_graph_count().await, 1);
}

/// Scenario 2: rollback when the bus rejects the seek.
#[tokio::test]
async fn rollback_on_bus_failure() {
    let (node, ctx) = node(InMemoryFlowGraphFactory::new().with_failing("by-dev-rootcoord-dml_0"));
    let task = WatchDmChannelsTask::new(
        ctx.clone(),
        Some(1),
        Some(500),
        100,
        CollectionSchema::default(),
        0,
        vec![ChannelInfo {
            channel_name: "by-dev-rootcoord-dml_0".into(),
            seek_position: seek("by-dev-rootcoord-dml_0", 500),
            unflushed_segments: vec![growing_segment(7, 1)],
            flushed_segments: vec![],
            dropped_segments: vec![],
        }],
        LoadMeta {
            load_type: LoadType::Collection,
            partition_ids: vec![],
        },
    );
    let outcome = node
        .submit(Box::new(task), TaskContext::default())
        .wait_to_finish()
        .await;
    assert!(outcome.is_err());

    assert!(!ctx.flow_graphs.has_dml_graph("by-dev-rootcoord-dml_0").await);
    assert!(!ctx.streaming.has_growing_segment(7).await);
    // Collection creation is not rolled back.
    assert!(ctx.streaming.has_collection(100).await);
}

/// Scenario 3: release after a successful watch undoes everything.
#[tokio::test]
async fn release_sequence() {
    let (node, ctx) = node(InMemoryFlowGraphFactory::new());
    let watch = WatchDmChannelsTask::new(
        ctx.clone(),
        Some(1),
        Some(500),
        100,
        CollectionSchema::default(),
        0,
        vec![ChannelInfo {
            channel_name: "by-dev-rootcoord-dml_0".into(),
            seek_position: seek("by-dev-rootcoord-dml_0", 500),
            unflushed_segments: vec![growing_segment(7, 1)],
            flushed_segments: vec![],
            dropped_segments: vec![],
        }],
        LoadMeta::default(),
    );
    node.submit(Box::new(watch), TaskContext::default())
        .wait_to_finish()
        .await
        .unwrap();

    let release = ReleaseCollectionTask::new(ctx.clone(), Some(2), Some(900), 100);
    node.submit(Box::new(release), TaskContext::default())
        .wait_to_finish()
        .await
        .unwrap();

    assert!(!ctx.streaming.has_collection(100).await);
    assert!(!ctx.historical.has_collection(100).await);
    assert!(!ctx.flow_graphs.has_dml_graph("by-dev-rootcoord-dml_0").await);
    assert!(!ctx.tsafe.has_tsafe("by-dev-rootcoord-dml_0"));
    assert!(ctx.streaming.excluded_segments(100).await.is_empty());
    assert_eq!(ctx.query_shards.shard_count(), 0);
}

/// Scenario 4: delta attach without a prior watch-dm fails.
#[tokio::test]
async fn delta_attach_without_prior_dm_fails() {
    let (node, ctx) = node(InMemoryFlowGraphFactory::new());
    let task = WatchDeltaChannelsTask::new(
        ctx.clone(),
        Some(1),
        Some(500),
        200,
        0,
        vec![DeltaChannelInfo {
            channel_name: "by-dev-rootcoord-delta_0".into(),
            seek_position: Position::from_latest("by-dev-rootcoord-delta_0"),
        }],
    );
    let outcome = node
        .submit(Box::new(task), TaskContext::default())
        .wait_to_finish()
        .await;
    assert!(outcome.is_err());
}

/// Scenario 5: LoadSegments idempotence.
#[tokio::test]
async fn load_segments_is_idempotent() {
    let (node, ctx) = node(InMemoryFlowGraphFactory::new());
    for _ in 0..2 {
        let task = LoadSegmentsTask::new(
            ctx.clone(),
            Some(1),
            Some(500),
            300,
            CollectionSchema::default(),
            vec![1, 2],
            vec![],
        );
        node.submit(Box::new(task), TaskContext::default())
            .wait_to_finish()
            .await
            .unwrap();
    }
    assert!(ctx.historical.has_partition(300, 1).await);
    assert!(ctx.historical.has_partition(300, 2).await);
}

/// Scenario 6: enqueue identity when Base is nil.
#[tokio::test]
async fn enqueue_identity_without_base() {
    let (node, ctx) = node(InMemoryFlowGraphFactory::new());
    let task = WatchDmChannelsTask::new(ctx, None, None, 400, CollectionSchema::default(), 0, vec![], LoadMeta::default());
    let handle = node.submit(Box::new(task), TaskContext::default());
    assert_ne!(handle.id(), 0);
    handle.wait_to_finish().await.unwrap();
}

/// Boundary: unknown partition-id during release logs and continues.
#[tokio::test]
async fn release_partitions_tolerates_unknown_partition() {
    let (node, ctx) = node(InMemoryFlowGraphFactory::new());
    let load = LoadSegmentsTask::new(
        ctx.clone(),
        Some(1),
        Some(500),
        500,
        CollectionSchema::default(),
        vec![1],
        vec![],
    );
    node.submit(Box::new(load), TaskContext::default())
        .wait_to_finish()
        .await
        .unwrap();

    let release = ReleasePartitionsTask::new(ctx.clone(), Some(2), Some(600), 500, vec![1, 42]);
    node.submit(Box::new(release), TaskContext::default())
        .wait_to_finish()
        .await
        .unwrap();

    assert!(!ctx.historical.has_partition(500, 1).await);
}
