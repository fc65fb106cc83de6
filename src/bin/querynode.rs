//! QueryNode process entry point.
//!
//! Grounded on the teacher's `compute/src/lib.rs::start()`: parse opts, log
//! them, build the node, then run until shutdown. RPC framing is out of
//! scope (`SPEC_FULL.md` §1), so there is no listener here: this wires up
//! the control-plane components against their in-memory collaborators and
//! waits for `Ctrl-C`. A real deployment wires `SegmentLoader`,
//! `FlowGraphFactory` and `BusConsumerFactory` to the storage layer, DAG
//! engine and message bus respectively, then drives `QueryNode::submit`
//! from an RPC server.

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use querynode_core::config::{NodeConfig, QueryNodeOpts};
use querynode_core::flow_graph::{FlowGraphService, InMemoryFlowGraphFactory};
use querynode_core::query_shard::{InMemoryBusConsumerFactory, QueryShardService};
use querynode_core::segment_loader::InMemorySegmentLoader;
use querynode_core::{NodeContext, QueryNode};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let opts = QueryNodeOpts::parse();
    tracing::info!(?opts, "options");

    let config = match NodeConfig::from_sources(&opts) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            std::process::exit(1);
        }
    };

    let ctx = Arc::new(NodeContext::new(
        config,
        Arc::new(InMemorySegmentLoader::new()),
        Arc::new(FlowGraphService::new(Arc::new(InMemoryFlowGraphFactory::new()))),
        Arc::new(QueryShardService::new(Arc::new(InMemoryBusConsumerFactory))),
    ));
    let _node = QueryNode::new(ctx);

    tracing::info!("query node ready, awaiting shutdown signal");
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("shutdown signal received"),
        Err(e) => tracing::error!(error = %e, "failed to listen for shutdown signal"),
    }
}
