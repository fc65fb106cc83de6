//! Shared data model: identifiers, channel positions, segment metadata and
//! the per-replica collection record.
//!
//! Types here are plain, `serde`-serializable structs rather than wire-format
//! protobuf messages — RPC framing is out of scope (see `SPEC_FULL.md` §1)
//! and these are the payload shapes that framing would carry.

use serde::{Deserialize, Serialize};

/// 63-bit signed identifier for collections, partitions, segments and
/// request messages. Plain `i64` is used; callers must not rely on the
/// sign bit (see [`crate::task::random_unique_id`]).
pub type UniqueId = i64;

/// 64-bit monotonic hybrid logical timestamp.
pub type Timestamp = u64;

/// Two load modes a segment can be loaded under.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SegmentState {
    Growing,
    Sealed,
}

/// How a collection was loaded: by the whole collection, or partition by
/// partition. `Unknown` is only ever seen transiently while a
/// `WatchDmChannels` request is being processed (see §4.2.2 stage 1).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LoadType {
    #[default]
    Unknown,
    Collection,
    Partition,
}

/// (channel name, timestamp) pair attached to a flushed/dropped segment,
/// used by the excluded-segment bookkeeping in §4.2.2 stage 8. Segments
/// without one are simply never matched against a seek position — see
/// `DESIGN.md`'s note on Open Question (a).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DmlPosition {
    pub channel_name: String,
    pub timestamp: Timestamp,
}

/// A message-bus position: either "consume from latest" (empty `msg_id`) or
/// "seek to this position, then consume".
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Position {
    pub channel_name: String,
    pub msg_id: Vec<u8>,
    pub timestamp: Timestamp,
    pub msg_group: String,
}

impl Position {
    pub fn from_latest(channel_name: impl Into<String>) -> Self {
        Position {
            channel_name: channel_name.into(),
            msg_id: Vec::new(),
            timestamp: 0,
            msg_group: String::new(),
        }
    }

    /// An empty message-id means "consume from latest"; non-empty means
    /// "seek to this position, then consume" (§3 Position).
    pub fn is_consume_latest(&self) -> bool {
        self.msg_id.is_empty()
    }
}

/// A segment's load-time metadata, as handed to `SegmentLoader`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SegmentLoadInfo {
    pub segment_id: UniqueId,
    pub partition_id: UniqueId,
    pub collection_id: UniqueId,
    pub binlog_paths: Vec<String>,
    pub statslog_paths: Vec<String>,
    pub deltalog_paths: Vec<String>,
    pub num_of_rows: i64,
    /// Present on flushed/dropped segments; absent on unflushed ones.
    pub dml_position: Option<DmlPosition>,
}

impl SegmentLoadInfo {
    /// Unflushed (growing) segments are only loaded if they carry at least
    /// one binlog path (§4.2.2 stage 5).
    pub fn has_binlogs(&self) -> bool {
        !self.binlog_paths.is_empty()
    }
}

/// A minimal collection schema. Full type/field encoding is out of scope;
/// only identity and arity matter to the control plane.
#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct CollectionSchema {
    pub name: String,
    pub field_names: Vec<String>,
}

/// Per-replica record for one collection (§3 Collection). Held once per
/// replica per collection-id.
#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct Collection {
    pub collection_id: UniqueId,
    pub schema: CollectionSchema,
    pub load_type: LoadType,
    pub vchannels: Vec<String>,
    pub pchannels: Vec<String>,
    pub vdelta_channels: Vec<String>,
    pub pdelta_channels: Vec<String>,
    pub release_time: Timestamp,
}

impl Collection {
    pub fn new(collection_id: UniqueId, schema: CollectionSchema) -> Self {
        Collection {
            collection_id,
            schema,
            ..Default::default()
        }
    }

    /// Invariant: `pchannels[i] == physical(vchannels[i])`, no duplicates.
    /// Appends only vchannels not already present, keeping the arrays in
    /// lockstep.
    pub fn add_dml_channels(&mut self, vchannels: &[String], pchannels: &[String]) {
        debug_assert_eq!(vchannels.len(), pchannels.len());
        for (v, p) in vchannels.iter().zip(pchannels) {
            if !self.vchannels.iter().any(|existing| existing == v) {
                self.vchannels.push(v.clone());
                self.pchannels.push(p.clone());
            }
        }
    }

    pub fn add_delta_channels(&mut self, vchannels: &[String], pchannels: &[String]) {
        debug_assert_eq!(vchannels.len(), pchannels.len());
        for (v, p) in vchannels.iter().zip(pchannels) {
            if !self.vdelta_channels.iter().any(|existing| existing == v) {
                self.vdelta_channels.push(v.clone());
                self.pdelta_channels.push(p.clone());
            }
        }
    }
}
