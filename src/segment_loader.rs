//! Loads growing or sealed segments from object storage into a replica
//! (§4.1 table, §1 "vector segment loader's internal format" is out of
//! scope). Grounded on `storage/src/hummock/mod.rs`'s `HummockStorage`
//! shape: an async collaborator reached through a trait object, its
//! on-disk format entirely opaque to the caller.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{QueryNodeError, Result};
use crate::model::{Position, SegmentLoadInfo, UniqueId};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadMode {
    Growing,
    Sealed,
}

#[async_trait]
pub trait SegmentLoader: Send + Sync {
    async fn load_segment(&self, infos: &[SegmentLoadInfo], mode: LoadMode) -> Result<()>;

    /// Replays deletes up to the DML checkpoint for each delta channel
    /// (§4.2.3), keyed by vchannel.
    async fn from_dml_cp_load_delete(
        &self,
        collection_id: UniqueId,
        positions: &HashMap<String, Position>,
    ) -> Result<()>;
}

/// Test/demo loader recording which segments were loaded under which mode,
/// and which delete-replay calls were made, with an optional injected
/// failure for exercising rollback paths.
#[derive(Default)]
pub struct InMemorySegmentLoader {
    state: Mutex<InMemorySegmentLoaderState>,
    fail_on_segment: Option<UniqueId>,
}

#[derive(Default)]
struct InMemorySegmentLoaderState {
    growing: HashSet<UniqueId>,
    sealed: HashSet<UniqueId>,
    delete_replays: Vec<UniqueId>,
}

impl InMemorySegmentLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_on(segment_id: UniqueId) -> Self {
        InMemorySegmentLoader {
            state: Mutex::new(InMemorySegmentLoaderState::default()),
            fail_on_segment: Some(segment_id),
        }
    }

    pub fn growing_segments(&self) -> HashSet<UniqueId> {
        self.state.lock().unwrap().growing.clone()
    }

    pub fn sealed_segments(&self) -> HashSet<UniqueId> {
        self.state.lock().unwrap().sealed.clone()
    }

    pub fn delete_replays(&self) -> Vec<UniqueId> {
        self.state.lock().unwrap().delete_replays.clone()
    }
}

#[async_trait]
impl SegmentLoader for InMemorySegmentLoader {
    async fn load_segment(&self, infos: &[SegmentLoadInfo], mode: LoadMode) -> Result<()> {
        if let Some(failing) = self.fail_on_segment {
            if infos.iter().any(|i| i.segment_id == failing) {
                return Err(QueryNodeError::Collaborator(format!(
                    "segment load failed for segment {failing}"
                )));
            }
        }
        let mut state = self.state.lock().unwrap();
        for info in infos {
            match mode {
                LoadMode::Growing => state.growing.insert(info.segment_id),
                LoadMode::Sealed => state.sealed.insert(info.segment_id),
            };
        }
        Ok(())
    }

    async fn from_dml_cp_load_delete(
        &self,
        collection_id: UniqueId,
        _positions: &HashMap<String, Position>,
    ) -> Result<()> {
        self.state.lock().unwrap().delete_replays.push(collection_id);
        Ok(())
    }
}
