//! Per-channel monotonic timestamp registry used as a read-visibility
//! barrier (§4.6, §3 TSafe entry). Semantics of the watermark itself are
//! opaque to this crate; the task layer only creates and destroys entries
//! in lockstep with flow-graphs.

use std::collections::HashMap;

use parking_lot::RwLock;

#[derive(Default)]
pub struct TSafeReplica {
    entries: RwLock<HashMap<String, u64>>,
}

impl TSafeReplica {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_tsafe(&self, channel: &str) {
        self.entries.write().entry(channel.to_string()).or_insert(0);
    }

    pub fn remove_tsafe(&self, channel: &str) {
        self.entries.write().remove(channel);
    }

    pub fn has_tsafe(&self, channel: &str) -> bool {
        self.entries.read().contains_key(channel)
    }

    pub fn get(&self, channel: &str) -> Option<u64> {
        self.entries.read().get(channel).copied()
    }

    pub fn set(&self, channel: &str, timestamp: u64) {
        if let Some(entry) = self.entries.write().get_mut(channel) {
            *entry = (*entry).max(timestamp);
        }
    }

    pub fn count(&self) -> usize {
        self.entries.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_remove_roundtrip() {
        let t = TSafeReplica::new();
        t.add_tsafe("c0");
        assert!(t.has_tsafe("c0"));
        t.set("c0", 500);
        assert_eq!(t.get("c0"), Some(500));
        t.remove_tsafe("c0");
        assert!(!t.has_tsafe("c0"));
    }

    #[test]
    fn set_is_monotonic() {
        let t = TSafeReplica::new();
        t.add_tsafe("c0");
        t.set("c0", 500);
        t.set("c0", 100);
        assert_eq!(t.get("c0"), Some(500));
    }
}
