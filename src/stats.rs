//! Stats collaborator
//!
//! The core publishes per-handle listener counts, peaks and averaged
//! outgoing bitrate under named nodes (`fallback-<mount>` / `file-<mount>`),
//! plus a global count of file connections. The registry lock is its own
//! mutex, independent of the serving locks, and is never held across I/O.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// One published value with its presentation flags.
#[derive(Debug, Clone)]
pub struct StatsValue {
    pub value: String,
    /// Hidden entries are bookkeeping, not for public listings.
    pub hidden: bool,
    /// Counter entries reset with the server, not with config reloads.
    pub counter: bool,
}

/// Named key/value stats nodes.
#[derive(Debug, Default)]
pub struct StatsRegistry {
    nodes: Mutex<HashMap<String, HashMap<String, StatsValue>>>,
    file_connections: AtomicU64,
}

impl StatsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a plain value on a node, creating the node as needed.
    pub fn set(&self, node: &str, key: &str, value: impl ToString) {
        self.set_with_flags(node, key, value, false, false);
    }

    /// Set a hidden counter value (meters and markers).
    pub fn set_hidden_counter(&self, node: &str, key: &str, value: impl ToString) {
        self.set_with_flags(node, key, value, true, true);
    }

    fn set_with_flags(
        &self,
        node: &str,
        key: &str,
        value: impl ToString,
        hidden: bool,
        counter: bool,
    ) {
        let mut nodes = self.nodes.lock().unwrap();
        nodes.entry(node.to_string()).or_default().insert(
            key.to_string(),
            StatsValue {
                value: value.to_string(),
                hidden,
                counter,
            },
        );
    }

    /// Read one value back.
    pub fn get(&self, node: &str, key: &str) -> Option<String> {
        self.nodes
            .lock()
            .unwrap()
            .get(node)
            .and_then(|n| n.get(key))
            .map(|v| v.value.clone())
    }

    /// Drop a node and everything under it.
    pub fn remove(&self, node: &str) {
        self.nodes.lock().unwrap().remove(node);
    }

    /// Whether a node currently exists.
    pub fn contains(&self, node: &str) -> bool {
        self.nodes.lock().unwrap().contains_key(node)
    }

    /// Bump the global file connection counter.
    pub fn incr_file_connections(&self) {
        self.file_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn file_connections(&self) -> u64 {
        self.file_connections.load(Ordering::Relaxed)
    }
}
