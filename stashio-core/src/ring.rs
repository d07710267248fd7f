use crate::error::{Result, StashError};
use fnv::FnvHasher;
use std::collections::HashMap;
use std::hash::Hasher;
use std::sync::Mutex;

/// A cluster member as tracked by the ring. `alive` is the last observed
/// health status and is advisory only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub address: String,
    pub alive: bool,
}

impl Node {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            alive: false,
        }
    }
}

/// Ring identifier for a key or node address: FNV-1a 64 truncated to the
/// host's signed integer width.
pub fn hash_key(key: &str) -> i64 {
    let mut hasher = FnvHasher::default();
    hasher.write(key.as_bytes());
    hasher.finish() as i64
}

#[derive(Default)]
struct RingInner {
    // strictly increasing, always the exact key set of `nodes`
    ids: Vec<i64>,
    nodes: HashMap<i64, Node>,
}

/// Thread-safe consistent-hash ring.
///
/// Lookup picks the id *closest* to the key's hash by absolute distance,
/// ties breaking to the larger id. This is not next-clockwise placement;
/// the closest-element rule is load-bearing for placement reproducibility
/// and must not be "fixed".
#[derive(Default)]
pub struct HashRing {
    inner: Mutex<RingInner>,
}

impl HashRing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a node, keyed by the hash of its address. Re-adding a known
    /// address replaces the stored record without duplicating its id.
    pub fn add_node(&self, node: Node) {
        let id = hash_key(&node.address);
        let mut inner = self.lock();
        if let Err(pos) = inner.ids.binary_search(&id) {
            inner.ids.insert(pos, id);
        }
        inner.nodes.insert(id, node);
    }

    /// Remove the node with the given address. Returns false if the ring
    /// did not contain it.
    pub fn remove_node(&self, address: &str) -> bool {
        let id = hash_key(address);
        let mut inner = self.lock();
        if inner.nodes.remove(&id).is_none() {
            return false;
        }
        if let Ok(pos) = inner.ids.binary_search(&id) {
            inner.ids.remove(pos);
        }
        true
    }

    /// Whether a node with this address is in the ring.
    pub fn contains(&self, address: &str) -> bool {
        let id = hash_key(address);
        self.lock().nodes.contains_key(&id)
    }

    /// The node responsible for `key`, per the closest-id rule.
    pub fn node_for_key(&self, key: &str) -> Result<Node> {
        let target = hash_key(key);
        let inner = self.lock();

        let Some(id) = closest_id(&inner.ids, target) else {
            return Err(StashError::NotFound(format!(
                "no node for key '{}': ring is empty",
                key
            )));
        };

        inner
            .nodes
            .get(&id)
            .cloned()
            .ok_or_else(|| StashError::NotFound(format!("no node for key '{}'", key)))
    }

    /// Up to `count` distinct nodes following the owner of `key` in
    /// ascending id order, wrapping around. The owner itself is excluded;
    /// these are the replica targets for the key.
    pub fn next_nodes(&self, key: &str, count: usize) -> Vec<Node> {
        let target = hash_key(key);
        let inner = self.lock();

        let Some(owner_id) = closest_id(&inner.ids, target) else {
            return Vec::new();
        };
        let owner_pos = match inner.ids.binary_search(&owner_id) {
            Ok(pos) => pos,
            Err(_) => return Vec::new(),
        };

        let available = inner.ids.len().saturating_sub(1);
        let mut replicas = Vec::with_capacity(count.min(available));
        for step in 1..=available {
            if replicas.len() == count {
                break;
            }
            let id = inner.ids[(owner_pos + step) % inner.ids.len()];
            if let Some(node) = inner.nodes.get(&id) {
                replicas.push(node.clone());
            }
        }
        replicas
    }

    /// Snapshot of the current membership.
    pub fn nodes(&self) -> Vec<Node> {
        self.lock().nodes.values().cloned().collect()
    }

    /// Update the advisory health flag of a member. Unknown addresses are
    /// ignored (the node may have been removed since the probe started).
    pub fn set_alive(&self, address: &str, alive: bool) {
        let id = hash_key(address);
        if let Some(node) = self.lock().nodes.get_mut(&id) {
            node.alive = alive;
        }
    }

    pub fn len(&self) -> usize {
        self.lock().ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RingInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Closest element of a sorted id slice by absolute distance, ties going
/// to the larger id. None iff the slice is empty.
fn closest_id(ids: &[i64], target: i64) -> Option<i64> {
    if ids.is_empty() {
        return None;
    }

    let pos = ids.partition_point(|id| *id < target);
    if pos == 0 {
        return Some(ids[0]);
    }
    if pos == ids.len() {
        return Some(ids[ids.len() - 1]);
    }

    let lower = ids[pos - 1];
    let upper = ids[pos];
    // distances in i128 so extreme ids cannot overflow the subtraction
    let to_lower = (target as i128) - (lower as i128);
    let to_upper = (upper as i128) - (target as i128);
    if to_lower >= to_upper {
        Some(upper)
    } else {
        Some(lower)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_ring(addresses: &[&str]) -> HashRing {
        let ring = HashRing::new();
        for address in addresses {
            ring.add_node(Node::new(*address));
        }
        ring
    }

    #[test]
    fn test_empty_ring_lookup_is_not_found() {
        let ring = HashRing::new();
        let err = ring.node_for_key("some_random_key").unwrap_err();
        assert!(matches!(err, StashError::NotFound(_)));
    }

    #[test]
    fn test_single_node_owns_every_key() {
        let ring = sample_ring(&["127.0.0.1:5555"]);
        for key in ["a", "b", "photos", "some_random_key"] {
            let node = ring.node_for_key(key).unwrap();
            assert_eq!(node.address, "127.0.0.1:5555");
        }
    }

    #[test]
    fn test_lookup_is_deterministic() {
        let ring = sample_ring(&["127.0.0.1:42069", "127.0.0.1:42070", "127.0.0.1:42071"]);
        assert_eq!(ring.len(), 3);

        let first = ring.node_for_key("some_random_key").unwrap();
        let second = ring.node_for_key("some_random_key").unwrap();
        assert_eq!(first.address, second.address);

        // removing the owner re-routes the key to a different node
        assert!(ring.remove_node(&first.address));
        let rerouted = ring.node_for_key("some_random_key").unwrap();
        assert_ne!(rerouted.address, first.address);
    }

    #[test]
    fn test_add_node_is_idempotent_on_ids() {
        let ring = sample_ring(&["127.0.0.1:5555"]);
        ring.add_node(Node::new("127.0.0.1:5555"));
        assert_eq!(ring.len(), 1);
    }

    #[test]
    fn test_remove_unknown_node() {
        let ring = sample_ring(&["127.0.0.1:5555"]);
        assert!(!ring.remove_node("127.0.0.1:9999"));
        assert_eq!(ring.len(), 1);
    }

    #[test]
    fn test_set_alive() {
        let ring = sample_ring(&["127.0.0.1:5555"]);
        assert!(!ring.node_for_key("k").unwrap().alive);

        ring.set_alive("127.0.0.1:5555", true);
        assert!(ring.node_for_key("k").unwrap().alive);

        // unknown addresses are ignored
        ring.set_alive("127.0.0.1:9999", true);
    }

    #[test]
    fn test_closest_id_picks_nearest() {
        let ids = [1, 3, 8, 11, 19];
        assert_eq!(closest_id(&ids, 12), Some(11));
        assert_eq!(closest_id(&ids, 18), Some(19));
        assert_eq!(closest_id(&ids, -5), Some(1));
        assert_eq!(closest_id(&ids, 100), Some(19));
        assert_eq!(closest_id(&ids, 8), Some(8));
        assert_eq!(closest_id(&[], 8), None);
    }

    #[test]
    fn test_closest_id_tie_breaks_upward() {
        let ids = [10, 20];
        assert_eq!(closest_id(&ids, 15), Some(20));
    }

    #[test]
    fn test_next_nodes_excludes_owner_and_wraps() {
        let ring = sample_ring(&["127.0.0.1:42069", "127.0.0.1:42070", "127.0.0.1:42071"]);
        let owner = ring.node_for_key("some_random_key").unwrap();

        let replicas = ring.next_nodes("some_random_key", 2);
        assert_eq!(replicas.len(), 2);
        assert!(replicas.iter().all(|n| n.address != owner.address));

        // asking for more replicas than peers caps at ring size - 1
        let replicas = ring.next_nodes("some_random_key", 10);
        assert_eq!(replicas.len(), 2);
    }

    #[test]
    fn test_next_nodes_on_single_node_ring() {
        let ring = sample_ring(&["127.0.0.1:5555"]);
        assert!(ring.next_nodes("k", 2).is_empty());
    }

    #[test]
    fn test_hash_key_is_stable() {
        assert_eq!(hash_key("abc"), hash_key("abc"));
        assert_ne!(hash_key("abc"), hash_key("abd"));
    }
}
