//! Client-id → socket-id reverse index.
//!
//! One client id may own many concurrently open sockets. Every mutation of a
//! key's id list happens under that key's shard lock, so concurrent add and
//! remove on the same client id never lose an update. Empty lists are pruned
//! with a conditional remove that re-checks emptiness under the lock.

use dashmap::DashMap;

#[derive(Debug, Default)]
pub struct ClientIndex {
    entries: DashMap<String, Vec<String>>,
}

impl ClientIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, client_id: &str, socket_id: &str) {
        let mut ids = self.entries.entry(client_id.to_string()).or_default();
        if !ids.iter().any(|s| s == socket_id) {
            ids.push(socket_id.to_string());
        }
    }

    pub fn remove(&self, client_id: &str, socket_id: &str) {
        if let Some(mut ids) = self.entries.get_mut(client_id) {
            ids.retain(|s| s != socket_id);
        }
        self.entries.remove_if(client_id, |_, ids| ids.is_empty());
    }

    /// Socket ids currently registered for `client_id`, in open order.
    pub fn lookup(&self, client_id: &str) -> Vec<String> {
        self.entries
            .get(client_id)
            .map(|ids| ids.clone())
            .unwrap_or_default()
    }

    /// Number of client ids with at least one open socket.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn one_client_many_sockets() {
        let index = ClientIndex::new();
        index.add("alice", "gw:1:");
        index.add("alice", "gw:2:");
        index.add("bob", "gw:3:");
        assert_eq!(index.lookup("alice"), vec!["gw:1:", "gw:2:"]);

        index.remove("alice", "gw:1:");
        assert_eq!(index.lookup("alice"), vec!["gw:2:"]);
        index.remove("alice", "gw:2:");
        assert!(index.lookup("alice").is_empty());
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn remove_of_unknown_is_noop() {
        let index = ClientIndex::new();
        index.remove("ghost", "gw:9:");
        index.add("a", "gw:1:");
        index.remove("a", "gw:9:");
        assert_eq!(index.lookup("a"), vec!["gw:1:"]);
    }

    #[test]
    fn duplicate_add_is_idempotent() {
        let index = ClientIndex::new();
        index.add("a", "gw:1:");
        index.add("a", "gw:1:");
        assert_eq!(index.lookup("a").len(), 1);
    }

    #[test]
    fn concurrent_add_remove_same_key() {
        let index = Arc::new(ClientIndex::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let index = index.clone();
                std::thread::spawn(move || {
                    for i in 0..200 {
                        let id = format!("gw:{}:", t * 1000 + i);
                        index.add("shared", &id);
                        if i % 2 == 0 {
                            index.remove("shared", &id);
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        // 8 threads × 100 surviving ids each.
        assert_eq!(index.lookup("shared").len(), 800);
    }
}
