//! Static deployment configuration.
//!
//! Peer addressing is a fixed table of node ids to `host:port` strings, set
//! at startup. There is no configuration file and no environment lookup; the
//! process takes only the node id selecting its own entry.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{anyhow, Result};

/// Current leader/epoch identifier. View changes are out of scope, so this
/// is fixed for the process lifetime.
#[derive(Debug, Clone)]
pub struct View {
    pub view_id: i64,
    pub leader: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// This replica's identifier, present in `peers`.
    pub node_id: String,
    /// Node id to `host:port` for every replica in the group.
    pub peers: HashMap<String, String>,
    pub view: View,
    /// Maximum tolerated faulty replicas.
    pub f: usize,
    /// Interval between alarm pulses that re-flush the message buffer.
    pub alarm_interval: Duration,
    /// Capacity of the entrance and delivery channels.
    pub channel_capacity: usize,
}

fn default_peer_table() -> HashMap<String, String> {
    HashMap::from([
        ("node1".to_string(), "localhost:1111".to_string()),
        ("node2".to_string(), "localhost:2222".to_string()),
        ("node3".to_string(), "localhost:3333".to_string()),
        ("node4".to_string(), "localhost:4444".to_string()),
    ])
}

impl Config {
    /// Build the reference four-replica deployment for the given node id.
    pub fn new(node_id: &str) -> Result<Self> {
        let peers = default_peer_table();
        if !peers.contains_key(node_id) {
            return Err(anyhow!("unknown node id {node_id}, expected one of node1..node4"));
        }

        Ok(Self {
            node_id: node_id.to_string(),
            peers,
            view: View {
                view_id: 0,
                leader: "node1".to_string(),
            },
            f: 1,
            alarm_interval: Duration::from_secs(1),
            channel_capacity: 1000,
        })
    }

    /// Vote threshold for advancing a phase: `2f` matching votes from
    /// distinct senders. This counts peer votes only, with no implicit vote
    /// for the replica's own prior phase message (textbook PBFT counts that
    /// vote and requires `2f + 1`).
    pub fn quorum(&self) -> usize {
        2 * self.f
    }

    /// This replica's own listen address from the peer table.
    pub fn listen_addr(&self) -> &str {
        // node_id membership is checked at construction
        &self.peers[&self.node_id]
    }

    /// Address of the current view leader, the reply destination.
    pub fn leader_addr(&self) -> Option<&str> {
        self.peers.get(&self.view.leader).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_node_resolves_listen_addr() {
        let config = Config::new("node2").unwrap();
        assert_eq!(config.listen_addr(), "localhost:2222");
        assert_eq!(config.leader_addr(), Some("localhost:1111"));
    }

    #[test]
    fn unknown_node_is_rejected() {
        assert!(Config::new("node9").is_err());
    }

    #[test]
    fn quorum_is_twice_f() {
        let config = Config::new("node1").unwrap();
        assert_eq!(config.f, 1);
        assert_eq!(config.quorum(), 2);
    }
}
