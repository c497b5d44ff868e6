//! Hub control messages.
//!
//! Control frames reuse the signal frame header with the reserved type tag
//! [`CONTROL_TAG`](crate::codec::CONTROL_TAG). Their payload is a JSON object
//! tagged by `_ctrl`:
//!
//! ```text
//! client -> hub   {"_ctrl":"register","agent_id":"billing","neural_hash":"<hex>"}
//! hub -> client   {"_ctrl":"registered","peers":{"sales":"<hex>"}}
//! hub -> client   {"_ctrl":"peer_joined","agent_id":"support","neural_hash":"<hex>"}
//! hub -> client   {"_ctrl":"peer_left","agent_id":"sales"}
//! ```

use neural_types::Identity;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Messages exchanged with a hub outside the signal flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "_ctrl", rename_all = "snake_case")]
pub enum ControlMessage {
    /// First frame on every connection: announce name and identity.
    Register {
        agent_id: String,
        neural_hash: Identity,
    },
    /// Registration accepted, with the hub's current directory.
    Registered {
        #[serde(default)]
        peers: HashMap<String, Identity>,
    },
    /// Registration refused.
    Rejected { reason: String },
    /// Another agent registered with the hub.
    PeerJoined {
        agent_id: String,
        neural_hash: Identity,
    },
    /// An agent disconnected from the hub.
    PeerLeft { agent_id: String },
}

/// Name to identity map kept current from hub control messages.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerDirectory {
    peers: HashMap<String, Identity>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one control message into the directory. Returns `true` if the
    /// message was a directory update.
    pub fn apply(&mut self, message: &ControlMessage) -> bool {
        match message {
            ControlMessage::Registered { peers } => {
                self.peers = peers.clone();
                true
            }
            ControlMessage::PeerJoined {
                agent_id,
                neural_hash,
            } => {
                self.peers.insert(agent_id.clone(), *neural_hash);
                true
            }
            ControlMessage::PeerLeft { agent_id } => {
                self.peers.remove(agent_id);
                true
            }
            ControlMessage::Register { .. } | ControlMessage::Rejected { .. } => false,
        }
    }

    pub fn resolve(&self, name: &str) -> Option<Identity> {
        self.peers.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Known peer names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.peers.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn id(name: &str) -> Identity {
        Identity::derive(name, Some(b"control-test")).unwrap()
    }

    #[test]
    fn test_register_json_shape() {
        let msg = ControlMessage::Register {
            agent_id: "billing".into(),
            neural_hash: id("billing"),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({
                "_ctrl": "register",
                "agent_id": "billing",
                "neural_hash": id("billing").to_string(),
            })
        );
    }

    #[test]
    fn test_registered_without_peers_parses() {
        let msg: ControlMessage = serde_json::from_value(json!({"_ctrl": "registered"})).unwrap();
        assert_eq!(
            msg,
            ControlMessage::Registered {
                peers: HashMap::new()
            }
        );
    }

    #[test]
    fn test_unknown_control_rejected() {
        let parsed: Result<ControlMessage, _> =
            serde_json::from_value(json!({"_ctrl": "discover_result"}));
        assert!(parsed.is_err());
    }

    #[test]
    fn test_directory_follows_hub_updates() {
        let mut dir = PeerDirectory::new();
        assert!(dir.apply(&ControlMessage::Registered {
            peers: HashMap::from([("sales".to_string(), id("sales"))]),
        }));
        assert_eq!(dir.resolve("sales"), Some(id("sales")));

        dir.apply(&ControlMessage::PeerJoined {
            agent_id: "support".into(),
            neural_hash: id("support"),
        });
        assert_eq!(dir.names(), vec!["sales", "support"]);

        dir.apply(&ControlMessage::PeerLeft {
            agent_id: "sales".into(),
        });
        assert_eq!(dir.resolve("sales"), None);
        assert_eq!(dir.len(), 1);

        assert!(!dir.apply(&ControlMessage::Rejected {
            reason: "full".into()
        }));
        assert_eq!(dir.len(), 1);

        // A fresh registration replaces the whole directory.
        dir.apply(&ControlMessage::Registered {
            peers: HashMap::new(),
        });
        assert!(dir.is_empty());
    }
}
