use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;

use super::node_id::NodeId;

/// Identifier + address of a peer, as carried in every frame.
/// Never holds a connection; connections are opened on demand from `addr`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Contact {
    pub node_id: NodeId,
    pub addr: SocketAddr,
}

impl Contact {
    pub fn new(node_id: NodeId, addr: SocketAddr) -> Self {
        Self { node_id, addr }
    }
}

impl fmt::Display for Contact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.node_id, self.addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contact_creation() {
        let node_id = NodeId::random();
        let addr = "127.0.0.1:8080".parse().unwrap();
        let contact = Contact::new(node_id, addr);

        assert_eq!(contact.node_id, node_id);
        assert_eq!(contact.addr, addr);
    }

    #[test]
    fn test_contact_wire_form() {
        let contact = Contact::new(NodeId::from_string("a"), "10.0.0.1:9000".parse().unwrap());
        let value = serde_json::to_value(&contact).unwrap();
        assert_eq!(value["addr"], "10.0.0.1:9000");
        assert_eq!(value["node_id"], contact.node_id.to_hex());
    }
}
