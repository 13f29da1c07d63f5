//! Kademlia-style membership and routing.
//!
//! Peers are addressed by 160-bit ids; closeness is XOR distance. The routing
//! table buckets peers by shared id prefix with the local node, and the lookup
//! protocol walks towards a target id by asking the closest known peers for
//! theirs.

mod contact;
mod dht_node;
mod node_id;
mod routing_table;
mod rpc;

pub use contact::Contact;
pub use dht_node::{DhtNode, LookupOutcome, LookupParams};
pub use node_id::{Distance, ID_BITS, ID_LEN, NodeId};
pub use routing_table::{
    InsertOutcome, K, Liveness, PeerRecord, RoutingSnapshot, RoutingTable, SnapshotEntry,
};
pub use rpc::{DhtRpc, TcpRpc};
