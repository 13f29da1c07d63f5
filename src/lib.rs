//! Peer-to-peer overlay network.
//!
//! Peers join through a bootstrap node, keep a Kademlia-style routing table,
//! and address each other by 160-bit id to exchange text commands and files.

pub mod core;
pub mod network;
pub mod storage;
pub mod transfer;
pub mod utils;

// Re-export main types
pub use core::{CommandOutcome, Config, Message, Node, Payload, Status};
pub use network::CommandProcessor;
pub use network::dht::{Contact, Liveness, LookupOutcome, NodeId, RoutingSnapshot};
pub use transfer::TransferReport;
pub use utils::{
    error::{P2PError, Result},
    setup_logging,
};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
