use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::network::dht::{Contact, NodeId};

/// A typed frame. Every frame names its sender so the receiver can refresh
/// its routing table as a side effect of any exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub sender: Contact,
    pub timestamp: u64,
    pub payload: Payload,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Ok,
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Payload {
    // Liveness
    Ping,
    Pong,
    Leave,

    // Lookup
    FindNode {
        target: NodeId,
    },
    FoundNodes {
        nodes: Vec<Contact>,
    },

    // Commands
    Command {
        command: String,
        /// When false the receiver runs the command but sends no COMMAND_RESPONSE.
        #[serde(default = "responds_by_default")]
        should_respond: bool,
    },
    CommandResponse {
        status: Status,
        value: String,
    },

    // File transfer
    FileRequest {
        transfer_id: Uuid,
        path: String,
    },
    FileChunk {
        transfer_id: Uuid,
        seq: u64,
        total_size: u64,
        #[serde(with = "hex_bytes")]
        data: Vec<u8>,
        checksum: String,
    },
    FileAck {
        transfer_id: Uuid,
        seq: u64,
    },
    FileRetry {
        transfer_id: Uuid,
        seq: u64,
    },
    FileAbort {
        transfer_id: Uuid,
        reason: String,
    },
    FileNotFound {
        transfer_id: Uuid,
        path: String,
    },
    FileEnd {
        transfer_id: Uuid,
        chunks: u64,
        total_size: u64,
    },

    Error {
        message: String,
    },
}

impl Payload {
    /// Frame type name as it appears on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Ping => "PING",
            Payload::Pong => "PONG",
            Payload::Leave => "LEAVE",
            Payload::FindNode { .. } => "FIND_NODE",
            Payload::FoundNodes { .. } => "FOUND_NODES",
            Payload::Command { .. } => "COMMAND",
            Payload::CommandResponse { .. } => "COMMAND_RESPONSE",
            Payload::FileRequest { .. } => "FILE_REQUEST",
            Payload::FileChunk { .. } => "FILE_CHUNK",
            Payload::FileAck { .. } => "FILE_ACK",
            Payload::FileRetry { .. } => "FILE_RETRY",
            Payload::FileAbort { .. } => "FILE_ABORT",
            Payload::FileNotFound { .. } => "FILE_NOT_FOUND",
            Payload::FileEnd { .. } => "FILE_END",
            Payload::Error { .. } => "ERROR",
        }
    }
}

impl Message {
    pub fn new(sender: Contact, payload: Payload) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender,
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
            payload,
        }
    }

    pub fn kind(&self) -> &'static str {
        self.payload.kind()
    }

    pub fn ping(sender: Contact) -> Self {
        Self::new(sender, Payload::Ping)
    }

    pub fn pong(sender: Contact) -> Self {
        Self::new(sender, Payload::Pong)
    }

    pub fn leave(sender: Contact) -> Self {
        Self::new(sender, Payload::Leave)
    }

    pub fn find_node(sender: Contact, target: NodeId) -> Self {
        Self::new(sender, Payload::FindNode { target })
    }

    pub fn found_nodes(sender: Contact, nodes: Vec<Contact>) -> Self {
        Self::new(sender, Payload::FoundNodes { nodes })
    }

    pub fn command(sender: Contact, command: String) -> Self {
        Self::new(
            sender,
            Payload::Command {
                command,
                should_respond: true,
            },
        )
    }

    /// COMMAND the receiver must not answer.
    pub fn notice(sender: Contact, command: String) -> Self {
        Self::new(
            sender,
            Payload::Command {
                command,
                should_respond: false,
            },
        )
    }

    pub fn command_response(sender: Contact, status: Status, value: String) -> Self {
        Self::new(sender, Payload::CommandResponse { status, value })
    }

    pub fn file_request(sender: Contact, transfer_id: Uuid, path: String) -> Self {
        Self::new(sender, Payload::FileRequest { transfer_id, path })
    }

    pub fn error(sender: Contact, message: String) -> Self {
        Self::new(sender, Payload::Error { message })
    }
}

fn responds_by_default() -> bool {
    true
}

/// Binary payloads travel as hex strings inside JSON frames.
mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}
