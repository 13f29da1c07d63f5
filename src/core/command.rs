use log::{debug, info, warn};
use std::fmt;
use std::sync::Arc;
use tokio::time::Duration;

use crate::core::{Message, Payload, Status};
use crate::network::ConnectionManager;
use crate::network::dht::{Contact, DhtNode, NodeId};
use crate::utils::{P2PError, Result};

/// The remote peer's answer to a COMMAND.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    pub peer: Contact,
    pub status: Status,
    pub value: String,
}

impl CommandOutcome {
    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }
}

impl fmt::Display for CommandOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match self.status {
            Status::Ok => "OK",
            Status::Fail => "FAIL",
        };
        write!(f, "{} from {}: {}", status, self.peer, self.value)
    }
}

/// Sends opaque command text to a peer addressed by id.
pub struct CommandDispatcher {
    local: Contact,
    dht: Arc<DhtNode>,
    connections: Arc<ConnectionManager>,
    request_timeout: Duration,
}

impl CommandDispatcher {
    pub fn new(dht: Arc<DhtNode>, connections: Arc<ConnectionManager>, request_timeout: Duration) -> Self {
        Self {
            local: dht.local_contact().clone(),
            dht,
            connections,
            request_timeout,
        }
    }

    /// Garbage marks the peer suspect; silence or a broken connection counts
    /// as a failed probe.
    async fn note_failure(&self, peer: &Contact, error: &P2PError) {
        let table = self.dht.routing_table();
        match error {
            P2PError::MalformedFrame(_) | P2PError::MessageTooLarge(_) => table.mark_suspect(&peer.node_id).await,
            P2PError::Timeout(_) => {
                table.mark_failed(&peer.node_id).await;
            }
            e if e.is_connection_level() => {
                table.mark_failed(&peer.node_id).await;
            }
            _ => {}
        }
        warn!("Command to {} failed: {}", peer, error);
    }

    /// Resolve `peer_id`, deliver `text` and wait for COMMAND_RESPONSE.
    /// Resolution, connection and timeout failures come back as distinct errors.
    pub async fn send_command(&self, text: &str, peer_id: NodeId) -> Result<CommandOutcome> {
        let peer = self.dht.resolve(peer_id).await?;
        debug!("Sending command to {}", peer);

        let request = Message::command(self.local.clone(), text.to_string());
        let response = match self
            .connections
            .request(peer.addr, &request, self.request_timeout)
            .await
        {
            Ok(response) => response,
            Err(e) => {
                self.note_failure(&peer, &e).await;
                return Err(e);
            }
        };

        match response.payload {
            Payload::CommandResponse { status, value } => {
                self.dht.observe(response.sender).await;
                let outcome = CommandOutcome { peer, status, value };
                info!("Command result: {}", outcome);
                Ok(outcome)
            }
            Payload::Error { message } => Err(P2PError::InvalidResponse(format!(
                "{} refused the command: {}",
                peer, message
            ))),
            other => Err(P2PError::InvalidResponse(format!(
                "expected COMMAND_RESPONSE from {}, got {}",
                peer,
                other.kind()
            ))),
        }
    }

    /// Resolve `peer_id` and deliver `text` without asking for a response.
    /// Returns the contact the command went to.
    pub async fn notify(&self, text: &str, peer_id: NodeId) -> Result<Contact> {
        let peer = self.dht.resolve(peer_id).await?;
        let notice = Message::notice(self.local.clone(), text.to_string());
        if let Err(e) = self
            .connections
            .send(peer.addr, &notice, self.request_timeout)
            .await
        {
            self.note_failure(&peer, &e).await;
            return Err(e);
        }
        debug!("Notice delivered to {}", peer);
        Ok(peer)
    }
}
