use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::time::Duration;

use crate::core::{Message, Payload};
use crate::network::ConnectionManager;
use crate::utils::{P2PError, Result};

use super::contact::Contact;
use super::node_id::NodeId;

/// Remote procedure calls the lookup protocol needs from the network.
#[async_trait]
pub trait DhtRpc: Send + Sync {
    /// PING `addr`; the PONG sender is returned so unknown ids can be learned.
    async fn ping(&self, addr: SocketAddr) -> Result<Contact>;

    /// FIND_NODE(target) sent to `to`; returns the contacts it knows closest to `target`.
    async fn find_node(&self, to: &Contact, target: NodeId) -> Result<Vec<Contact>>;

    /// Best-effort LEAVE notification.
    async fn leave(&self, _to: &Contact) -> Result<()> {
        Ok(())
    }
}

/// `DhtRpc` over the pooled TCP connections.
pub struct TcpRpc {
    local: Contact,
    connections: Arc<ConnectionManager>,
    request_timeout: Duration,
}

impl TcpRpc {
    pub fn new(local: Contact, connections: Arc<ConnectionManager>, request_timeout: Duration) -> Self {
        Self {
            local,
            connections,
            request_timeout,
        }
    }
}

#[async_trait]
impl DhtRpc for TcpRpc {
    async fn ping(&self, addr: SocketAddr) -> Result<Contact> {
        let response = self
            .connections
            .request(addr, &Message::ping(self.local.clone()), self.request_timeout)
            .await?;
        match response.payload {
            Payload::Pong => Ok(response.sender),
            other => Err(P2PError::InvalidResponse(format!(
                "expected PONG from {}, got {}",
                addr,
                other.kind()
            ))),
        }
    }

    async fn find_node(&self, to: &Contact, target: NodeId) -> Result<Vec<Contact>> {
        let response = self
            .connections
            .request(
                to.addr,
                &Message::find_node(self.local.clone(), target),
                self.request_timeout,
            )
            .await?;

        if response.sender.node_id != to.node_id {
            return Err(P2PError::InvalidResponse(format!(
                "{} answered as {}",
                to, response.sender.node_id
            )));
        }
        match response.payload {
            Payload::FoundNodes { nodes } => Ok(nodes),
            other => Err(P2PError::InvalidResponse(format!(
                "expected FOUND_NODES from {}, got {}",
                to,
                other.kind()
            ))),
        }
    }

    async fn leave(&self, to: &Contact) -> Result<()> {
        self.connections
            .send(to.addr, &Message::leave(self.local.clone()), self.request_timeout)
            .await
    }
}
