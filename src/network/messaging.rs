use async_trait::async_trait;
use log::{debug, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio::time::Duration;

use crate::core::pending::stopping;
use crate::core::{Config, Message, Payload, Status};
use crate::network::Transport;
use crate::network::dht::{Contact, DhtNode, NodeId};
use crate::transfer::Uploader;
use crate::utils::{P2PError, Result};

/// Executes COMMAND frames. The overlay never interprets command text itself.
#[async_trait]
pub trait CommandProcessor: Send + Sync {
    /// `Ok(value)` is answered with status OK, `Err` with FAIL and the error text.
    async fn process(&self, from: &Contact, command: &str) -> Result<String>;
}

/// Logs each command and accepts it.
pub struct LoggingCommandProcessor;

#[async_trait]
impl CommandProcessor for LoggingCommandProcessor {
    async fn process(&self, from: &Contact, command: &str) -> Result<String> {
        info!("Command from {}: {}", from, command);
        Ok(format!("received {} bytes", command.len()))
    }
}

/// Serves inbound connections: answers PING, FIND_NODE, COMMAND and
/// FILE_REQUEST, and refreshes the routing table from every frame's sender.
pub struct MessageHandler {
    dht: Arc<DhtNode>,
    commands: Arc<dyn CommandProcessor>,
    uploader: Arc<Uploader>,
    max_frame_size: usize,
    idle_timeout: Duration,
    request_timeout: Duration,
}

impl MessageHandler {
    pub fn new(
        dht: Arc<DhtNode>,
        commands: Arc<dyn CommandProcessor>,
        uploader: Arc<Uploader>,
        config: &Config,
    ) -> Self {
        Self {
            dht,
            commands,
            uploader,
            max_frame_size: config.max_frame_size,
            idle_timeout: config.idle_connection_timeout,
            request_timeout: config.request_timeout,
        }
    }

    fn local(&self) -> Contact {
        self.dht.local_contact().clone()
    }

    async fn reply<S>(&self, stream: &mut S, message: Message) -> Result<()>
    where
        S: AsyncWrite + Unpin,
    {
        Transport::send_message_within(stream, &message, self.request_timeout).await
    }

    /// Read frames from one inbound connection until it closes, idles out,
    /// misbehaves or the node shuts down.
    ///
    /// A malformed or oversized frame drops the connection and marks the last
    /// sender seen on it suspect. When the very first frame is bad nobody is
    /// known yet, so the connection is only dropped.
    pub async fn handle_connection<S>(&self, mut stream: S, peer: SocketAddr, mut shutdown: watch::Receiver<bool>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut last_sender: Option<NodeId> = None;

        loop {
            let received = tokio::select! {
                _ = stopping(&mut shutdown) => break,
                received = Transport::receive_message_within(&mut stream, self.max_frame_size, self.idle_timeout) => received,
            };

            match received {
                Ok(message) => {
                    last_sender = Some(message.sender.node_id);
                    if let Err(e) = self.dispatch(&mut stream, message).await {
                        if e.is_connection_level() {
                            debug!("Connection from {} lost: {}", peer, e);
                        } else {
                            warn!("Dropping connection from {}: {}", peer, e);
                        }
                        break;
                    }
                }
                Err(e @ (P2PError::MalformedFrame(_) | P2PError::MessageTooLarge(_))) => {
                    warn!("Bad frame from {}: {}", peer, e);
                    match last_sender {
                        Some(id) => self.dht.routing_table().mark_suspect(&id).await,
                        None => debug!("No sender known on {} yet, dropping connection", peer),
                    }
                    break;
                }
                Err(P2PError::Timeout(_)) => {
                    debug!("Connection from {} idle, closing", peer);
                    break;
                }
                Err(P2PError::ConnectionClosed) => {
                    debug!("Connection from {} closed", peer);
                    break;
                }
                Err(e) => {
                    warn!("Error reading from {}: {}", peer, e);
                    break;
                }
            }
        }
    }

    async fn dispatch<S>(&self, stream: &mut S, message: Message) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let sender = message.sender;

        if !matches!(message.payload, Payload::Leave) {
            let dht = self.dht.clone();
            let contact = sender.clone();
            tokio::spawn(async move { dht.observe(contact).await });
        }

        match message.payload {
            Payload::Ping => self.reply(stream, Message::pong(self.local())).await,
            Payload::FindNode { target } => {
                let nodes = self.dht.closest_for(&sender.node_id, &target).await;
                debug!("FIND_NODE {} from {}: returning {} peers", target, sender, nodes.len());
                self.reply(stream, Message::found_nodes(self.local(), nodes)).await
            }
            Payload::Command {
                command,
                should_respond,
            } => {
                let (status, value) = match self.commands.process(&sender, &command).await {
                    Ok(value) => (Status::Ok, value),
                    Err(e) => (Status::Fail, e.to_string()),
                };
                if !should_respond {
                    debug!("Notice from {} handled: {:?}", sender, status);
                    return Ok(());
                }
                self.reply(stream, Message::command_response(self.local(), status, value))
                    .await
            }
            Payload::FileRequest { transfer_id, path } => {
                let outcome = self.uploader.serve(stream, transfer_id, &path).await?;
                debug!("Transfer {} to {} ended: {:?}", transfer_id, sender, outcome);
                Ok(())
            }
            Payload::Leave => {
                self.dht.forget(&sender.node_id).await;
                Ok(())
            }
            Payload::Error { message } => {
                warn!("ERROR frame from {}: {}", sender, message);
                Ok(())
            }
            other => {
                warn!("Unexpected {} from {}", other.kind(), sender);
                let reply = Message::error(self.local(), format!("cannot serve {}", other.kind()));
                self.reply(stream, reply).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::dht::{DhtRpc, Liveness, LookupParams};
    use crate::storage::FileStore;
    use tokio::io::DuplexStream;
    use uuid::Uuid;

    struct Offline;

    #[async_trait]
    impl DhtRpc for Offline {
        async fn ping(&self, addr: SocketAddr) -> Result<Contact> {
            Err(P2PError::ConnectionFailed(addr.to_string()))
        }

        async fn find_node(&self, to: &Contact, _target: NodeId) -> Result<Vec<Contact>> {
            Err(P2PError::ConnectionFailed(to.to_string()))
        }
    }

    struct Rejecting;

    #[async_trait]
    impl CommandProcessor for Rejecting {
        async fn process(&self, _from: &Contact, command: &str) -> Result<String> {
            Err(P2PError::InvalidResponse(format!("unknown command {}", command)))
        }
    }

    fn contact(name: &str, port: u16) -> Contact {
        Contact::new(
            NodeId::from_string(name),
            format!("127.0.0.1:{}", port).parse().unwrap(),
        )
    }

    struct Harness {
        handler: Arc<MessageHandler>,
        dht: Arc<DhtNode>,
        shutdown: watch::Sender<bool>,
    }

    fn harness(commands: Arc<dyn CommandProcessor>) -> Harness {
        let config = Config::default();
        let local = contact("local", 1);
        let dht = Arc::new(DhtNode::new(
            local.clone(),
            Arc::new(Offline),
            LookupParams::from(&config),
        ));
        let root = std::env::temp_dir().join(format!("peer-overlay-msg-{}", Uuid::new_v4()));
        let store = FileStore::new(root.join("shared"), root.join("downloads"));
        let uploader = Arc::new(Uploader::new(local, store, &config));
        let handler = Arc::new(MessageHandler::new(dht.clone(), commands, uploader, &config));
        let (shutdown, _) = watch::channel(false);
        Harness {
            handler,
            dht,
            shutdown,
        }
    }

    fn serve(h: &Harness) -> (DuplexStream, tokio::task::JoinHandle<()>) {
        let (client, server) = tokio::io::duplex(1 << 20);
        let handler = h.handler.clone();
        let rx = h.shutdown.subscribe();
        let task = tokio::spawn(async move {
            handler
                .handle_connection(server, "127.0.0.1:50000".parse().unwrap(), rx)
                .await
        });
        (client, task)
    }

    async fn exchange(stream: &mut DuplexStream, message: Message) -> Message {
        Transport::send_message(stream, &message).await.unwrap();
        Transport::receive_message(stream, 1 << 20).await.unwrap()
    }

    async fn wait_for_entry(dht: &DhtNode, id: &NodeId) {
        for _ in 0..50 {
            if dht.routing_table().get(id).await.is_some() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{} never entered the routing table", id);
    }

    #[tokio::test]
    async fn test_ping_answered_and_sender_learned() {
        let h = harness(Arc::new(LoggingCommandProcessor));
        let (mut client, _task) = serve(&h);
        let remote = contact("remote", 2);

        let reply = exchange(&mut client, Message::ping(remote.clone())).await;
        assert_eq!(reply.kind(), "PONG");
        assert_eq!(reply.sender.node_id, NodeId::from_string("local"));

        wait_for_entry(&h.dht, &remote.node_id).await;
    }

    #[tokio::test]
    async fn test_find_node_excludes_requester() {
        let h = harness(Arc::new(LoggingCommandProcessor));
        let requester = contact("requester", 2);
        let other = contact("other", 3);
        h.dht.observe(requester.clone()).await;
        h.dht.observe(other.clone()).await;

        let (mut client, _task) = serve(&h);
        let reply = exchange(
            &mut client,
            Message::find_node(requester.clone(), requester.node_id),
        )
        .await;

        match reply.payload {
            Payload::FoundNodes { nodes } => assert_eq!(nodes, vec![other]),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_command_statuses() {
        let h = harness(Arc::new(LoggingCommandProcessor));
        let (mut client, _task) = serve(&h);
        let reply = exchange(&mut client, Message::command(contact("r", 2), "hello".into())).await;
        assert!(matches!(
            reply.payload,
            Payload::CommandResponse { status: Status::Ok, .. }
        ));

        let h = harness(Arc::new(Rejecting));
        let (mut client, _task) = serve(&h);
        let reply = exchange(&mut client, Message::command(contact("r", 2), "rm".into())).await;
        match reply.payload {
            Payload::CommandResponse { status, value } => {
                assert_eq!(status, Status::Fail);
                assert!(value.contains("unknown command rm"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_notice_runs_without_response() {
        let h = harness(Arc::new(LoggingCommandProcessor));
        let (mut client, _task) = serve(&h);

        Transport::send_message(&mut client, &Message::notice(contact("r", 2), "reload".into()))
            .await
            .unwrap();
        // The next frame back answers the PING, not the notice
        let reply = exchange(&mut client, Message::ping(contact("r", 2))).await;
        assert_eq!(reply.kind(), "PONG");
    }

    #[tokio::test]
    async fn test_unexpected_frame_gets_error() {
        let h = harness(Arc::new(LoggingCommandProcessor));
        let (mut client, _task) = serve(&h);
        let reply = exchange(&mut client, Message::pong(contact("r", 2))).await;
        assert_eq!(reply.kind(), "ERROR");
    }

    #[tokio::test]
    async fn test_malformed_frame_drops_connection_and_marks_sender() {
        let h = harness(Arc::new(LoggingCommandProcessor));
        let (mut client, task) = serve(&h);
        let remote = contact("remote", 2);

        exchange(&mut client, Message::ping(remote.clone())).await;
        wait_for_entry(&h.dht, &remote.node_id).await;

        Transport::send_data(&mut client, b"{not a frame").await.unwrap();
        task.await.unwrap();

        assert_eq!(
            h.dht.routing_table().get(&remote.node_id).await.unwrap().liveness,
            Liveness::Suspect
        );
    }

    #[tokio::test]
    async fn test_oversized_frame_treated_as_malformed() {
        use tokio::io::AsyncWriteExt;

        let h = harness(Arc::new(LoggingCommandProcessor));
        let (mut client, task) = serve(&h);
        let remote = contact("remote", 2);

        exchange(&mut client, Message::ping(remote.clone())).await;
        wait_for_entry(&h.dht, &remote.node_id).await;

        // Length prefix far beyond the frame limit
        client.write_u32(u32::MAX).await.unwrap();
        task.await.unwrap();

        assert_eq!(
            h.dht.routing_table().get(&remote.node_id).await.unwrap().liveness,
            Liveness::Suspect
        );
    }

    #[tokio::test]
    async fn test_bad_first_frame_only_drops_connection() {
        let h = harness(Arc::new(LoggingCommandProcessor));
        let (mut client, task) = serve(&h);

        Transport::send_data(&mut client, b"garbage").await.unwrap();
        task.await.unwrap();

        assert!(h.dht.routing_table().is_empty().await);
    }

    #[tokio::test]
    async fn test_leave_removes_sender() {
        let h = harness(Arc::new(LoggingCommandProcessor));
        let remote = contact("remote", 2);
        h.dht.observe(remote.clone()).await;

        let (mut client, _task) = serve(&h);
        Transport::send_message(&mut client, &Message::leave(remote.clone()))
            .await
            .unwrap();
        // A follow-up exchange guarantees the LEAVE was processed
        exchange(&mut client, Message::ping(contact("other", 3))).await;

        assert!(h.dht.routing_table().get(&remote.node_id).await.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_ends_idle_connection() {
        let h = harness(Arc::new(LoggingCommandProcessor));
        let (_client, task) = serve(&h);
        h.shutdown.send(true).unwrap();
        task.await.unwrap();
    }
}
