use log::{debug, error, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::fs as async_fs;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, lookup_host};
use tokio::sync::{Mutex, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Duration, MissedTickBehavior, interval, sleep, timeout};

use crate::core::pending::stopping;
use crate::core::{CommandDispatcher, CommandOutcome, Config, PendingRequests, RequestKind};
use crate::network::dht::{Contact, DhtNode, LookupOutcome, LookupParams, NodeId, RoutingSnapshot, TcpRpc};
use crate::network::{CommandProcessor, ConnectionManager, LoggingCommandProcessor, MessageHandler, Transport};
use crate::storage::FileStore;
use crate::transfer::{Downloader, TransferReport, Uploader};
use crate::utils::{P2PError, Result};

/// One overlay participant: the listener, routing state and the outbound
/// operations the driver calls.
pub struct Node {
    config: Config,
    local: Contact,
    bound_addr: SocketAddr,
    dht: Arc<DhtNode>,
    connections: Arc<ConnectionManager>,
    pending: Arc<PendingRequests>,
    commands: CommandDispatcher,
    downloader: Downloader,
    store: FileStore,
    command_processor: Arc<dyn CommandProcessor>,
    listener: Mutex<Option<TcpListener>>,
    inbound: Arc<Mutex<JoinSet<()>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl Node {
    /// Bind the listener and build an empty routing table under a fresh id.
    /// Nothing is served until `create_network` or `join_network`.
    pub async fn bind(config: Config) -> Result<Self> {
        config.validate()?;

        async_fs::create_dir_all(&config.shared_dir)
            .await
            .map_err(|e| P2PError::IoError(format!("Failed to create directory: {}", e)))?;

        let listener = Transport::listen(config.listen_addr).await?;
        let bound_addr = listener.local_addr()?;
        let local = Contact::new(NodeId::random(), config.advertised(bound_addr));

        let connections = Arc::new(ConnectionManager::new(&config));
        let rpc = Arc::new(TcpRpc::new(local.clone(), connections.clone(), config.probe_timeout));
        let dht = Arc::new(DhtNode::new(local.clone(), rpc, LookupParams::from(&config)));
        let store = FileStore::new(config.shared_dir.clone(), config.download_dir.clone());
        let commands = CommandDispatcher::new(dht.clone(), connections.clone(), config.request_timeout);
        let downloader = Downloader::new(local.clone(), store.clone(), &config);

        info!(
            "Node {:#} ({}) bound to {}, advertising {}",
            local.node_id, config.node_name, bound_addr, local.addr
        );

        Ok(Self {
            config,
            local,
            bound_addr,
            dht,
            connections,
            pending: Arc::new(PendingRequests::new()),
            commands,
            downloader,
            store,
            command_processor: Arc::new(LoggingCommandProcessor),
            listener: Mutex::new(Some(listener)),
            inbound: Arc::new(Mutex::new(JoinSet::new())),
            tasks: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        })
    }

    /// Replace the default command processor. Takes effect when serving starts.
    pub fn with_command_processor(mut self, processor: Arc<dyn CommandProcessor>) -> Self {
        self.command_processor = processor;
        self
    }

    pub fn local_contact(&self) -> &Contact {
        &self.local
    }

    pub fn node_id(&self) -> NodeId {
        self.local.node_id
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.bound_addr
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn ensure_running(&self) -> Result<()> {
        if self.pending.is_shutting_down() {
            Err(P2PError::ShuttingDown)
        } else {
            Ok(())
        }
    }

    /// Start the acceptor and maintenance loop once.
    async fn start_services(&self) -> Result<()> {
        self.ensure_running()?;
        let Some(listener) = self.listener.lock().await.take() else {
            return Ok(());
        };

        let uploader = Arc::new(Uploader::new(self.local.clone(), self.store.clone(), &self.config));
        let handler = Arc::new(MessageHandler::new(
            self.dht.clone(),
            self.command_processor.clone(),
            uploader,
            &self.config,
        ));

        let acceptor = tokio::spawn(accept_loop(
            listener,
            handler,
            self.inbound.clone(),
            self.pending.subscribe(),
        ));
        let maintenance = tokio::spawn(maintenance_loop(
            self.dht.clone(),
            self.connections.clone(),
            self.config.maintenance_interval,
            self.pending.subscribe(),
        ));

        self.tasks.lock().await.extend([acceptor, maintenance]);
        info!("Serving on {}", self.bound_addr);
        Ok(())
    }

    /// Found a one-node network. Peers find us only by contacting us directly.
    pub async fn create_network(&self) -> Result<()> {
        self.start_services().await?;
        info!("Created a new network as {:#}", self.local.node_id);
        Ok(())
    }

    /// Join through `bootstrap` (`host:port`). On failure the node keeps
    /// serving as a standalone network.
    pub async fn join_network(&self, bootstrap: &str) -> Result<LookupOutcome> {
        self.start_services().await?;

        let addr = lookup_host(bootstrap)
            .await
            .map_err(|e| P2PError::UnreachablePeer(format!("cannot resolve {}: {}", bootstrap, e)))?
            .next()
            .ok_or_else(|| P2PError::UnreachablePeer(format!("no address for {}", bootstrap)))?;

        let outcome = self
            .pending
            .run(RequestKind::Join, Some(self.local.node_id), None, self.dht.bootstrap(addr))
            .await;

        match &outcome {
            Ok(_) => info!(
                "Joined the network via {}: {} peers known",
                bootstrap,
                self.dht.routing_table().len().await
            ),
            Err(e) => warn!("Join via {} failed: {}", bootstrap, e),
        }
        outcome
    }

    pub async fn get_routing_table(&self) -> RoutingSnapshot {
        self.dht.routing_table().snapshot().await
    }

    fn command_deadline(&self) -> Duration {
        self.config.lookup_timeout + self.config.probe_timeout + self.config.request_timeout * 2
    }

    /// Deliver `text` to the peer with hex id `peer_id`.
    pub async fn send_command(&self, text: &str, peer_id: &str) -> Result<CommandOutcome> {
        self.ensure_running()?;
        let target = NodeId::from_hex(peer_id)?;
        self.pending
            .run(
                RequestKind::Command,
                Some(target),
                Some(self.command_deadline()),
                self.commands.send_command(text, target),
            )
            .await
    }

    /// Deliver `text` to the peer with hex id `peer_id` without waiting for a
    /// COMMAND_RESPONSE.
    pub async fn notify_command(&self, text: &str, peer_id: &str) -> Result<Contact> {
        self.ensure_running()?;
        let target = NodeId::from_hex(peer_id)?;
        self.pending
            .run(
                RequestKind::Command,
                Some(target),
                Some(self.command_deadline()),
                self.commands.notify(text, target),
            )
            .await
    }

    /// Fetch `path` from the peer with hex id `peer_id` into the download dir.
    pub async fn request_file(&self, path: &str, peer_id: &str) -> Result<TransferReport> {
        self.ensure_running()?;
        let target = NodeId::from_hex(peer_id)?;

        let transfer = async {
            let peer = self.dht.resolve(target).await?;
            let mut stream = self.connections.open_dedicated(peer.addr).await?;
            let result = self.downloader.fetch(&mut stream, &peer, path).await;
            if let Err(e) = stream.shutdown().await {
                debug!("Error closing transfer connection to {}: {}", peer, e);
            }
            result
        };

        self.pending
            .run(RequestKind::FileTransfer, Some(target), None, transfer)
            .await
    }

    /// Stop the node: fail pending requests, tell peers we are leaving, stop
    /// accepting, give inbound handlers the grace period, close connections.
    pub async fn shutdown(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Shutting down node {:#}", self.local.node_id);

        let failed = self.pending.begin_shutdown();
        if failed > 0 {
            info!("Cancelled {} pending requests", failed);
        }

        self.dht.announce_leave().await;

        for task in self.tasks.lock().await.drain(..) {
            if let Err(e) = task.await {
                debug!("Background task ended abnormally: {}", e);
            }
        }

        let mut inbound = self.inbound.lock().await;
        let grace = self.config.shutdown_grace;
        let drained = timeout(grace, async {
            while inbound.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("Inbound handlers still running after {:?}, aborting", grace);
            inbound.abort_all();
            while inbound.join_next().await.is_some() {}
        }
        drop(inbound);

        self.connections.close_all().await;
        info!("Node {:#} stopped", self.local.node_id);
        Ok(())
    }
}

async fn accept_loop(
    listener: TcpListener,
    handler: Arc<MessageHandler>,
    inbound: Arc<Mutex<JoinSet<()>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let accepted = tokio::select! {
            _ = stopping(&mut shutdown) => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, addr)) => {
                debug!("New connection from: {}", addr);
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("Failed to set TCP_NODELAY for {}: {}", addr, e);
                }

                let handler = handler.clone();
                let rx = shutdown.clone();
                let mut handlers = inbound.lock().await;
                while handlers.try_join_next().is_some() {}
                handlers.spawn(async move { handler.handle_connection(stream, addr, rx).await });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
                sleep(Duration::from_millis(100)).await;
            }
        }
    }
    info!("Listener stopped");
}

async fn maintenance_loop(
    dht: Arc<DhtNode>,
    connections: Arc<ConnectionManager>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick fires immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = stopping(&mut shutdown) => break,
            _ = ticker.tick() => {}
        }

        let (probed, evicted) = dht.maintain().await;
        let stale = connections.cleanup_stale_connections().await;
        debug!(
            "Maintenance: probed {} suspects, evicted {} peers, closed {} idle connections",
            probed,
            evicted,
            stale.len()
        );
    }
}
