use log::{debug, info, warn};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio::time::{Duration, Instant, sleep, timeout};

use crate::core::Config;
use crate::utils::{P2PError, Result};

use super::contact::Contact;
use super::node_id::{Distance, NodeId};
use super::routing_table::{InsertOutcome, Liveness, RoutingTable};
use super::rpc::DhtRpc;

/// Tunables for lookups and liveness checks.
#[derive(Clone, Debug)]
pub struct LookupParams {
    pub k: usize,
    pub alpha: usize,
    pub max_rounds: usize,
    pub lookup_timeout: Duration,
    pub probe_timeout: Duration,
    pub bootstrap_retries: u32,
    pub bootstrap_backoff: Duration,
}

impl From<&Config> for LookupParams {
    fn from(config: &Config) -> Self {
        Self {
            k: config.bucket_size,
            alpha: config.lookup_parallelism,
            max_rounds: config.max_lookup_rounds,
            lookup_timeout: config.lookup_timeout,
            probe_timeout: config.probe_timeout,
            bootstrap_retries: config.bootstrap_retries,
            bootstrap_backoff: config.bootstrap_backoff,
        }
    }
}

/// How an iterative lookup ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LookupOutcome {
    /// The target itself was reached or learned
    Found(Contact),
    /// Stopped on a bound; closest contacts known, ascending by distance
    Partial(Vec<Contact>),
    /// Nobody answered
    Exhausted,
}

impl LookupOutcome {
    pub fn closest(&self) -> Vec<Contact> {
        match self {
            LookupOutcome::Found(contact) => vec![contact.clone()],
            LookupOutcome::Partial(contacts) => contacts.clone(),
            LookupOutcome::Exhausted => Vec::new(),
        }
    }
}

/// Membership and routing: keeps the routing table fresh and resolves ids to live peers.
pub struct DhtNode {
    local: Contact,
    table: Arc<RoutingTable>,
    rpc: Arc<dyn DhtRpc>,
    params: LookupParams,
}

fn sort_by_distance(contacts: &mut [Contact], target: &NodeId) {
    contacts.sort_by(|a, b| {
        a.node_id
            .distance(target)
            .cmp(&b.node_id.distance(target))
            .then_with(|| a.node_id.cmp(&b.node_id))
    });
}

impl DhtNode {
    pub fn new(local: Contact, rpc: Arc<dyn DhtRpc>, params: LookupParams) -> Self {
        let table = Arc::new(RoutingTable::with_bucket_size(local.node_id, params.k));
        Self {
            local,
            table,
            rpc,
            params,
        }
    }

    pub fn local_contact(&self) -> &Contact {
        &self.local
    }

    pub fn node_id(&self) -> NodeId {
        self.local.node_id
    }

    pub fn routing_table(&self) -> &Arc<RoutingTable> {
        &self.table
    }

    /// Record a peer we exchanged frames with directly.
    pub async fn observe(&self, contact: Contact) {
        if let InsertOutcome::Full { oldest } = self.table.insert(contact.clone()).await {
            self.settle_full_bucket(oldest, contact).await;
        }
    }

    /// Record a peer someone else told us about.
    pub async fn learn(&self, contact: Contact) {
        if let InsertOutcome::Full { oldest } = self.table.insert_learned(contact.clone()).await {
            self.settle_full_bucket(oldest, contact).await;
        }
    }

    async fn settle_full_bucket(&self, oldest: Contact, candidate: Contact) {
        let alive = self.probe(&oldest).await;
        if self.table.apply_probe_result(&oldest.node_id, alive, candidate.clone()).await {
            info!("Evicted {} in favour of {}", oldest, candidate);
        }
    }

    /// PING round trip bounded by the probe timeout. Updates liveness either way.
    pub async fn probe(&self, contact: &Contact) -> bool {
        let outcome = timeout(self.params.probe_timeout, self.rpc.ping(contact.addr)).await;
        match outcome {
            Ok(Ok(pong)) if pong.node_id == contact.node_id => {
                self.table.mark_alive(&contact.node_id).await;
                return true;
            }
            Ok(Ok(pong)) => {
                warn!("{} answered PING as {}", contact, pong.node_id);
            }
            Ok(Err(e)) => {
                debug!("Probe of {} failed: {}", contact, e);
            }
            Err(_) => {
                debug!("Probe of {} timed out", contact);
            }
        }
        self.table.mark_failed(&contact.node_id).await;
        false
    }

    /// Iterative FIND_NODE towards `target`.
    pub async fn iterative_lookup(&self, target: NodeId) -> LookupOutcome {
        self.lookup_from(target, Vec::new()).await
    }

    async fn lookup_from(&self, target: NodeId, seeds: Vec<Contact>) -> LookupOutcome {
        let started = Instant::now();
        let k = self.params.k;

        let mut shortlist: Vec<Contact> = self
            .table
            .lookup_closest(&target, k)
            .await
            .into_iter()
            .map(|r| r.contact)
            .collect();
        for seed in seeds {
            if seed.node_id != self.local.node_id && !shortlist.iter().any(|c| c.node_id == seed.node_id) {
                shortlist.push(seed);
            }
        }
        sort_by_distance(&mut shortlist, &target);

        let mut seen: HashSet<NodeId> = shortlist.iter().map(|c| c.node_id).collect();
        seen.insert(self.local.node_id);
        let mut queried: HashSet<NodeId> = HashSet::new();
        let mut best: Option<Distance> = shortlist.first().map(|c| c.node_id.distance(&target));
        let mut any_success = false;
        // Set once a round brings nothing closer: query the remaining unqueried
        // contacts among the k closest, then stop
        let mut sweeping = false;

        for round in 1..=self.params.max_rounds {
            let elapsed = started.elapsed();
            if elapsed >= self.params.lookup_timeout {
                warn!("Lookup for {} timed out after {} rounds", target, round - 1);
                break;
            }

            let candidates: Vec<Contact> = shortlist
                .iter()
                .filter(|c| !queried.contains(&c.node_id))
                .take(if sweeping { k } else { self.params.alpha })
                .cloned()
                .collect();
            if candidates.is_empty() {
                break;
            }
            for c in &candidates {
                queried.insert(c.node_id);
            }

            let per_query = self
                .params
                .probe_timeout
                .min(self.params.lookup_timeout.saturating_sub(elapsed));
            let mut join_set = JoinSet::new();
            for contact in candidates {
                let rpc = self.rpc.clone();
                join_set.spawn(async move {
                    let result = match timeout(per_query, rpc.find_node(&contact, target)).await {
                        Ok(result) => result,
                        Err(_) => Err(P2PError::Timeout(format!("FIND_NODE to {}", contact))),
                    };
                    (contact, result)
                });
            }

            let mut round_best: Option<Distance> = None;
            let mut target_answered = false;
            while let Some(joined) = join_set.join_next().await {
                let Ok((contact, result)) = joined else {
                    continue;
                };
                match result {
                    Ok(nodes) => {
                        any_success = true;
                        target_answered |= contact.node_id == target;
                        self.observe(contact.clone()).await;
                        for node in nodes {
                            if !seen.insert(node.node_id) {
                                continue;
                            }
                            self.learn(node.clone()).await;
                            let distance = node.node_id.distance(&target);
                            if round_best.is_none_or(|b| distance < b) {
                                round_best = Some(distance);
                            }
                            shortlist.push(node);
                        }
                    }
                    Err(e) => {
                        debug!("FIND_NODE to {} failed: {}", contact, e);
                        self.table.mark_failed(&contact.node_id).await;
                        shortlist.retain(|c| c.node_id != contact.node_id);
                    }
                }
            }

            sort_by_distance(&mut shortlist, &target);
            shortlist.truncate(k);

            if target_answered || shortlist.first().is_some_and(|c| c.node_id == target) {
                debug!("Lookup for {} reached the target in round {}", target, round);
                break;
            }

            if sweeping {
                debug!("Lookup for {} converged after {} rounds", target, round);
                break;
            }

            let improved = match (round_best, best) {
                (Some(found), Some(current)) => found < current,
                (Some(_), None) => true,
                (None, _) => false,
            };
            if improved {
                best = round_best;
            } else {
                sweeping = true;
            }
        }

        if let Some(found) = shortlist.iter().find(|c| c.node_id == target) {
            return LookupOutcome::Found(found.clone());
        }
        if !any_success {
            return LookupOutcome::Exhausted;
        }
        LookupOutcome::Partial(shortlist)
    }

    async fn ping_with_backoff(&self, addr: SocketAddr) -> Result<Contact> {
        let attempts = self.params.bootstrap_retries.saturating_add(1);
        let mut delay = self.params.bootstrap_backoff;

        for attempt in 1..=attempts {
            match timeout(self.params.probe_timeout, self.rpc.ping(addr)).await {
                Ok(Ok(contact)) => return Ok(contact),
                Ok(Err(e)) => warn!("Bootstrap attempt {}/{} to {} failed: {}", attempt, attempts, addr, e),
                Err(_) => warn!("Bootstrap attempt {}/{} to {} timed out", attempt, attempts, addr),
            }
            if attempt < attempts {
                sleep(delay).await;
                delay = delay.saturating_mul(2);
            }
        }

        Err(P2PError::UnreachablePeer(format!(
            "bootstrap peer {} did not answer after {} attempts",
            addr, attempts
        )))
    }

    /// Join through the peer at `addr`: confirm it is alive, then look up our own id.
    /// The table is untouched when the bootstrap peer never answers.
    pub async fn bootstrap(&self, addr: SocketAddr) -> Result<LookupOutcome> {
        info!("Bootstrapping via {}", addr);
        let pong = self.ping_with_backoff(addr).await?;
        if pong.node_id == self.local.node_id {
            return Err(P2PError::InvalidResponse(format!(
                "bootstrap peer {} is this node",
                addr
            )));
        }

        // Keep the address we actually reached
        let seed = Contact::new(pong.node_id, addr);
        self.observe(seed.clone()).await;

        match self.lookup_from(self.local.node_id, vec![seed]).await {
            LookupOutcome::Exhausted => Err(P2PError::LookupExhausted(format!(
                "no peer answered FIND_NODE while joining via {}",
                addr
            ))),
            outcome => {
                info!(
                    "Bootstrap via {} complete: {} peers known",
                    addr,
                    self.table.len().await
                );
                Ok(outcome)
            }
        }
    }

    /// Resolve `target` to a peer that answers right now.
    pub async fn resolve(&self, target: NodeId) -> Result<Contact> {
        if target == self.local.node_id {
            return Ok(self.local.clone());
        }

        if let Some(record) = self.table.get(&target).await {
            match record.liveness {
                Liveness::Alive => return Ok(record.contact),
                Liveness::Suspect if self.probe(&record.contact).await => return Ok(record.contact),
                _ => {}
            }
        }

        match self.iterative_lookup(target).await {
            LookupOutcome::Found(contact) => {
                if self.probe(&contact).await {
                    Ok(contact)
                } else {
                    Err(P2PError::UnreachablePeer(format!(
                        "{:#} was located but did not answer PING",
                        target
                    )))
                }
            }
            LookupOutcome::Partial(_) => Err(P2PError::UnreachablePeer(format!(
                "{:#} is not known to any reachable peer",
                target
            ))),
            LookupOutcome::Exhausted => Err(P2PError::LookupExhausted(format!(
                "no peer answered while resolving {:#}",
                target
            ))),
        }
    }

    /// Answer to an inbound FIND_NODE: our closest live contacts, minus the requester.
    pub async fn closest_for(&self, requester: &NodeId, target: &NodeId) -> Vec<Contact> {
        self.table
            .lookup_closest(target, self.params.k + 1)
            .await
            .into_iter()
            .filter(|r| &r.contact.node_id != requester && !r.is_dead())
            .take(self.params.k)
            .map(|r| r.contact)
            .collect()
    }

    /// A peer announced it is leaving.
    pub async fn forget(&self, node_id: &NodeId) {
        if self.table.remove(node_id).await.is_some() {
            info!("Peer {} left the network", node_id);
        }
    }

    /// Re-probe suspect peers and evict dead ones. Returns (probed, evicted).
    pub async fn maintain(&self) -> (usize, usize) {
        let suspects = self.table.records_with(Liveness::Suspect).await;
        for record in &suspects {
            self.probe(&record.contact).await;
        }

        let dead = self.table.records_with(Liveness::Dead).await;
        for record in &dead {
            self.table.remove(&record.node_id()).await;
        }
        if !dead.is_empty() {
            info!("Evicted {} dead peers", dead.len());
        }
        (suspects.len(), dead.len())
    }

    /// Best-effort LEAVE to every known peer.
    pub async fn announce_leave(&self) {
        let contacts: Vec<Contact> = self.table.records().await.into_iter().map(|r| r.contact).collect();
        let mut join_set = JoinSet::new();
        for contact in contacts {
            let rpc = self.rpc.clone();
            let limit = self.params.probe_timeout;
            join_set.spawn(async move {
                if let Ok(Err(e)) = timeout(limit, rpc.leave(&contact)).await {
                    debug!("LEAVE to {} failed: {}", contact, e);
                }
            });
        }
        while join_set.join_next().await.is_some() {}
    }
}
