use log::{debug, trace};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use tokio::sync::RwLock;
use tokio::time::Instant;

use super::contact::Contact;
use super::node_id::{ID_BITS, NodeId};

/// Default K-bucket size (Kademlia parameter)
pub const K: usize = 20;

/// Consecutive failed probes after which a record is dead.
const DEAD_AFTER_FAILURES: u32 = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Liveness {
    Alive,
    Suspect,
    Dead,
}

impl fmt::Display for Liveness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Liveness::Alive => write!(f, "alive"),
            Liveness::Suspect => write!(f, "suspect"),
            Liveness::Dead => write!(f, "dead"),
        }
    }
}

/// A routing table entry.
#[derive(Clone, Debug)]
pub struct PeerRecord {
    pub contact: Contact,
    pub last_seen: Instant,
    pub liveness: Liveness,
    pub failed_probes: u32,
}

impl PeerRecord {
    pub fn new(contact: Contact) -> Self {
        Self {
            contact,
            last_seen: Instant::now(),
            liveness: Liveness::Alive,
            failed_probes: 0,
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.contact.node_id
    }

    pub fn is_dead(&self) -> bool {
        self.liveness == Liveness::Dead
    }

    fn touch(&mut self) {
        self.last_seen = Instant::now();
        self.liveness = Liveness::Alive;
        self.failed_probes = 0;
    }

    fn record_failure(&mut self) -> Liveness {
        self.failed_probes += 1;
        self.liveness = if self.failed_probes >= DEAD_AFTER_FAILURES {
            Liveness::Dead
        } else {
            Liveness::Suspect
        };
        self.liveness
    }
}

/// Result of offering a contact to the table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Appended to a bucket (possibly replacing a dead entry)
    Inserted,
    /// Already present and directly seen; moved to most-recently-seen
    Refreshed,
    /// Already present; learned second-hand so liveness is left alone
    Known,
    /// Bucket full of live entries; the caller should probe `oldest`
    Full { oldest: Contact },
    /// The local identifier is never stored
    Rejected,
}

/// A K-bucket stores up to K records, least-recently-seen first
#[derive(Default)]
struct KBucket {
    records: VecDeque<PeerRecord>,
}

impl KBucket {
    fn position(&self, node_id: &NodeId) -> Option<usize> {
        self.records.iter().position(|r| &r.contact.node_id == node_id)
    }

    fn get_mut(&mut self, node_id: &NodeId) -> Option<&mut PeerRecord> {
        self.records.iter_mut().find(|r| &r.contact.node_id == node_id)
    }

    /// Move an existing record to the back (most recently seen)
    fn promote(&mut self, pos: usize) {
        if let Some(mut record) = self.records.remove(pos) {
            record.touch();
            self.records.push_back(record);
        }
    }

    fn offer(&mut self, contact: Contact, k: usize, direct: bool) -> InsertOutcome {
        if let Some(pos) = self.position(&contact.node_id) {
            if !direct {
                return InsertOutcome::Known;
            }
            if let Some(existing) = self.records.get_mut(pos) {
                existing.contact.addr = contact.addr;
            }
            self.promote(pos);
            return InsertOutcome::Refreshed;
        }

        if self.records.len() < k {
            self.records.push_back(PeerRecord::new(contact));
            return InsertOutcome::Inserted;
        }

        // Dead entries give way without a probe
        if let Some(pos) = self.records.iter().position(|r| r.is_dead()) {
            if let Some(evicted) = self.records.remove(pos) {
                debug!("Evicting dead contact {} for {}", evicted.contact, contact);
            }
            self.records.push_back(PeerRecord::new(contact));
            return InsertOutcome::Inserted;
        }

        match self.records.front() {
            Some(oldest) => InsertOutcome::Full {
                oldest: oldest.contact.clone(),
            },
            None => {
                self.records.push_back(PeerRecord::new(contact));
                InsertOutcome::Inserted
            }
        }
    }
}

/// Routing table: one independently locked bucket per distance prefix length.
pub struct RoutingTable {
    local_id: NodeId,
    k: usize,
    buckets: Vec<RwLock<KBucket>>,
}

impl RoutingTable {
    /// Empty table around `local_id` with buckets of `K` entries.
    pub fn new(local_id: NodeId) -> Self {
        Self::with_bucket_size(local_id, K)
    }

    /// Empty table with buckets of `k` entries.
    pub fn with_bucket_size(local_id: NodeId, k: usize) -> Self {
        let buckets = (0..ID_BITS).map(|_| RwLock::new(KBucket::default())).collect();
        Self {
            local_id,
            k: k.max(1),
            buckets,
        }
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    pub fn bucket_size(&self) -> usize {
        self.k
    }

    /// Insert a peer we just exchanged frames with.
    pub async fn insert(&self, contact: Contact) -> InsertOutcome {
        self.offer(contact, true).await
    }

    /// Insert a peer we only heard about from someone else.
    pub async fn insert_learned(&self, contact: Contact) -> InsertOutcome {
        self.offer(contact, false).await
    }

    async fn offer(&self, contact: Contact, direct: bool) -> InsertOutcome {
        let Some(bucket_idx) = self.local_id.bucket_index(&contact.node_id) else {
            return InsertOutcome::Rejected;
        };
        let mut bucket = self.buckets[bucket_idx].write().await;
        let outcome = bucket.offer(contact, self.k, direct);
        trace!("Bucket {} offer -> {:?}", bucket_idx, outcome);
        outcome
    }

    /// Settle a full bucket after probing its least-recently-seen entry.
    /// Returns true when `candidate` took the slot.
    pub async fn apply_probe_result(&self, oldest: &NodeId, alive: bool, candidate: Contact) -> bool {
        let Some(bucket_idx) = self.local_id.bucket_index(oldest) else {
            return false;
        };
        let mut bucket = self.buckets[bucket_idx].write().await;

        if alive {
            if let Some(pos) = bucket.position(oldest) {
                bucket.promote(pos);
            }
            return false;
        }

        if let Some(pos) = bucket.position(oldest) {
            bucket.records.remove(pos);
        }
        if self.local_id.bucket_index(&candidate.node_id) != Some(bucket_idx)
            || bucket.position(&candidate.node_id).is_some()
            || bucket.records.len() >= self.k
        {
            return false;
        }
        debug!("Replaced unresponsive {} with {}", oldest, candidate);
        bucket.records.push_back(PeerRecord::new(candidate));
        true
    }

    /// Drop a peer from its bucket, returning its record.
    pub async fn remove(&self, node_id: &NodeId) -> Option<PeerRecord> {
        let bucket_idx = self.local_id.bucket_index(node_id)?;
        let mut bucket = self.buckets[bucket_idx].write().await;
        let pos = bucket.position(node_id)?;
        bucket.records.remove(pos)
    }

    /// Current record for `node_id`, if known.
    pub async fn get(&self, node_id: &NodeId) -> Option<PeerRecord> {
        let bucket_idx = self.local_id.bucket_index(node_id)?;
        let bucket = self.buckets[bucket_idx].read().await;
        bucket.records.iter().find(|r| &r.contact.node_id == node_id).cloned()
    }

    /// Record a successful round trip.
    pub async fn mark_alive(&self, node_id: &NodeId) {
        if let Some(bucket_idx) = self.local_id.bucket_index(node_id) {
            let mut bucket = self.buckets[bucket_idx].write().await;
            if let Some(pos) = bucket.position(node_id) {
                bucket.promote(pos);
            }
        }
    }

    /// Record a failed probe. Returns the new liveness if the peer is known.
    pub async fn mark_failed(&self, node_id: &NodeId) -> Option<Liveness> {
        let bucket_idx = self.local_id.bucket_index(node_id)?;
        let mut bucket = self.buckets[bucket_idx].write().await;
        let record = bucket.get_mut(node_id)?;
        let liveness = record.record_failure();
        debug!("Peer {} is now {}", node_id, liveness);
        Some(liveness)
    }

    /// Flag a peer that misbehaved (e.g. sent garbage) without counting a probe.
    pub async fn mark_suspect(&self, node_id: &NodeId) {
        if let Some(bucket_idx) = self.local_id.bucket_index(node_id) {
            let mut bucket = self.buckets[bucket_idx].write().await;
            if let Some(record) = bucket.get_mut(node_id) {
                if record.liveness == Liveness::Alive {
                    record.liveness = Liveness::Suspect;
                    record.failed_probes = record.failed_probes.max(1);
                }
            }
        }
    }

    /// Up to `count` records closest to `target`, ascending by distance, ties broken by id.
    /// Dead records only appear when there are fewer than `count` live ones.
    pub async fn lookup_closest(&self, target: &NodeId, count: usize) -> Vec<PeerRecord> {
        if count == 0 {
            return Vec::new();
        }

        let mut all = self.records().await;
        all.sort_by(|a, b| {
            a.contact
                .node_id
                .distance(target)
                .cmp(&b.contact.node_id.distance(target))
                .then_with(|| a.contact.node_id.cmp(&b.contact.node_id))
        });

        let live_count = all.iter().filter(|r| !r.is_dead()).count();
        if live_count >= count {
            all.retain(|r| !r.is_dead());
        }
        all.truncate(count);
        all
    }

    /// Every record, bucket by bucket.
    pub async fn records(&self) -> Vec<PeerRecord> {
        let mut out = Vec::new();
        for bucket in &self.buckets {
            out.extend(bucket.read().await.records.iter().cloned());
        }
        out
    }

    /// Records currently in the given liveness state.
    pub async fn records_with(&self, liveness: Liveness) -> Vec<PeerRecord> {
        let mut out = self.records().await;
        out.retain(|r| r.liveness == liveness);
        out
    }

    /// Number of peers across all buckets.
    pub async fn len(&self) -> usize {
        let mut total = 0;
        for bucket in &self.buckets {
            total += bucket.read().await.records.len();
        }
        total
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Read-only view for display.
    pub async fn snapshot(&self) -> RoutingSnapshot {
        let mut entries = Vec::new();
        for (index, bucket) in self.buckets.iter().enumerate() {
            for record in bucket.read().await.records.iter() {
                entries.push(SnapshotEntry {
                    bucket: index,
                    node_id: record.contact.node_id,
                    addr: record.contact.addr,
                    liveness: record.liveness,
                    seen_secs_ago: record.last_seen.elapsed().as_secs(),
                });
            }
        }
        RoutingSnapshot {
            local_id: self.local_id,
            bucket_size: self.k,
            entries,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct SnapshotEntry {
    pub bucket: usize,
    pub node_id: NodeId,
    pub addr: std::net::SocketAddr,
    pub liveness: Liveness,
    pub seen_secs_ago: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct RoutingSnapshot {
    pub local_id: NodeId,
    pub bucket_size: usize,
    pub entries: Vec<SnapshotEntry>,
}

impl RoutingSnapshot {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.entries.iter().any(|e| &e.node_id == node_id)
    }
}

impl fmt::Display for RoutingSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Routing table of {:#} ({} peers, K={})",
            self.local_id,
            self.entries.len(),
            self.bucket_size
        )?;
        for entry in &self.entries {
            writeln!(
                f,
                "  [{:>3}] {:#} {} {} (seen {}s ago)",
                entry.bucket, entry.node_id, entry.addr, entry.liveness, entry.seen_secs_ago
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::dht::node_id::ID_LEN;
    use std::collections::HashSet;
    use std::net::SocketAddr;

    fn contact(id: NodeId, port: u16) -> Contact {
        let addr: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();
        Contact::new(id, addr)
    }

    /// Ids whose first bit is set all share bucket 0 relative to the zero id.
    fn far_id(n: u8) -> NodeId {
        let mut bytes = [0u8; ID_LEN];
        bytes[0] = 0x80;
        bytes[ID_LEN - 1] = n;
        NodeId::new(bytes)
    }

    #[tokio::test]
    async fn test_routing_table() {
        let table = RoutingTable::new(NodeId::random());

        for i in 0..5 {
            table.insert(contact(NodeId::random(), 8080 + i)).await;
        }

        assert_eq!(table.len().await, 5);
    }

    #[tokio::test]
    async fn test_local_id_never_stored() {
        let local_id = NodeId::random();
        let table = RoutingTable::new(local_id);

        assert_eq!(table.insert(contact(local_id, 9000)).await, InsertOutcome::Rejected);
        assert!(table.is_empty().await);
    }

    #[tokio::test]
    async fn test_bucket_never_exceeds_capacity() {
        let table = RoutingTable::with_bucket_size(NodeId::new([0u8; ID_LEN]), 4);

        let mut full = 0;
        for n in 0..10u8 {
            if let InsertOutcome::Full { .. } = table.insert(contact(far_id(n), 9000 + n as u16)).await {
                full += 1;
            }
        }

        assert_eq!(full, 6);
        assert_eq!(table.len().await, 4);
        assert!(table.snapshot().await.entries.iter().all(|e| e.bucket == 0));
    }

    #[tokio::test]
    async fn test_full_bucket_reports_least_recently_seen() {
        let table = RoutingTable::with_bucket_size(NodeId::new([0u8; ID_LEN]), 2);
        table.insert(contact(far_id(1), 9001)).await;
        table.insert(contact(far_id(2), 9002)).await;
        // Seeing 1 again makes 2 the oldest
        assert_eq!(table.insert(contact(far_id(1), 9001)).await, InsertOutcome::Refreshed);

        match table.insert(contact(far_id(3), 9003)).await {
            InsertOutcome::Full { oldest } => assert_eq!(oldest.node_id, far_id(2)),
            other => panic!("expected full bucket, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_probe_result_keeps_live_oldest() {
        let table = RoutingTable::with_bucket_size(NodeId::new([0u8; ID_LEN]), 1);
        table.insert(contact(far_id(1), 9001)).await;

        let replaced = table
            .apply_probe_result(&far_id(1), true, contact(far_id(2), 9002))
            .await;

        assert!(!replaced);
        assert!(table.get(&far_id(1)).await.is_some());
        assert!(table.get(&far_id(2)).await.is_none());
    }

    #[tokio::test]
    async fn test_probe_result_replaces_dead_oldest() {
        let table = RoutingTable::with_bucket_size(NodeId::new([0u8; ID_LEN]), 1);
        table.insert(contact(far_id(1), 9001)).await;

        let replaced = table
            .apply_probe_result(&far_id(1), false, contact(far_id(2), 9002))
            .await;

        assert!(replaced);
        assert!(table.get(&far_id(1)).await.is_none());
        assert!(table.get(&far_id(2)).await.is_some());
        assert_eq!(table.len().await, 1);
    }

    #[tokio::test]
    async fn test_dead_entry_replaced_without_probe() {
        let table = RoutingTable::with_bucket_size(NodeId::new([0u8; ID_LEN]), 1);
        table.insert(contact(far_id(1), 9001)).await;
        table.mark_failed(&far_id(1)).await;
        assert_eq!(table.mark_failed(&far_id(1)).await, Some(Liveness::Dead));

        assert_eq!(table.insert(contact(far_id(2), 9002)).await, InsertOutcome::Inserted);
        assert!(table.get(&far_id(1)).await.is_none());
    }

    #[tokio::test]
    async fn test_liveness_transitions() {
        let table = RoutingTable::new(NodeId::random());
        let id = NodeId::random();
        table.insert(contact(id, 9001)).await;

        assert_eq!(table.mark_failed(&id).await, Some(Liveness::Suspect));
        table.mark_alive(&id).await;
        assert_eq!(table.get(&id).await.unwrap().liveness, Liveness::Alive);

        assert_eq!(table.mark_failed(&id).await, Some(Liveness::Suspect));
        assert_eq!(table.mark_failed(&id).await, Some(Liveness::Dead));
        assert_eq!(table.mark_failed(&NodeId::random()).await, None);
    }

    #[tokio::test]
    async fn test_learned_contact_does_not_refresh() {
        let table = RoutingTable::new(NodeId::random());
        let id = NodeId::random();
        table.insert(contact(id, 9001)).await;
        table.mark_failed(&id).await;

        assert_eq!(table.insert_learned(contact(id, 9001)).await, InsertOutcome::Known);
        assert_eq!(table.get(&id).await.unwrap().liveness, Liveness::Suspect);
    }

    #[tokio::test]
    async fn test_find_closest_sorted_and_unique() {
        let table = RoutingTable::new(NodeId::random());
        for i in 0..30 {
            table.insert(contact(NodeId::random(), 8080 + i)).await;
        }

        let target = NodeId::random();
        let closest = table.lookup_closest(&target, 10).await;
        assert_eq!(closest.len(), 10);

        for pair in closest.windows(2) {
            assert!(pair[0].node_id().distance(&target) <= pair[1].node_id().distance(&target));
        }
        let unique: HashSet<_> = closest.iter().map(|r| r.node_id()).collect();
        assert_eq!(unique.len(), closest.len());
    }

    #[tokio::test]
    async fn test_find_closest_skips_dead_when_enough_live() {
        let table = RoutingTable::new(NodeId::new([0u8; ID_LEN]));
        let target = far_id(0);
        for n in 1..=4u8 {
            table.insert(contact(far_id(n), 9000 + n as u16)).await;
        }
        // far_id(1) is the closest to target; kill it
        table.mark_failed(&far_id(1)).await;
        table.mark_failed(&far_id(1)).await;

        let closest = table.lookup_closest(&target, 3).await;
        assert_eq!(closest.len(), 3);
        assert!(closest.iter().all(|r| !r.is_dead()));

        // Asking for more than the live population falls back to dead entries
        let closest = table.lookup_closest(&target, 10).await;
        assert_eq!(closest.len(), 4);
        assert_eq!(closest[0].node_id(), far_id(1));
    }

    #[tokio::test]
    async fn test_remove_and_snapshot() {
        let table = RoutingTable::new(NodeId::random());
        let id = NodeId::random();
        table.insert(contact(id, 9001)).await;
        table.insert(contact(NodeId::random(), 9002)).await;

        let snapshot = table.snapshot().await;
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.contains(&id));
        assert!(snapshot.to_string().contains(&id.to_hex()));

        assert!(table.remove(&id).await.is_some());
        assert!(table.remove(&id).await.is_none());
        assert!(!table.snapshot().await.contains(&id));
    }
}
