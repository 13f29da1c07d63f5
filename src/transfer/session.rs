use log::{debug, warn};
use std::collections::{BTreeMap, HashSet};
use uuid::Uuid;

use crate::network::dht::NodeId;
use crate::storage::Chunk;
use crate::utils::P2PError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Requested,
    Receiving,
    Complete,
    Failed,
}

/// What the requester should do after a FILE_CHUNK.
#[derive(Debug)]
pub enum ChunkVerdict {
    /// Chunks up to and including `through` are now applied; acknowledge it.
    Accepted { through: u64 },
    /// Ahead of a gap; held until the gap fills.
    Buffered,
    /// Already applied or already held.
    Duplicate,
    /// First checksum failure for this sequence number.
    Retry(u64),
    /// The session is over.
    Abort(P2PError),
}

/// Requester-side state of one file transfer. Chunks are applied strictly in
/// sequence order; anything ahead of the next expected number is buffered.
#[derive(Debug)]
pub struct FileTransferSession {
    pub transfer_id: Uuid,
    pub path: String,
    pub source: NodeId,
    state: SessionState,
    expected_size: Option<u64>,
    received_bytes: u64,
    next_seq: u64,
    buffered: BTreeMap<u64, Chunk>,
    retried: HashSet<u64>,
    checksums: Vec<String>,
    content: Vec<u8>,
}

impl FileTransferSession {
    pub fn new(transfer_id: Uuid, path: impl Into<String>, source: NodeId) -> Self {
        Self {
            transfer_id,
            path: path.into(),
            source,
            state: SessionState::Requested,
            expected_size: None,
            received_bytes: 0,
            next_seq: 0,
            buffered: BTreeMap::new(),
            retried: HashSet::new(),
            checksums: Vec::new(),
            content: Vec::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn expected_size(&self) -> Option<u64> {
        self.expected_size
    }

    pub fn received_bytes(&self) -> u64 {
        self.received_bytes
    }

    pub fn checksums(&self) -> &[String] {
        &self.checksums
    }

    pub fn retries(&self) -> usize {
        self.retried.len()
    }

    fn is_finished(&self) -> bool {
        matches!(self.state, SessionState::Complete | SessionState::Failed)
    }

    fn fail(&mut self, error: P2PError) -> P2PError {
        warn!("Transfer {} of {} failed: {}", self.transfer_id, self.path, error);
        self.state = SessionState::Failed;
        self.buffered.clear();
        error
    }

    pub fn on_chunk(&mut self, chunk: Chunk, total_size: u64) -> ChunkVerdict {
        if self.is_finished() {
            return ChunkVerdict::Duplicate;
        }
        self.state = SessionState::Receiving;

        match self.expected_size {
            None => self.expected_size = Some(total_size),
            Some(expected) if expected != total_size => {
                let error = P2PError::InvalidResponse(format!(
                    "total size changed from {} to {} mid-transfer",
                    expected, total_size
                ));
                return ChunkVerdict::Abort(self.fail(error));
            }
            Some(_) => {}
        }

        if chunk.seq < self.next_seq || self.buffered.contains_key(&chunk.seq) {
            debug!("Duplicate chunk {} of {}", chunk.seq, self.path);
            return ChunkVerdict::Duplicate;
        }

        if !chunk.verify() {
            if self.retried.insert(chunk.seq) {
                warn!("Chunk {} of {} failed its checksum, re-requesting", chunk.seq, self.path);
                return ChunkVerdict::Retry(chunk.seq);
            }
            let error = P2PError::TransferIntegrityFailure {
                path: self.path.clone(),
                seq: chunk.seq,
            };
            return ChunkVerdict::Abort(self.fail(error));
        }

        let held: u64 = self.buffered.values().map(|c| c.len() as u64).sum();
        let incoming = self.received_bytes + held + chunk.len() as u64;
        if incoming > total_size {
            let error = P2PError::InvalidResponse(format!(
                "chunks exceed the announced {} bytes",
                total_size
            ));
            return ChunkVerdict::Abort(self.fail(error));
        }

        self.buffered.insert(chunk.seq, chunk);

        let before = self.next_seq;
        while let Some(next) = self.buffered.remove(&self.next_seq) {
            self.received_bytes += next.len() as u64;
            self.content.extend_from_slice(&next.data);
            self.checksums.push(next.checksum);
            self.next_seq += 1;
        }

        if self.next_seq > before {
            ChunkVerdict::Accepted {
                through: self.next_seq - 1,
            }
        } else {
            ChunkVerdict::Buffered
        }
    }

    /// FILE_END: the reassembled bytes if every chunk arrived, else the failure.
    pub fn on_end(&mut self, chunks: u64, total_size: u64) -> Result<Vec<u8>, P2PError> {
        if self.is_finished() {
            return Err(P2PError::InvalidResponse(format!(
                "FILE_END for finished transfer {}",
                self.transfer_id
            )));
        }

        let size_matches = self.expected_size.unwrap_or(total_size) == total_size;
        if self.next_seq != chunks || self.received_bytes != total_size || !size_matches {
            let error = P2PError::IncompleteDownload(format!(
                "{}: {} of {} chunks, {} of {} bytes",
                self.path, self.next_seq, chunks, self.received_bytes, total_size
            ));
            return Err(self.fail(error));
        }

        self.state = SessionState::Complete;
        debug!(
            "Transfer {} complete: {} chunks, {} bytes",
            self.transfer_id, chunks, total_size
        );
        Ok(std::mem::take(&mut self.content))
    }

    pub fn on_not_found(&mut self) -> P2PError {
        let error = P2PError::FileNotFound(self.path.clone());
        self.fail(error)
    }

    /// Any other terminal failure (idle timeout, connection loss, ERROR frame).
    pub fn abort(&mut self, error: P2PError) -> P2PError {
        self.fail(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> FileTransferSession {
        FileTransferSession::new(Uuid::new_v4(), "a.txt", NodeId::from_string("src"))
    }

    fn corrupt(seq: u64, data: &[u8]) -> Chunk {
        let mut chunk = Chunk::new(seq, data.to_vec());
        chunk.checksum = "00".repeat(32);
        chunk
    }

    #[test]
    fn test_in_order_transfer_completes() {
        let mut s = session();
        assert_eq!(s.state(), SessionState::Requested);

        assert!(matches!(
            s.on_chunk(Chunk::new(0, b"abc".to_vec()), 5),
            ChunkVerdict::Accepted { through: 0 }
        ));
        assert_eq!(s.state(), SessionState::Receiving);
        assert_eq!(s.expected_size(), Some(5));
        assert!(matches!(
            s.on_chunk(Chunk::new(1, b"de".to_vec()), 5),
            ChunkVerdict::Accepted { through: 1 }
        ));

        assert_eq!(s.on_end(2, 5).unwrap(), b"abcde");
        assert_eq!(s.state(), SessionState::Complete);
        assert_eq!(s.checksums().len(), 2);
    }

    #[test]
    fn test_out_of_order_is_buffered_until_gap_fills() {
        let mut s = session();
        assert!(matches!(
            s.on_chunk(Chunk::new(2, b"c".to_vec()), 3),
            ChunkVerdict::Buffered
        ));
        assert!(matches!(
            s.on_chunk(Chunk::new(1, b"b".to_vec()), 3),
            ChunkVerdict::Buffered
        ));
        assert_eq!(s.received_bytes(), 0);

        assert!(matches!(
            s.on_chunk(Chunk::new(0, b"a".to_vec()), 3),
            ChunkVerdict::Accepted { through: 2 }
        ));
        assert_eq!(s.on_end(3, 3).unwrap(), b"abc");
    }

    #[test]
    fn test_duplicates_are_ignored() {
        let mut s = session();
        s.on_chunk(Chunk::new(0, b"a".to_vec()), 2);
        assert!(matches!(
            s.on_chunk(Chunk::new(0, b"a".to_vec()), 2),
            ChunkVerdict::Duplicate
        ));
    }

    #[test]
    fn test_single_retry_then_success() {
        let mut s = session();
        assert!(matches!(s.on_chunk(corrupt(0, b"ab"), 2), ChunkVerdict::Retry(0)));
        assert!(matches!(
            s.on_chunk(Chunk::new(0, b"ab".to_vec()), 2),
            ChunkVerdict::Accepted { through: 0 }
        ));
        assert_eq!(s.retries(), 1);
        assert_eq!(s.on_end(1, 2).unwrap(), b"ab");
    }

    #[test]
    fn test_second_corruption_aborts() {
        let mut s = session();
        assert!(matches!(s.on_chunk(corrupt(0, b"ab"), 2), ChunkVerdict::Retry(0)));
        match s.on_chunk(corrupt(0, b"ab"), 2) {
            ChunkVerdict::Abort(P2PError::TransferIntegrityFailure { seq, path }) => {
                assert_eq!(seq, 0);
                assert_eq!(path, "a.txt");
            }
            other => panic!("unexpected verdict {:?}", other),
        }
        assert_eq!(s.state(), SessionState::Failed);
    }

    #[test]
    fn test_end_with_missing_chunks_fails() {
        let mut s = session();
        s.on_chunk(Chunk::new(0, b"a".to_vec()), 2);
        assert!(matches!(s.on_end(2, 2), Err(P2PError::IncompleteDownload(_))));
        assert_eq!(s.state(), SessionState::Failed);
    }

    #[test]
    fn test_empty_file() {
        let mut s = session();
        assert_eq!(s.on_end(0, 0).unwrap(), Vec::<u8>::new());
        assert_eq!(s.state(), SessionState::Complete);
    }

    #[test]
    fn test_not_found_fails_immediately() {
        let mut s = session();
        assert!(matches!(s.on_not_found(), P2PError::FileNotFound(p) if p == "a.txt"));
        assert_eq!(s.state(), SessionState::Failed);
    }

    #[test]
    fn test_oversized_chunks_abort() {
        let mut s = session();
        assert!(matches!(
            s.on_chunk(Chunk::new(0, b"toolong".to_vec()), 3),
            ChunkVerdict::Abort(P2PError::InvalidResponse(_))
        ));
    }
}
