use log::debug;

use crate::storage::HashUtils;

/// A size-bounded slice of a file with its sequence number and checksum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub seq: u64,
    pub data: Vec<u8>,
    pub checksum: String,
}

impl Chunk {
    pub fn new(seq: u64, data: Vec<u8>) -> Self {
        let checksum = HashUtils::hash_data(&data);
        Self {
            seq,
            data,
            checksum,
        }
    }

    pub fn verify(&self) -> bool {
        HashUtils::verify_data(&self.data, &self.checksum)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Split `content` into chunks of at most `chunk_size` bytes, numbered from 0.
pub fn split(content: &[u8], chunk_size: usize) -> Vec<Chunk> {
    let chunks: Vec<Chunk> = content
        .chunks(chunk_size.max(1))
        .enumerate()
        .map(|(seq, data)| Chunk::new(seq as u64, data.to_vec()))
        .collect();
    debug!(
        "Split {} bytes into {} chunks of up to {} bytes",
        content.len(),
        chunks.len(),
        chunk_size
    );
    chunks
}
