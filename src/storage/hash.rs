use sha2::{Digest, Sha256};

pub struct HashUtils;

impl HashUtils {
    /// Lowercase hex SHA-256 of `data`.
    pub fn hash_data(data: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(data);
        hex::encode(hasher.finalize())
    }

    pub fn verify_data(data: &[u8], expected_hash: &str) -> bool {
        Self::hash_data(data).eq_ignore_ascii_case(expected_hash)
    }
}
