use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::utils::{P2PError, Result};

/// Identifier length in bytes (160 bits).
pub const ID_LEN: usize = 20;

/// Number of distinct bucket indices (one per bit of the identifier).
pub const ID_BITS: usize = ID_LEN * 8;

/// 160-bit peer identifier.
/// Serialized on the wire as 40 lowercase hex characters.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; ID_LEN]);

/// XOR distance between two identifiers, ordered as an unsigned big-endian integer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct Distance([u8; ID_LEN]);

impl Distance {
    pub const ZERO: Distance = Distance([0u8; ID_LEN]);

    /// Number of leading zero bits; `ID_BITS` for a zero distance.
    pub fn leading_zeros(&self) -> usize {
        for (byte_idx, &byte) in self.0.iter().enumerate() {
            if byte != 0 {
                return byte_idx * 8 + byte.leading_zeros() as usize;
            }
        }
        ID_BITS
    }

    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }
}

impl NodeId {
    pub fn new(bytes: [u8; ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn random() -> Self {
        Self(rand::random())
    }

    /// Deterministic identifier from arbitrary peer material (first 160 bits of SHA-256).
    pub fn from_string(s: &str) -> Self {
        let hash = Sha256::digest(s.as_bytes());
        let mut bytes = [0u8; ID_LEN];
        bytes.copy_from_slice(&hash[..ID_LEN]);
        Self(bytes)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s.trim()).map_err(|e| P2PError::InvalidPeerId(format!("{}: {}", s, e)))?;
        if bytes.len() != ID_LEN {
            return Err(P2PError::InvalidPeerId(format!(
                "{}: expected {} bytes, got {}",
                s,
                ID_LEN,
                bytes.len()
            )));
        }
        let mut array = [0u8; ID_LEN];
        array.copy_from_slice(&bytes);
        Ok(Self(array))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    pub fn distance(&self, other: &NodeId) -> Distance {
        let mut result = [0u8; ID_LEN];
        for (i, byte) in result.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        Distance(result)
    }

    /// Bucket for `other` as seen from `self`: the leading-zero count of their distance.
    /// `None` when both ids are equal.
    pub fn bucket_index(&self, other: &NodeId) -> Option<usize> {
        let zeros = self.distance(other).leading_zeros();
        if zeros == ID_BITS { None } else { Some(zeros) }
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({}...)", &self.to_hex()[..8])
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if f.alternate() {
            write!(f, "{}", self.to_hex())
        } else {
            write!(f, "{}", &self.to_hex()[..8])
        }
    }
}

impl std::str::FromStr for NodeId {
    type Err = P2PError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        NodeId::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distance_symmetric_and_zero_to_self() {
        for _ in 0..50 {
            let a = NodeId::random();
            let b = NodeId::random();
            assert_eq!(a.distance(&b), b.distance(&a));
            assert_eq!(a.distance(&a), Distance::ZERO);
        }
    }

    #[test]
    fn test_distance_orders_as_unsigned_integer() {
        let zero = NodeId::new([0u8; ID_LEN]);
        let mut low = [0u8; ID_LEN];
        low[ID_LEN - 1] = 0xFF;
        let mut high = [0u8; ID_LEN];
        high[0] = 0x01;

        assert!(zero.distance(&NodeId::new(low)) < zero.distance(&NodeId::new(high)));
    }

    #[test]
    fn test_bucket_index_is_leading_zero_count() {
        let id1 = NodeId::new([0xFF; ID_LEN]);
        let id2 = NodeId::new([0x7F; ID_LEN]);
        // First bit differs
        assert_eq!(id1.bucket_index(&id2), Some(0));

        let mut last = [0xFF; ID_LEN];
        last[ID_LEN - 1] = 0xFE;
        assert_eq!(id1.bucket_index(&NodeId::new(last)), Some(ID_BITS - 1));

        assert_eq!(id1.bucket_index(&id1), None);
    }

    #[test]
    fn test_hex_conversion() {
        let id = NodeId::random();
        let hex = id.to_hex();
        assert_eq!(hex.len(), 40);
        assert_eq!(NodeId::from_hex(&hex).unwrap(), id);
    }

    #[test]
    fn test_from_hex_rejects_bad_input() {
        assert!(matches!(
            NodeId::from_hex("abcd"),
            Err(P2PError::InvalidPeerId(_))
        ));
        assert!(matches!(
            NodeId::from_hex("zz"),
            Err(P2PError::InvalidPeerId(_))
        ));
    }

    #[test]
    fn test_serde_uses_hex_string() {
        let id = NodeId::from_string("node1");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.to_hex()));
        let back: NodeId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
