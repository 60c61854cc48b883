use crate::U256;
use crate::pack::{Pack, PackError, Reader};
use serde::{Deserialize, Serialize};
use sha256::digest;
use std::fmt;

/// 32-byte digest kept in wire (little-endian) order.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Default)]
pub struct Hash(pub [u8; 32]);

impl Hash {
    /// Bitcoin-style double SHA-256.
    pub fn hash256(data: &[u8]) -> Self {
        let first = sha256_bytes(data);
        Hash(sha256_bytes(&first))
    }
    /// Hash of the canonical encoding of `value`.
    pub fn of<T: Pack>(value: &T) -> Self {
        Self::hash256(&value.pack())
    }
    /// The "no parent" sentinel.
    pub fn zero() -> Self {
        Hash([0; 32])
    }
    pub fn is_zero(&self) -> bool {
        self.0 == [0; 32]
    }
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
    pub fn to_u256(&self) -> U256 {
        U256::from_little_endian(&self.0)
    }
    pub fn from_u256(value: U256) -> Self {
        let mut bytes = [0u8; 32];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = value.byte(i);
        }
        Hash(bytes)
    }
    /// Parses the big-endian hex form produced by `Display`.
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)?;
        bytes.reverse();
        Ok(Hash(bytes))
    }
    pub fn matches_target(&self, target: U256) -> bool {
        self.to_u256() <= target
    }
}

fn sha256_bytes(data: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    // the digest is always 64 hex characters
    hex::decode_to_slice(digest(data), &mut out).expect("sha256 digest is valid hex");
    out
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut bytes = self.0;
        bytes.reverse();
        write!(f, "{}", hex::encode(bytes))
    }
}

impl Ord for Hash {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.to_u256().cmp(&other.to_u256())
    }
}

impl PartialOrd for Hash {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Pack for Hash {
    fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.0);
    }
    fn read(reader: &mut Reader<'_>) -> Result<Self, PackError> {
        reader.take_array().map(Hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn double_sha256_of_empty_input() {
        // sha256(sha256(""))
        assert_eq!(
            hex::encode(Hash::hash256(b"").0),
            "5df6e0e2761359d30a8275058e299fcc0381534545f55cf43e41983f5d4c9456"
        );
    }

    #[test]
    fn hex_round_trip_and_ordering() {
        let hash = Hash::hash256(b"share");
        assert_eq!(Hash::from_hex(&hash.to_string()).unwrap(), hash);
        let small = Hash::from_u256(U256::from(5u64));
        let big = Hash::from_u256(U256::from(1u64) << 200);
        assert!(small < big);
        assert_eq!(small.to_u256(), U256::from(5u64));
        assert!(Hash::zero().is_zero());
    }
}
