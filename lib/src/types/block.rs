use super::Transaction;
use crate::U256;
use crate::impl_pack;
use crate::pack::{Pack, PackError, Reader};
use crate::sha256::Hash;
use crate::util::merkle_root;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Compact target encoding ("bits").
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Default)]
pub struct FloatingInteger(pub u32);

impl FloatingInteger {
    pub fn target(&self) -> U256 {
        let mantissa = U256::from(self.0 & 0x00ff_ffff);
        let exponent = (self.0 >> 24) as usize;
        if exponent <= 3 {
            return mantissa >> (8 * (3 - exponent));
        }
        let shift = 8 * (exponent - 3);
        if mantissa.bits() + shift > 256 {
            return U256::MAX;
        }
        mantissa << shift
    }

    /// Largest representable target not above `target`.
    pub fn from_target_upper_bound(target: U256) -> Self {
        let mut digits: Vec<u8> = (0..32)
            .rev()
            .map(|i| target.byte(i))
            .skip_while(|b| *b == 0)
            .collect();
        if digits.first().is_some_and(|b| *b >= 0x80) {
            digits.insert(0, 0);
        }
        let mut mantissa = 0u32;
        for i in 0..3 {
            mantissa = (mantissa << 8) | u32::from(digits.get(i).copied().unwrap_or(0));
        }
        FloatingInteger(((digits.len() as u32) << 24) | mantissa)
    }
}

impl fmt::Display for FloatingInteger {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

impl Pack for FloatingInteger {
    fn write(&self, out: &mut Vec<u8>) {
        self.0.write(out);
    }
    fn read(reader: &mut Reader<'_>) -> Result<Self, PackError> {
        u32::read(reader).map(FloatingInteger)
    }
}

/// Expected number of hashes needed to find one at or below `target`.
pub fn target_to_average_attempts(target: U256) -> U256 {
    if target == U256::MAX {
        return U256::one();
    }
    // 2^256 / (target + 1) without leaving 256 bits
    (U256::MAX - target) / (target + 1) + 1
}

/// Inverse of [`target_to_average_attempts`], `2^256 / attempts - 1`.
pub fn average_attempts_to_target(attempts: U256) -> U256 {
    if attempts.is_zero() {
        return U256::MAX;
    }
    let quotient = U256::MAX / attempts;
    let remainder = U256::MAX % attempts;
    if remainder + 1 == attempts {
        quotient
    } else {
        quotient.saturating_sub(U256::one())
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: u32,
    pub previous_block: Hash,
    pub merkle_root: Hash,
    pub timestamp: u32,
    pub bits: FloatingInteger,
    pub nonce: u32,
}
impl_pack!(BlockHeader {
    version,
    previous_block,
    merkle_root,
    timestamp,
    bits,
    nonce
});

impl BlockHeader {
    pub fn hash(&self) -> Hash {
        Hash::of(self)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}
impl_pack!(Block {
    header,
    transactions
});

impl Block {
    pub fn new(header: BlockHeader, transactions: Vec<Transaction>) -> Self {
        Block {
            header,
            transactions,
        }
    }
    pub fn hash(&self) -> Hash {
        self.header.hash()
    }
    pub fn check_merkle_root(&self) -> bool {
        let hashes: Vec<Hash> = self.transactions.iter().map(Transaction::hash).collect();
        merkle_root(&hashes) == self.header.merkle_root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitcoin_difficulty_one() {
        let bits = FloatingInteger(0x1d00ffff);
        assert_eq!(bits.target(), U256::from(0xffffu64) << 208);
        assert_eq!(FloatingInteger::from_target_upper_bound(bits.target()), bits);
        assert_eq!(
            target_to_average_attempts(bits.target()),
            U256::from(0x1_0001_0001u64)
        );
    }

    #[test]
    fn upper_bound_never_exceeds_target() {
        for target in [
            U256::MAX,
            U256::from(1u64) << 255,
            (U256::from(1u64) << 224) - 1,
            U256::from(0x7f_ffffu64),
            U256::from(0x80u64),
            U256::from(1u64),
        ] {
            let bits = FloatingInteger::from_target_upper_bound(target);
            assert!(bits.target() <= target, "{target:x}");
            assert!(bits.target() > target >> 16, "{target:x}");
        }
        assert_eq!(FloatingInteger::from_target_upper_bound(U256::MAX).0, 0x2100ffff);
    }

    #[test]
    fn attempts_round_trip() {
        assert_eq!(target_to_average_attempts(U256::MAX), U256::one());
        assert_eq!(target_to_average_attempts(U256::MAX >> 1), U256::from(2u64));
        assert_eq!(average_attempts_to_target(U256::from(2u64)), U256::MAX >> 1);
        assert_eq!(average_attempts_to_target(U256::one()), U256::MAX);
    }
}
