use crate::U256;
use crate::types::Script;
use serde::{Deserialize, Serialize};

/// Consensus and transport parameters of one share chain. Nodes with
/// different values cannot interoperate.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkParams {
    pub name: String,
    /// committed into every generation transaction
    #[serde(with = "hex_u64")]
    pub identifier: u64,
    /// first bytes of every wire frame
    #[serde(with = "hex_u64")]
    pub prefix: u64,
    /// shares kept verified behind each head
    pub chain_length: u64,
    /// payout window, in shares
    pub real_chain_length: u64,
    /// shares used to estimate the pool hash rate
    pub target_lookbehind: u64,
    /// desired seconds between shares
    pub share_period: u64,
    /// payout window, in upstream blocks worth of work
    pub spread: u64,
    /// seconds between upstream blocks
    pub block_period: u64,
    #[serde(with = "hex_u256")]
    pub min_target: U256,
    #[serde(with = "hex_u256")]
    pub max_target: U256,
    pub donation_script: Script,
    pub p2p_port: u16,
    pub min_peer_version: u32,
    pub max_payload_length: usize,
    pub limits: ShareLimits,
}

/// Field limits checked when a share is decoded, before any validation
/// against the chain.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ShareLimits {
    pub max_payout_script_len: usize,
    pub min_coinbase_len: usize,
    pub max_coinbase_len: usize,
    pub max_nonce_len: usize,
    pub max_sigops: usize,
    pub max_merkle_branch: usize,
}

impl Default for ShareLimits {
    fn default() -> Self {
        ShareLimits {
            max_payout_script_len: 100,
            min_coinbase_len: 2,
            max_coinbase_len: 100,
            max_nonce_len: 32,
            max_sigops: 20,
            max_merkle_branch: 16,
        }
    }
}

impl Default for NetworkParams {
    fn default() -> Self {
        NetworkParams {
            name: "mainnet".to_string(),
            identifier: 0xfc70_035c_7a81_bc6f,
            prefix: 0x2472_ef18_1efc_d37b,
            chain_length: 24 * 60 * 60 / 10,
            real_chain_length: 24 * 60 * 60 / 10,
            target_lookbehind: 200,
            share_period: 30,
            spread: 3,
            block_period: 600,
            min_target: U256::zero(),
            max_target: (U256::one() << 224) - 1,
            donation_script: Script::from_hex(
                "4104ffd03de44a6e11b9917f3a29f9443283d9871c9d743ef30d5eddcd37094b64d1b3d8090496b53256786bf5c82932ec23c3b74d9f05a6f95a8b5529352656664bac",
            )
            .unwrap_or_default(),
            p2p_port: 9333,
            min_peer_version: 1300,
            max_payload_length: 1_000_000,
            limits: ShareLimits::default(),
        }
    }
}

impl NetworkParams {
    pub fn prefix_bytes(&self) -> [u8; 8] {
        self.prefix.to_be_bytes()
    }
    pub fn identifier_bytes(&self) -> [u8; 8] {
        self.identifier.to_be_bytes()
    }
}

/// 64-bit identifiers as hex strings; TOML integers are signed.
pub mod hex_u64 {
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{value:016x}"))
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        let s = String::deserialize(deserializer)?;
        u64::from_str_radix(s.trim_start_matches("0x"), 16)
            .map_err(|e| D::Error::custom(format!("bad 64-bit hex value {s}: {e}")))
    }
}

/// Serializes a `U256` as a big-endian hex string so it fits in TOML.
pub mod hex_u256 {
    use crate::U256;
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(value: &U256, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{value:x}"))
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<U256, D::Error> {
        let s = String::deserialize(deserializer)?;
        U256::from_str_radix(s.trim_start_matches("0x"), 16)
            .map_err(|e| D::Error::custom(format!("bad 256-bit hex value {s}: {e:?}")))
    }
}
