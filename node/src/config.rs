use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sharelib::chain::ThinkConfig;
use sharelib::params::NetworkParams;
use sharelib::sha256::Hash;
use sharelib::store::DEFAULT_SEGMENT_CAP;
use sharelib::types::FloatingInteger;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct P2pConfig {
    pub port: u16,
    pub desired_outgoing: usize,
    pub max_outgoing_attempts: usize,
    pub max_incoming: usize,
    /// incoming connections allowed from one /16
    pub max_incoming_per_subnet: usize,
    /// ask peers for addresses while the book holds fewer than this
    pub preferred_storage: usize,
    pub max_addr_store: usize,
    /// peers kept connected regardless of the address book
    pub connect: Vec<String>,
    pub advertise: bool,
    pub handshake_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub ban_secs: i64,
    /// ancestors requested along with an announced share
    pub announce_ancestors: u64,
    pub sub_version: String,
}

impl Default for P2pConfig {
    fn default() -> Self {
        P2pConfig {
            port: NetworkParams::default().p2p_port,
            desired_outgoing: 10,
            max_outgoing_attempts: 30,
            max_incoming: 50,
            max_incoming_per_subnet: 3,
            preferred_storage: 1000,
            max_addr_store: 10_000,
            connect: Vec::new(),
            advertise: true,
            handshake_timeout_secs: 10,
            idle_timeout_secs: 100,
            request_timeout_secs: 15,
            ban_secs: 60 * 60,
            announce_ancestors: 10,
            sub_version: format!("sharepool/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    pub share_prefix: String,
    pub segment_cap: u64,
    pub save_interval_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            data_dir: PathBuf::from("data"),
            share_prefix: "shares".to_string(),
            segment_cap: DEFAULT_SEGMENT_CAP,
            save_interval_secs: 60,
        }
    }
}

impl StorageConfig {
    pub fn addr_store_path(&self) -> PathBuf {
        self.data_dir.join("addrs.cbor")
    }
}

/// Fixed upstream work, used until a real coin node client is plugged in.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct UpstreamConfig {
    /// big-endian hex, as block explorers print it
    pub previous_block: String,
    pub bits: u32,
    pub subsidy: u64,
    pub version: u32,
    pub height: i64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        UpstreamConfig {
            previous_block: Hash::zero().to_string(),
            bits: 0x1d00_ffff,
            subsidy: 50 * 100_000_000,
            version: 2,
            height: 0,
        }
    }
}

impl UpstreamConfig {
    pub fn previous_block(&self) -> Result<Hash> {
        Hash::from_hex(&self.previous_block)
            .with_context(|| format!("bad previous_block {}", self.previous_block))
    }
    pub fn bits(&self) -> FloatingInteger {
        FloatingInteger(self.bits)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct Config {
    pub p2p: P2pConfig,
    pub storage: StorageConfig,
    pub upstream: UpstreamConfig,
    pub net: NetworkParams,
    pub think: ThinkConfig,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("cannot read config {}", path.display()))?;
        let config: Config =
            toml::from_str(&text).with_context(|| format!("invalid config {}", path.display()))?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path, self.to_toml()?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_survive_toml() {
        let config = Config::default();
        let text = config.to_toml().unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.p2p, config.p2p);
        assert_eq!(parsed.storage, config.storage);
        assert_eq!(parsed.think, config.think);
        assert_eq!(parsed.net.max_target, config.net.max_target);
        assert_eq!(parsed.net.limits, config.net.limits);
        assert_eq!(parsed.upstream.previous_block().unwrap(), Hash::zero());
    }

    #[test]
    fn partial_files_fill_in_defaults() {
        let config: Config = toml::from_str(
            r#"
            [p2p]
            port = 19333
            connect = ["10.0.0.1:19333"]

            [think]
            keep_top_heads = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.p2p.port, 19333);
        assert_eq!(config.p2p.desired_outgoing, 10);
        assert_eq!(config.think.keep_top_heads, 2);
        assert_eq!(config.think.recent_head_secs, 300);
        assert_eq!(config.net.chain_length, NetworkParams::default().chain_length);
    }
}
