use crate::impl_pack;
use crate::pack::{Pack, PackError, Reader, read_var_bytes, write_var_bytes};
use crate::sha256::Hash;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Output script, used as the payout identity of a share.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Script(pub Vec<u8>);

const OP_PUSHDATA1: u8 = 0x4c;
const OP_PUSHDATA2: u8 = 0x4d;
const OP_PUSHDATA4: u8 = 0x4e;
const OP_CHECKSIG: u8 = 0xac;
const OP_CHECKSIGVERIFY: u8 = 0xad;
const OP_CHECKMULTISIG: u8 = 0xae;
const OP_CHECKMULTISIGVERIFY: u8 = 0xaf;

impl Script {
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        hex::decode(s).map(Script)
    }
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
    pub fn len(&self) -> usize {
        self.0.len()
    }
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Legacy (inaccurate) signature operation count; multisig counts 20.
    pub fn sigop_count(&self) -> usize {
        sigop_count(&self.0)
    }
}

pub fn sigop_count(script: &[u8]) -> usize {
    let mut count = 0;
    let mut pos = 0;
    while pos < script.len() {
        let opcode = script[pos];
        pos += 1;
        let push = match opcode {
            1..OP_PUSHDATA1 => usize::from(opcode),
            OP_PUSHDATA1 => read_push_len(script, &mut pos, 1),
            OP_PUSHDATA2 => read_push_len(script, &mut pos, 2),
            OP_PUSHDATA4 => read_push_len(script, &mut pos, 4),
            OP_CHECKSIG | OP_CHECKSIGVERIFY => {
                count += 1;
                0
            }
            OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => {
                count += 20;
                0
            }
            _ => 0,
        };
        pos = pos.saturating_add(push);
    }
    count
}

fn read_push_len(script: &[u8], pos: &mut usize, width: usize) -> usize {
    let Some(bytes) = script.get(*pos..*pos + width) else {
        *pos = script.len();
        return 0;
    };
    *pos += width;
    bytes
        .iter()
        .rev()
        .fold(0usize, |acc, b| (acc << 8) | usize::from(*b))
}

impl fmt::Display for Script {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Pack for Script {
    fn write(&self, out: &mut Vec<u8>) {
        write_var_bytes(&self.0, out);
    }
    fn read(reader: &mut Reader<'_>) -> Result<Self, PackError> {
        read_var_bytes(reader).map(Script)
    }
}

// scripts are hex strings in config files and persisted state
impl Serialize for Script {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Script {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Script::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct OutPoint {
    pub hash: Hash,
    pub index: u32,
}
impl_pack!(OutPoint { hash, index });

impl OutPoint {
    /// The previous output of a coinbase input.
    pub fn null() -> Self {
        OutPoint {
            hash: Hash::zero(),
            index: u32::MAX,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct TxIn {
    pub previous_output: OutPoint,
    pub script: Script,
    pub sequence: u32,
}
impl_pack!(TxIn {
    previous_output,
    script,
    sequence
});

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct TxOut {
    pub value: u64,
    pub script: Script,
}
impl_pack!(TxOut { value, script });

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Transaction {
    pub version: u32,
    pub tx_ins: Vec<TxIn>,
    pub tx_outs: Vec<TxOut>,
    pub lock_time: u32,
}
impl_pack!(Transaction {
    version,
    tx_ins,
    tx_outs,
    lock_time
});

impl Transaction {
    pub fn hash(&self) -> Hash {
        Hash::of(self)
    }
    pub fn is_coinbase(&self) -> bool {
        self.tx_ins.len() == 1 && self.tx_ins[0].previous_output == OutPoint::null()
    }
    pub fn total_output(&self) -> u64 {
        self.tx_outs.iter().map(|out| out.value).sum()
    }
}
