use crate::impl_pack;
use crate::sha256::Hash;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{Read, Result as IoResult, Write};
use std::path::Path;

pub trait Saveable
where
    Self: Sized,
{
    fn load<I: Read>(reader: I) -> IoResult<Self>;
    fn save<O: Write>(&self, writer: O) -> IoResult<()>;
    fn save_to_file<P: AsRef<Path>>(&self, path: P) -> IoResult<()> {
        let file = File::create(&path)?;
        self.save(file)
    }
    fn load_from_file<P: AsRef<Path>>(path: P) -> IoResult<Self> {
        let file = File::open(&path)?;
        Self::load(file)
    }
}

/// Authentication path from a leaf to a merkle root.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleLink {
    pub branch: Vec<Hash>,
    pub index: u32,
}
impl_pack!(MerkleLink { branch, index });

fn merkle_parent(left: &Hash, right: &Hash) -> Hash {
    let mut data = [0u8; 64];
    data[..32].copy_from_slice(left.as_bytes());
    data[32..].copy_from_slice(right.as_bytes());
    Hash::hash256(&data)
}

/// Bitcoin merkle root; an odd level duplicates its last entry.
pub fn merkle_root(hashes: &[Hash]) -> Hash {
    if hashes.is_empty() {
        return Hash::zero();
    }
    let mut level = hashes.to_vec();
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| merkle_parent(&pair[0], pair.get(1).unwrap_or(&pair[0])))
            .collect();
    }
    level[0]
}

/// Branch proving `hashes[index]` under `merkle_root(hashes)`.
/// The leaf itself does not contribute to the branch.
pub fn calculate_merkle_link(hashes: &[Hash], index: usize) -> MerkleLink {
    let mut branch = Vec::new();
    let mut level = hashes.to_vec();
    let mut pos = index;
    while level.len() > 1 {
        let sibling = if pos % 2 == 0 {
            *level.get(pos + 1).unwrap_or(&level[pos])
        } else {
            level[pos - 1]
        };
        branch.push(sibling);
        level = level
            .chunks(2)
            .map(|pair| merkle_parent(&pair[0], pair.get(1).unwrap_or(&pair[0])))
            .collect();
        pos /= 2;
    }
    MerkleLink {
        branch,
        index: index as u32,
    }
}

/// Folds `link` over `leaf`; `None` when the index has more bits than the branch.
pub fn check_merkle_link(leaf: Hash, link: &MerkleLink) -> Option<Hash> {
    if link.branch.len() < 32 && u64::from(link.index) >= 1u64 << link.branch.len() {
        return None;
    }
    Some(
        link.branch
            .iter()
            .enumerate()
            .fold(leaf, |acc, (i, sibling)| {
                if (link.index >> i) & 1 == 1 {
                    merkle_parent(sibling, &acc)
                } else {
                    merkle_parent(&acc, sibling)
                }
            }),
    )
}

/// Exponentially distributed delay with the given mean, in seconds.
pub fn expovariate(mean: f64) -> f64 {
    let u: f64 = rand::thread_rng().r#gen();
    -(1.0 - u).ln() * mean
}

pub fn now() -> i64 {
    chrono::Utc::now().timestamp()
}
