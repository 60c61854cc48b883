//! Append-only segmented log of shares and verification markers.
//!
//! Each segment `<prefix>.<n>` is a sequence of CBOR encoded
//! [`StoreRecord`]s. New records go to the newest segment until it grows
//! past the size cap. A segment is deleted once every record in it has been
//! forgotten.

use crate::error::{PoolError, Result};
use crate::pack::Pack;
use crate::params::NetworkParams;
use crate::sha256::Hash;
use crate::types::{RawShare, Share};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const DEFAULT_SEGMENT_CAP: u64 = 10_000_000;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum StoreRecord {
    /// packed [`RawShare`]
    Share(Vec<u8>),
    VerifiedHash(Hash),
}

#[derive(Default, Debug, Clone)]
struct Segment {
    shares: HashSet<Hash>,
    verified: HashSet<Hash>,
}

impl Segment {
    fn is_empty(&self) -> bool {
        self.shares.is_empty() && self.verified.is_empty()
    }
}

pub struct ShareStore {
    dir: PathBuf,
    prefix: String,
    segment_cap: u64,
    /// everything written to each segment
    known: BTreeMap<u64, Segment>,
    /// what is still wanted from each segment
    wanted: BTreeMap<u64, Segment>,
}

/// Contents recovered by [`ShareStore::open`].
#[derive(Default)]
pub struct Replay {
    pub shares: Vec<Share>,
    pub verified: Vec<Hash>,
}

impl ShareStore {
    pub fn open<P: AsRef<Path>>(
        dir: P,
        prefix: &str,
        segment_cap: u64,
        net: &NetworkParams,
    ) -> Result<(Self, Replay)> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let mut store = ShareStore {
            dir,
            prefix: prefix.to_string(),
            segment_cap,
            known: BTreeMap::new(),
            wanted: BTreeMap::new(),
        };
        let mut replay = Replay::default();
        for (number, path) in store.segments()? {
            let segment = store.known.entry(number).or_default();
            let data = fs::read(&path)?;
            let mut cursor = Cursor::new(data.as_slice());
            while (cursor.position() as usize) < data.len() {
                let record: StoreRecord = match ciborium::de::from_reader(&mut cursor) {
                    Ok(record) => record,
                    Err(e) => {
                        warn!("stopped reading {} at a corrupt record: {e}", path.display());
                        break;
                    }
                };
                match record {
                    StoreRecord::VerifiedHash(hash) => {
                        segment.verified.insert(hash);
                        replay.verified.push(hash);
                    }
                    StoreRecord::Share(bytes) => {
                        let loaded = RawShare::unpack(&bytes)
                            .map_err(PoolError::from)
                            .and_then(|raw| Share::from_raw(&raw, net, None));
                        match loaded {
                            Ok(Some(share)) => {
                                segment.shares.insert(share.hash);
                                replay.shares.push(share);
                            }
                            Ok(None) => debug!("skipping stored share of an unknown type"),
                            Err(e) => warn!("skipping unreadable stored share: {e}"),
                        }
                    }
                }
            }
        }
        store.wanted = store.known.clone();
        info!(
            "loaded {} shares and {} verified hashes from {}",
            replay.shares.len(),
            replay.verified.len(),
            store.dir.display()
        );
        Ok((store, replay))
    }

    /// Existing segments, oldest first.
    pub fn segments(&self) -> Result<Vec<(u64, PathBuf)>> {
        let marker = format!("{}.", self.prefix);
        let mut segments = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(number) = name
                .to_str()
                .and_then(|name| name.strip_prefix(&marker))
                .and_then(|suffix| suffix.parse::<u64>().ok())
            else {
                continue;
            };
            segments.push((number, entry.path()));
        }
        segments.sort();
        Ok(segments)
    }

    fn segment_path(&self, number: u64) -> PathBuf {
        self.dir.join(format!("{}.{number}", self.prefix))
    }

    fn append(&mut self, record: &StoreRecord) -> Result<u64> {
        let segments = self.segments()?;
        let number = match segments.last() {
            Some((number, path)) if fs::metadata(path)?.len() < self.segment_cap => *number,
            Some((number, _)) => number + 1,
            None => 0,
        };
        let mut bytes = Vec::new();
        ciborium::ser::into_writer(record, &mut bytes)
            .map_err(|e| PoolError::Store(format!("cannot encode record: {e}")))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.segment_path(number))?;
        file.write_all(&bytes)?;
        Ok(number)
    }

    pub fn add_share(&mut self, share: &Share) -> Result<()> {
        let existing = self
            .known
            .iter()
            .find(|(_, segment)| segment.shares.contains(&share.hash))
            .map(|(number, _)| *number);
        let number = match existing {
            Some(number) => number,
            None => {
                let number = self.append(&StoreRecord::Share(share.to_raw().pack()))?;
                self.known.entry(number).or_default().shares.insert(share.hash);
                number
            }
        };
        self.wanted.entry(number).or_default().shares.insert(share.hash);
        Ok(())
    }

    pub fn add_verified_hash(&mut self, hash: Hash) -> Result<()> {
        let existing = self
            .known
            .iter()
            .find(|(_, segment)| segment.verified.contains(&hash))
            .map(|(number, _)| *number);
        let number = match existing {
            Some(number) => number,
            None => {
                let number = self.append(&StoreRecord::VerifiedHash(hash))?;
                self.known.entry(number).or_default().verified.insert(hash);
                number
            }
        };
        self.wanted.entry(number).or_default().verified.insert(hash);
        Ok(())
    }

    pub fn forget_share(&mut self, hash: &Hash) -> Result<()> {
        for segment in self.wanted.values_mut() {
            segment.shares.remove(hash);
        }
        self.check_remove()
    }

    pub fn forget_verified_share(&mut self, hash: &Hash) -> Result<()> {
        for segment in self.wanted.values_mut() {
            segment.verified.remove(hash);
        }
        self.check_remove()
    }

    fn check_remove(&mut self) -> Result<()> {
        let empty: Vec<u64> = self
            .wanted
            .iter()
            .filter(|(_, segment)| segment.is_empty())
            .map(|(number, _)| *number)
            .collect();
        for number in empty {
            self.known.remove(&number);
            self.wanted.remove(&number);
            let path = self.segment_path(number);
            match fs::remove_file(&path) {
                Ok(()) => info!("removed share segment {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}
