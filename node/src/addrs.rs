//! Known peer addresses, persisted between runs.

use rand::Rng;
use serde::{Deserialize, Serialize};
use sharelib::util::Saveable;
use std::collections::HashMap;
use std::io::{Error as IoError, ErrorKind as IoErrorKind, Read, Result as IoResult, Write};
use std::net::SocketAddr;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct AddrEntry {
    pub services: u64,
    pub first_seen: i64,
    pub last_seen: i64,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct AddrStore {
    entries: HashMap<SocketAddr, AddrEntry>,
}

impl AddrStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
    pub fn get(&self, addr: &SocketAddr) -> Option<&AddrEntry> {
        self.entries.get(addr)
    }

    /// Records that `addr` was seen at `timestamp`. New addresses are only
    /// accepted while the book holds fewer than `capacity`.
    pub fn got_addr(&mut self, addr: SocketAddr, services: u64, timestamp: i64, capacity: usize) {
        if let Some(entry) = self.entries.get_mut(&addr) {
            entry.services = services;
            entry.last_seen = entry.last_seen.max(timestamp);
        } else if self.entries.len() < capacity {
            self.entries.insert(
                addr,
                AddrEntry {
                    services,
                    first_seen: timestamp,
                    last_seen: timestamp,
                },
            );
        }
    }

    pub fn remove(&mut self, addr: &SocketAddr) -> Option<AddrEntry> {
        self.entries.remove(addr)
    }

    /// Up to `count` addresses, favouring long-lived peers seen recently.
    /// The order is randomized so nodes do not all dial the same peers.
    pub fn get_good_peers(&self, count: usize, now: i64) -> Vec<(SocketAddr, AddrEntry)> {
        let mut rng = rand::thread_rng();
        let mut scored: Vec<(f64, SocketAddr, AddrEntry)> = self
            .entries
            .iter()
            .map(|(addr, entry)| {
                let lifetime = (entry.last_seen - entry.first_seen).max(3600) as f64;
                let silence = (now - entry.last_seen).max(3600) as f64;
                let u: f64 = rng.r#gen();
                let draw = -(1.0 - u).ln();
                (-lifetime.ln() / silence.ln() * draw, *addr, *entry)
            })
            .collect();
        scored.sort_by(|a, b| a.0.total_cmp(&b.0));
        scored
            .into_iter()
            .take(count)
            .map(|(_, addr, entry)| (addr, entry))
            .collect()
    }
}

// save and load expecting CBOR from ciborium as format
impl Saveable for AddrStore {
    fn load<I: Read>(reader: I) -> IoResult<Self> {
        ciborium::de::from_reader(reader).map_err(|_| {
            IoError::new(IoErrorKind::InvalidData, "Failed to deserialize address store")
        })
    }
    fn save<O: Write>(&self, writer: O) -> IoResult<()> {
        ciborium::ser::into_writer(self, writer).map_err(|_| {
            IoError::new(IoErrorKind::InvalidData, "Failed to serialize address store")
        })
    }
}
