use crate::reply::ReplyMatcher;
use sharelib::error::{PoolError, Result};
use sharelib::network::{Message, ProtocolError, ShareRequest};
use sharelib::pack::VarInt;
use sharelib::sha256::Hash;
use sharelib::types::RawShare;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Share hashes remembered per peer before the older half is forgotten.
const KNOWN_HASHES_CAPACITY: usize = 10_000;

/// Two generations of hashes; when the current one fills up the previous
/// one is dropped.
#[derive(Default, Debug)]
pub struct KnownHashes {
    current: HashSet<Hash>,
    previous: HashSet<Hash>,
}

impl KnownHashes {
    pub fn insert(&mut self, hash: Hash) {
        self.current.insert(hash);
        if self.current.len() > KNOWN_HASHES_CAPACITY {
            std::mem::swap(&mut self.current, &mut self.previous);
            self.current.clear();
        }
    }
    pub fn contains(&self, hash: &Hash) -> bool {
        self.current.contains(hash) || self.previous.contains(hash)
    }
}

/// An established connection, as seen by the rest of the node.
pub struct Peer {
    pub addr: SocketAddr,
    pub nonce: u64,
    pub incoming: bool,
    pub version: u32,
    pub sub_version: String,
    pub services: u64,
    sender: kanal::AsyncSender<Message>,
    pub replies: ReplyMatcher,
    known: Mutex<KnownHashes>,
    pub cancel: CancellationToken,
}

impl Peer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        addr: SocketAddr,
        nonce: u64,
        incoming: bool,
        version: u32,
        sub_version: String,
        services: u64,
        sender: kanal::AsyncSender<Message>,
        request_timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Peer {
            addr,
            nonce,
            incoming,
            version,
            sub_version,
            services,
            sender,
            replies: ReplyMatcher::new(request_timeout),
            known: Mutex::new(KnownHashes::default()),
            cancel,
        }
    }

    /// Queues a message for the writer task.
    pub async fn send(&self, message: Message) -> Result<()> {
        self.sender
            .send(message)
            .await
            .map_err(|_| ProtocolError::Closed.into())
    }

    /// Queues a message without waiting; false if the queue is full or
    /// the connection is gone.
    pub fn try_send(&self, message: Message) -> bool {
        matches!(self.sender.try_send(message), Ok(true))
    }

    fn known(&self) -> MutexGuard<'_, KnownHashes> {
        self.known.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn mark_known(&self, hash: Hash) {
        self.known().insert(hash);
    }

    pub fn knows(&self, hash: &Hash) -> bool {
        self.known().contains(hash)
    }

    /// Asks the peer for `hashes` and up to `parents` ancestors of each,
    /// stopping at `stops`.
    pub async fn get_shares(
        &self,
        hashes: Vec<Hash>,
        parents: u64,
        stops: Vec<Hash>,
    ) -> Result<Vec<RawShare>> {
        let pending = self.replies.register();
        let request = Message::ShareReq(ShareRequest {
            id: pending.id,
            hashes,
            parents: VarInt(parents),
            stops,
        });
        if let Err(e) = self.send(request).await {
            self.replies.fail_all();
            return Err(e);
        }
        let result = self.replies.wait(pending).await;
        if matches!(result, Err(PoolError::Timeout)) {
            // an unanswered request means the peer is stuck
            self.disconnect();
        }
        result
    }

    pub fn disconnect(&self) {
        self.cancel.cancel();
    }

    pub fn is_connected(&self) -> bool {
        !self.cancel.is_cancelled()
    }
}

impl std::fmt::Display for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_hashes_forget_the_oldest_generation() {
        let mut known = KnownHashes::default();
        let hashes: Vec<Hash> = (0..=2 * KNOWN_HASHES_CAPACITY as u32 + 2)
            .map(|n| Hash::hash256(&n.to_le_bytes()))
            .collect();
        for hash in &hashes[..=KNOWN_HASHES_CAPACITY] {
            known.insert(*hash);
        }
        // first generation rotated out of `current` but is still remembered
        assert!(known.contains(&hashes[0]));
        for hash in &hashes[KNOWN_HASHES_CAPACITY + 1..] {
            known.insert(*hash);
        }
        assert!(!known.contains(&hashes[0]));
        assert!(known.contains(hashes.last().unwrap()));
    }

    #[tokio::test]
    async fn requests_fail_once_the_writer_is_gone() {
        let (sender, receiver) = kanal::bounded_async(4);
        let peer = Peer::new(
            "10.0.0.1:9333".parse().unwrap(),
            7,
            false,
            sharelib::PROTOCOL_VERSION,
            String::new(),
            0,
            sender,
            Duration::from_secs(5),
            CancellationToken::new(),
        );
        drop(receiver);
        assert!(peer.get_shares(vec![Hash::zero()], 1, vec![]).await.is_err());
        assert!(peer.replies.is_empty());
    }
}
