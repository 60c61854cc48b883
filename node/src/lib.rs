//! Share-chain node: gossip with peers, keep the chain, hand out work.
//!
//! [`Node`] owns the [`ShareChain`] behind a single async mutex. Connection
//! handlers, the background loops in [`util`] and the work interface in
//! [`work`] all go through it; the lock is never held across network I/O.

pub mod addrs;
pub mod config;
pub mod handler;
pub mod peer;
pub mod reply;
pub mod upstream;
pub mod util;
pub mod work;

use addrs::AddrStore;
use config::Config;
use dashmap::{DashMap, DashSet};
use peer::{KnownHashes, Peer};
use sharelib::chain::{Desired, ShareChain, ThinkResult};
use sharelib::network::{AddrRecord, Framing, Message, NetAddress, ProtocolError, Version};
use sharelib::pack::VarStr;
use sharelib::params::NetworkParams;
use sharelib::sha256::Hash;
use sharelib::store::{Replay, ShareStore};
use sharelib::types::{BlockHeader, RawShare, Share, Transaction};
use sharelib::PROTOCOL_VERSION;
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, MutexGuard, PoisonError};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use upstream::UpstreamNode;

/// How many ancestors of a new best share are pushed to peers.
const BROADCAST_DEPTH: u64 = 5;
/// Probability of passing an address on to a random peer.
const ADDR_RELAY_PROBABILITY: f64 = 0.8;
pub const MAX_ADDRS_PER_MESSAGE: u32 = 100;

/// Persistence work queued by tracker events.
#[derive(Debug)]
pub enum StoreOp {
    AddShare(Arc<Share>),
    AddVerified(Hash),
    ForgetShare(Hash),
    ForgetVerified(Hash),
}

pub struct Node {
    pub config: Config,
    pub net: Arc<NetworkParams>,
    pub framing: Framing,
    /// identifies this node in handshakes
    pub nonce: u64,
    pub chain: Mutex<ShareChain>,
    pub upstream: Arc<dyn UpstreamNode>,
    pub peers: DashMap<u64, Arc<Peer>>,
    pub addr_store: Mutex<AddrStore>,
    bans: DashMap<IpAddr, i64>,
    pub incoming_by_subnet: DashMap<[u8; 4], usize>,
    pub outgoing_attempts: DashSet<[u8; 4]>,
    best_share: watch::Sender<Option<Hash>>,
    desired: watch::Sender<Vec<Desired>>,
    best_block_header: Mutex<Option<BlockHeader>>,
    shared_hashes: std::sync::Mutex<HashSet<Hash>>,
    forwarded_txs: std::sync::Mutex<KnownHashes>,
    pub cancel: CancellationToken,
}

fn lock<T>(mutex: &std::sync::Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn queue_store_op(sender: &kanal::Sender<StoreOp>, op: StoreOp) {
    if let Err(e) = sender.send(op) {
        warn!("share store writer is gone, change not persisted: {e}");
    }
}

/// Connections from the same /16 (or IPv6 /32) share a bucket.
pub fn subnet(ip: IpAddr) -> [u8; 4] {
    match ip.to_canonical() {
        IpAddr::V4(ip) => {
            let octets = ip.octets();
            [octets[0], octets[1], 0, 0]
        }
        IpAddr::V6(ip) => {
            let octets = ip.octets();
            [octets[0], octets[1], octets[2], octets[3]]
        }
    }
}

impl Node {
    pub fn new(config: Config, upstream: Arc<dyn UpstreamNode>) -> Arc<Self> {
        let net = Arc::new(config.net.clone());
        let chain = ShareChain::new(net.clone(), config.think.clone());
        let (best_share, _) = watch::channel(None);
        let (desired, _) = watch::channel(Vec::new());
        Arc::new(Node {
            framing: Framing::new(&net),
            net,
            nonce: rand::random(),
            chain: Mutex::new(chain),
            upstream,
            peers: DashMap::new(),
            addr_store: Mutex::new(AddrStore::new()),
            bans: DashMap::new(),
            incoming_by_subnet: DashMap::new(),
            outgoing_attempts: DashSet::new(),
            best_share,
            desired,
            best_block_header: Mutex::new(None),
            shared_hashes: std::sync::Mutex::new(HashSet::new()),
            forwarded_txs: std::sync::Mutex::new(KnownHashes::default()),
            cancel: CancellationToken::new(),
            config,
        })
    }

    pub fn best_share(&self) -> Option<Hash> {
        *self.best_share.borrow()
    }
    pub fn subscribe_best_share(&self) -> watch::Receiver<Option<Hash>> {
        self.best_share.subscribe()
    }
    pub fn desired(&self) -> Vec<Desired> {
        self.desired.borrow().clone()
    }
    pub fn subscribe_desired(&self) -> watch::Receiver<Vec<Desired>> {
        self.desired.subscribe()
    }

    /// Loads replayed shares, then mirrors every later tracker change into
    /// `store` from a blocking writer task.
    pub async fn attach_store(&self, mut store: ShareStore, replay: Replay) -> JoinHandle<()> {
        let (sender, receiver) = kanal::unbounded::<StoreOp>();
        {
            let mut chain = self.chain.lock().await;
            let mut loaded = 0;
            for share in replay.shares {
                if chain.add_share(share).is_ok() {
                    loaded += 1;
                }
            }
            let verified = replay
                .verified
                .iter()
                .filter(|hash| chain.mark_verified(hash))
                .count();
            info!("replayed {loaded} shares, {verified} of them verified");

            let tx = sender.clone();
            chain.items.added.subscribe(move |share| {
                queue_store_op(&tx, StoreOp::AddShare(share.clone()));
            });
            let tx = sender.clone();
            chain.items.removed.subscribe(move |share| {
                queue_store_op(&tx, StoreOp::ForgetShare(share.hash));
            });
            let tx = sender.clone();
            chain.verified.added.subscribe(move |share| {
                queue_store_op(&tx, StoreOp::AddVerified(share.hash));
            });
            let tx = sender;
            chain.verified.removed.subscribe(move |share| {
                queue_store_op(&tx, StoreOp::ForgetVerified(share.hash));
            });
        }
        tokio::task::spawn_blocking(move || {
            while let Ok(op) = receiver.recv() {
                let result = match &op {
                    StoreOp::AddShare(share) => store.add_share(share),
                    StoreOp::AddVerified(hash) => store.add_verified_hash(*hash),
                    StoreOp::ForgetShare(hash) => store.forget_share(hash),
                    StoreOp::ForgetVerified(hash) => store.forget_verified_share(hash),
                };
                if let Err(e) = result {
                    warn!("share store failed on {op:?}: {e}");
                }
            }
            debug!("share store writer stopped");
        })
    }

    pub fn version_message(&self, peer_addr: SocketAddr) -> Version {
        let local = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.config.p2p.port);
        Version {
            version: PROTOCOL_VERSION,
            services: 0,
            addr_to: NetAddress::new(0, peer_addr),
            addr_from: NetAddress::new(0, local),
            nonce: self.nonce,
            sub_version: VarStr(self.config.p2p.sub_version.as_bytes().to_vec()),
            mode: 1,
            best_share_hash: self.best_share().unwrap_or_default(),
        }
    }

    pub fn is_banned(&self, ip: IpAddr) -> bool {
        self.bans
            .get(&ip)
            .is_some_and(|until| *until > sharelib::util::now())
    }

    pub fn ban(&self, ip: IpAddr) {
        if ip.to_canonical().is_loopback() {
            return;
        }
        let until = sharelib::util::now() + self.config.p2p.ban_secs;
        self.bans.insert(ip, until);
    }

    pub fn bad_peer_happened(&self, peer: &Peer, reason: &str) {
        warn!("banning peer {peer}: {reason}");
        peer.disconnect();
        self.ban(peer.addr.ip());
    }

    /// Adds an established peer; false if its nonce is already connected.
    pub fn register_peer(&self, peer: Arc<Peer>) -> bool {
        match self.peers.entry(peer.nonce) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                info!(
                    "{} connection to peer {} established, version {} {:?}",
                    if peer.incoming { "incoming" } else { "outgoing" },
                    peer.addr,
                    peer.version,
                    peer.sub_version
                );
                entry.insert(peer);
                true
            }
        }
    }

    pub fn unregister_peer(&self, peer: &Arc<Peer>) {
        self.peers
            .remove_if(&peer.nonce, |_, existing| Arc::ptr_eq(existing, peer));
    }

    pub fn outgoing_count(&self) -> usize {
        self.peers.iter().filter(|peer| !peer.incoming).count()
    }

    fn peer_list(&self, except: Option<u64>) -> Vec<Arc<Peer>> {
        self.peers
            .iter()
            .filter(|entry| Some(*entry.key()) != except)
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn random_peer(&self, except: Option<u64>) -> Option<Arc<Peer>> {
        use rand::seq::SliceRandom;
        self.peer_list(except).choose(&mut rand::thread_rng()).cloned()
    }

    pub async fn got_addr(&self, addr: SocketAddr, services: u64, timestamp: i64) {
        let capacity = self.config.p2p.max_addr_store;
        self.addr_store
            .lock()
            .await
            .got_addr(addr, services, timestamp, capacity);
    }

    /// A peer advertised the port it listens on.
    pub async fn handle_addrme(&self, peer: &Peer, port: u16) {
        let relay = rand::random::<f64>() < ADDR_RELAY_PROBABILITY;
        let host = peer.addr.ip().to_canonical();
        if host.is_loopback() {
            if let Some(other) = self.random_peer(None).filter(|_| relay) {
                other.try_send(Message::AddrMe { port });
            }
            return;
        }
        let addr = SocketAddr::new(host, port);
        self.got_addr(addr, peer.services, sharelib::util::now()).await;
        if let Some(other) = self.random_peer(None).filter(|_| relay) {
            other.try_send(Message::Addrs(vec![sharelib::network::addr_record(
                peer.services,
                addr,
            )]));
        }
    }

    pub async fn handle_addrs(&self, records: Vec<AddrRecord>) {
        let now = sharelib::util::now();
        for record in records {
            let timestamp = now.min(record.timestamp.min(i64::MAX as u64) as i64);
            self.got_addr(record.address.socket_addr(), record.address.services, timestamp)
                .await;
            let relay = rand::random::<f64>() < ADDR_RELAY_PROBABILITY;
            if let Some(other) = self.random_peer(None).filter(|_| relay) {
                other.try_send(Message::Addrs(vec![record]));
            }
        }
    }

    pub async fn good_addr_records(&self, count: u32) -> Vec<AddrRecord> {
        let count = count.min(MAX_ADDRS_PER_MESSAGE) as usize;
        self.addr_store
            .lock()
            .await
            .get_good_peers(count, sharelib::util::now())
            .into_iter()
            .map(|(addr, entry)| AddrRecord {
                timestamp: entry.last_seen.max(0) as u64,
                address: NetAddress::new(entry.services, addr),
            })
            .collect()
    }

    /// Decodes and admits shares. Returns how many were new.
    pub async fn handle_shares(&self, raws: Vec<RawShare>, from: Option<&Arc<Peer>>) -> usize {
        let peer_addr = from.map(|peer| peer.addr);
        let total = raws.len();
        if total > 5 {
            info!("processing {total} shares from {peer_addr:?}");
        }
        let mut new = Vec::new();
        {
            let mut chain = self.chain.lock().await;
            for raw in raws {
                let share = match Share::from_raw(&raw, &self.net, peer_addr) {
                    Ok(Some(share)) => share,
                    Ok(None) => {
                        debug!("skipping share of unknown type {}", raw.share_type.0);
                        continue;
                    }
                    Err(e) => {
                        warn!("discarding share from {peer_addr:?}: {e}");
                        continue;
                    }
                };
                if let Some(peer) = from {
                    peer.mark_known(share.hash);
                }
                if chain.contains(&share.hash) {
                    continue;
                }
                match chain.add_share(share) {
                    Ok(share) => new.push(share),
                    Err(e) => debug!("not adding share: {e}"),
                }
            }
        }
        if new.is_empty() {
            return 0;
        }
        self.forward_transactions(&new).await;
        self.set_best_share().await;

        let accepted: Vec<Arc<Share>> = {
            let chain = self.chain.lock().await;
            new.iter()
                .filter(|share| chain.verified.contains(&share.hash))
                .cloned()
                .collect()
        };
        self.relay(&accepted, from.map(|peer| peer.nonce));
        if total > 5 {
            info!(
                "done processing {total} shares, {} new, {} accepted",
                new.len(),
                accepted.len()
            );
        }
        new.len()
    }

    /// Fetches announced shares we do not have, with some ancestors.
    pub async fn handle_share_hashes(self: Arc<Self>, hashes: Vec<Hash>, peer: Arc<Peer>) {
        let unknown: Vec<Hash> = {
            let chain = self.chain.lock().await;
            hashes
                .into_iter()
                .filter(|hash| !chain.contains(hash))
                .collect()
        };
        if unknown.is_empty() {
            return;
        }
        debug!("requesting {} announced shares from {peer}", unknown.len());
        match peer
            .get_shares(unknown, self.config.p2p.announce_ancestors, Vec::new())
            .await
        {
            Ok(shares) => {
                self.handle_shares(shares, Some(&peer)).await;
            }
            Err(e) => warn!("fetching announced shares from {peer} failed: {e}"),
        }
    }

    pub async fn handle_get_shares(&self, hashes: &[Hash], parents: u64, stops: &[Hash]) -> Vec<RawShare> {
        let shares = self
            .chain
            .lock()
            .await
            .handle_get_shares(hashes, parents, stops);
        shares.iter().map(|share| share.to_raw()).collect()
    }

    /// Takes note of an upstream block header announced by a peer or the
    /// upstream node, relaying it when it becomes the best known header.
    pub async fn handle_header(&self, header: BlockHeader) -> Result<(), ProtocolError> {
        let hash = header.hash();
        if !hash.matches_target(header.bits.target()) {
            return Err(ProtocolError::Misbehaving(format!(
                "block header {hash} fails its own proof of work"
            )));
        }
        let work = self.upstream.current_work();
        if !hash.matches_target(work.bits.target()) {
            return Ok(());
        }
        let tip = work.previous_block;
        let mut best = self.best_block_header.lock().await;
        let accept = match best.as_ref() {
            None => true,
            Some(current) => {
                (header.previous_block == tip && current.hash() == tip)
                    || (hash == tip && current.previous_block != tip)
            }
        };
        if !accept || best.as_ref() == Some(&header) {
            return Ok(());
        }
        *best = Some(header.clone());
        drop(best);
        debug!("new best block header {hash}");
        for peer in self.peer_list(None) {
            peer.try_send(Message::BestBlock(header.clone()));
        }
        Ok(())
    }

    pub async fn best_block_header(&self) -> Option<BlockHeader> {
        self.best_block_header.lock().await.clone()
    }

    /// Re-runs chain selection and acts on the result: publishes the best
    /// share and desired set, punishes peers that sent invalid shares and
    /// submits block solutions upstream.
    pub async fn set_best_share(&self) -> ThinkResult {
        let work = self.upstream.current_work();
        let upstream = self.upstream.clone();
        let (result, solutions) = {
            let mut chain = self.chain.lock().await;
            let rel_height = |hash: &Hash| upstream.block_rel_height(hash);
            let result = chain.think(
                &rel_height,
                &work.previous_block,
                work.bits,
                sharelib::util::now(),
            );
            (result, chain.take_block_solutions())
        };

        let changed = self.best_share.send_if_modified(|best| {
            if *best == result.best {
                return false;
            }
            *best = result.best;
            true
        });
        self.desired.send_replace(result.desired.clone());

        let bad: Vec<Arc<Peer>> = self
            .peer_list(None)
            .into_iter()
            .filter(|peer| result.bad_peer_addresses.contains(&peer.addr))
            .collect();
        for peer in bad {
            self.bad_peer_happened(&peer, "sent an invalid share");
        }

        for (share, gentx) in solutions {
            match share.as_block(gentx) {
                Some(block) => {
                    info!("submitting block {} found by share {}", block.hash(), share.hash);
                    if let Err(e) = self.upstream.submit_block(block).await {
                        warn!("upstream rejected block from share {}: {e}", share.hash);
                    }
                }
                None => warn!("share {} solves a block but its transactions are unknown", share.hash),
            }
            // peers learn of a block on a recent tip even when it is not our best share
            let previous_block = share.header().previous_block;
            let recent = self.upstream.block_rel_height(&previous_block) > -5
                || work.previous_block == previous_block
                || work.previous_block == share.hash;
            if recent {
                self.broadcast_share(share.hash).await;
            }
        }

        if let Some(best) = result.best.filter(|_| changed) {
            info!("new best share {best}");
            self.broadcast_share(best).await;
        }
        result
    }

    /// Runs chain selection, then prunes. Returns how many shares went.
    pub async fn clean_tracker(&self) -> usize {
        let result = self.set_best_share().await;
        let removed = {
            let mut chain = self.chain.lock().await;
            let removed = chain.prune(&result.decorated_heads, sharelib::util::now());
            lock(&self.shared_hashes).retain(|hash| chain.contains(hash));
            removed
        };
        if removed > 0 {
            self.set_best_share().await;
        }
        removed
    }

    /// Pushes `best` and its recent ancestors that were never shared.
    async fn broadcast_share(&self, best: Hash) {
        let shares: Vec<Arc<Share>> = {
            let mut chain = self.chain.lock().await;
            let length = chain.items.get_length(&best).min(BROADCAST_DEPTH);
            let shared = lock(&self.shared_hashes);
            match chain.items.get_chain(&best, length) {
                Ok(ancestors) => ancestors
                    .take_while(|share| !shared.contains(&share.hash))
                    .cloned()
                    .collect(),
                Err(_) => Vec::new(),
            }
        };
        self.relay(&shares, None);
    }

    /// Sends `shares` to every peer except `except`, skipping shares the
    /// peer sent us or is known to have.
    fn relay(&self, shares: &[Arc<Share>], except: Option<u64>) {
        if shares.is_empty() {
            return;
        }
        lock(&self.shared_hashes).extend(shares.iter().map(|share| share.hash));
        for peer in self.peer_list(except) {
            let raws: Vec<RawShare> = shares
                .iter()
                .filter(|share| share.peer_addr != Some(peer.addr) && !peer.knows(&share.hash))
                .map(|share| {
                    peer.mark_known(share.hash);
                    share.to_raw()
                })
                .collect();
            if raws.is_empty() {
                continue;
            }
            for message in self.framing.fragment_shares(raws) {
                if !peer.try_send(message) {
                    debug!("send queue of {peer} is full, dropping shares");
                    break;
                }
            }
        }
    }

    /// Passes transactions carried by new shares on to the upstream node.
    async fn forward_transactions(&self, shares: &[Arc<Share>]) {
        let fresh: Vec<Transaction> = {
            let mut forwarded = lock(&self.forwarded_txs);
            shares
                .iter()
                .filter_map(|share| share.contents.other_txs.as_ref())
                .flatten()
                .filter(|tx| {
                    let hash = tx.hash();
                    let seen = forwarded.contains(&hash);
                    forwarded.insert(hash);
                    !seen
                })
                .cloned()
                .collect()
        };
        for tx in fresh {
            if let Err(e) = self.upstream.submit_transaction(tx).await {
                debug!("upstream refused a transaction: {e}");
            }
        }
    }
}

// Re-exports for convenience
pub use dashmap;
pub use sharelib;
pub use tokio;
