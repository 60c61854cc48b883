use crate::{Node, handler, subnet};
use anyhow::{Context, Result};
use rand::Rng;
use rand::seq::SliceRandom;
use sharelib::network::Message;
use sharelib::sha256::Hash;
use sharelib::util::{Saveable, expovariate, now};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::{self, timeout};
use tracing::{debug, info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const CLEAN_INTERVAL: Duration = Duration::from_secs(5);
// retry schedule for peers given explicitly
const RETRY_INITIAL: f64 = 1.0;
const RETRY_FACTOR: f64 = std::f64::consts::E;
const RETRY_JITTER: f64 = 0.119_626_565_582;
const RETRY_MAX: f64 = 3600.0;
// addresses requested when the book runs low
const GETADDRS_COUNT: u32 = 8;
// stop hashes sent with a download request
const MAX_STOPS: usize = 100;

/// Sleeps for `delay`; false once the node is shutting down.
async fn pause(node: &Node, delay: Duration) -> bool {
    tokio::select! {
        _ = node.cancel.cancelled() => false,
        _ = time::sleep(delay) => true,
    }
}

fn secs(value: f64) -> Duration {
    Duration::from_secs_f64(value.max(0.0))
}

/// Starts every periodic task of a running node.
pub fn spawn_background(node: &Arc<Node>) -> Vec<JoinHandle<()>> {
    let mut tasks = vec![
        tokio::spawn(download_shares(node.clone())),
        tokio::spawn(connect_loop(node.clone())),
        tokio::spawn(address_loop(node.clone())),
        tokio::spawn(clean_tracker(node.clone())),
        tokio::spawn(follow_upstream(node.clone())),
        tokio::spawn(save_addrs(node.clone())),
    ];
    for target in &node.config.p2p.connect {
        tasks.push(tokio::spawn(keep_connected(node.clone(), target.clone())));
    }
    tasks
}

/// Accepts incoming peers within the configured limits.
pub async fn listen(node: Arc<Node>, listener: TcpListener) {
    let p2p = &node.config.p2p;
    loop {
        let (stream, addr) = tokio::select! {
            _ = node.cancel.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("accept failed: {e}");
                    continue;
                }
            },
        };
        if node.is_banned(addr.ip()) {
            debug!("refusing banned peer {addr}");
            continue;
        }
        let total: usize = node
            .incoming_by_subnet
            .iter()
            .map(|entry| *entry.value())
            .sum();
        if total >= p2p.max_incoming {
            debug!("refusing {addr}: too many incoming connections");
            continue;
        }
        let key = subnet(addr.ip());
        {
            let mut count = node.incoming_by_subnet.entry(key).or_insert(0);
            if *count >= p2p.max_incoming_per_subnet {
                debug!("refusing {addr}: too many connections from its subnet");
                continue;
            }
            *count += 1;
        }

        let node = node.clone();
        tokio::spawn(async move {
            if let Err(e) = handler::handle_connection(node.clone(), stream, addr, true).await {
                debug!("incoming connection from {addr} ended: {e}");
            }
            if let Some(mut count) = node.incoming_by_subnet.get_mut(&key) {
                *count = count.saturating_sub(1);
            }
            node.incoming_by_subnet.remove_if(&key, |_, count| *count == 0);
        });
    }
}

async fn dial(addr: SocketAddr) -> Result<TcpStream> {
    timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .context("connection timed out")?
        .with_context(|| format!("failed to connect to {addr}"))
}

/// Opens an outgoing connection to `addr` and runs it until it closes.
pub async fn connect_to(node: Arc<Node>, addr: SocketAddr) -> Result<()> {
    let key = subnet(addr.ip());
    if !node.outgoing_attempts.insert(key) {
        anyhow::bail!("already connecting to the subnet of {addr}");
    }
    let connected = dial(addr).await;
    node.outgoing_attempts.remove(&key);
    let stream = connected?;

    let services = node
        .addr_store
        .lock()
        .await
        .get(&addr)
        .map(|entry| entry.services)
        .unwrap_or(0);
    node.got_addr(addr, services, now()).await;
    handler::handle_connection(node, stream, addr, false).await?;
    Ok(())
}

/// Keeps up to `desired_outgoing` connections to peers from the address
/// book.
pub async fn connect_loop(node: Arc<Node>) {
    let p2p = &node.config.p2p;
    loop {
        if !pause(&node, secs(expovariate(1.0))).await {
            return;
        }
        let attempts = node.outgoing_attempts.len();
        if node.outgoing_count() + attempts >= p2p.desired_outgoing || attempts >= p2p.max_outgoing_attempts {
            continue;
        }
        let candidate = node
            .addr_store
            .lock()
            .await
            .get_good_peers(1, now())
            .into_iter()
            .next();
        let Some((addr, _)) = candidate else {
            continue;
        };
        let connected = node.peers.iter().any(|peer| peer.addr == addr);
        if connected || node.is_banned(addr.ip()) || node.outgoing_attempts.contains(&subnet(addr.ip())) {
            continue;
        }
        debug!("connecting to {addr}");
        let node = node.clone();
        tokio::spawn(async move {
            if let Err(e) = connect_to(node, addr).await {
                debug!("outgoing connection to {addr}: {e:#}");
            }
        });
    }
}

async fn resolve(target: &str, default_port: u16) -> Result<SocketAddr> {
    let target = if target.contains(':') {
        target.to_string()
    } else {
        format!("{target}:{default_port}")
    };
    tokio::net::lookup_host(&target)
        .await
        .with_context(|| format!("failed to resolve {target}"))?
        .next()
        .with_context(|| format!("{target} has no addresses"))
}

/// Stays connected to `target`, backing off exponentially between
/// attempts and starting over after every successful connection.
pub async fn keep_connected(node: Arc<Node>, target: String) {
    let mut delay = RETRY_INITIAL;
    loop {
        let dialed = match resolve(&target, node.config.p2p.port).await {
            Ok(addr) => dial(addr).await.map(|stream| (stream, addr)),
            Err(e) => Err(e),
        };
        match dialed {
            Ok((stream, addr)) => {
                delay = RETRY_INITIAL;
                match handler::handle_connection(node.clone(), stream, addr, false).await {
                    Ok(()) => info!("connection to {target} closed"),
                    Err(e) => info!("connection to {target} closed: {e}"),
                }
            }
            Err(e) => warn!("{e:#}"),
        }
        if node.cancel.is_cancelled() {
            return;
        }
        delay = (delay * RETRY_FACTOR).min(RETRY_MAX);
        let jitter: f64 = rand::thread_rng().gen_range(-1.0..1.0);
        delay *= 1.0 + RETRY_JITTER * jitter;
        debug!("reconnecting to {target} in {delay:.1}s");
        if !pause(&node, secs(delay)).await {
            return;
        }
    }
}

/// Asks a random peer for addresses while the book is short of them.
pub async fn address_loop(node: Arc<Node>) {
    loop {
        if !pause(&node, secs(expovariate(20.0))).await {
            return;
        }
        if node.addr_store.lock().await.len() >= node.config.p2p.preferred_storage {
            continue;
        }
        if let Some(peer) = node.random_peer(None) {
            peer.try_send(Message::GetAddrs {
                count: GETADDRS_COUNT,
            });
        }
    }
}

/// Hashes a download may stop at: every head plus an ancestor a little
/// below it.
async fn download_stops(node: &Node) -> Vec<Hash> {
    let mut chain = node.chain.lock().await;
    let heads: Vec<Hash> = chain.items.heads().keys().copied().collect();
    let mut stops: HashSet<Hash> = heads.iter().copied().collect();
    for head in &heads {
        let depth = chain.items.get_height(head).min(10);
        if let Ok(ancestor) = chain.items.get_nth_parent_hash(head, depth) {
            stops.insert(ancestor);
        }
    }
    stops.into_iter().take(MAX_STOPS).collect()
}

/// Fetches shares the chain is missing, one request at a time.
pub async fn download_shares(node: Arc<Node>) {
    let mut desired = node.subscribe_desired();
    loop {
        let wanted = desired.borrow_and_update().clone();
        if wanted.is_empty() {
            tokio::select! {
                _ = node.cancel.cancelled() => return,
                changed = desired.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    continue;
                }
            }
        }
        let Some(target) = wanted.choose(&mut rand::thread_rng()).copied() else {
            continue;
        };
        let peer = target
            .peer_addr
            .and_then(|addr| {
                node.peers
                    .iter()
                    .find(|peer| peer.addr == addr)
                    .map(|peer| peer.value().clone())
            })
            .or_else(|| node.random_peer(None));
        let Some(peer) = peer else {
            if !pause(&node, Duration::from_secs(1)).await {
                return;
            }
            continue;
        };

        let parents: u64 = rand::thread_rng().gen_range(0..500);
        let stops = download_stops(&node).await;
        info!("requesting parent share {} from {peer}", target.hash);
        let received = match peer.get_shares(vec![target.hash], parents, stops).await {
            Ok(shares) => shares,
            Err(e) => {
                warn!("share request to {peer} failed: {e}");
                Vec::new()
            }
        };
        if received.is_empty() {
            if !pause(&node, Duration::from_secs(1)).await {
                return;
            }
            continue;
        }
        node.handle_shares(received, Some(&peer)).await;
    }
}

/// Re-runs chain selection and prunes every few seconds.
pub async fn clean_tracker(node: Arc<Node>) {
    let mut interval = time::interval(CLEAN_INTERVAL);
    loop {
        tokio::select! {
            _ = node.cancel.cancelled() => return,
            _ = interval.tick() => {}
        }
        let removed = node.clean_tracker().await;
        if removed > 0 {
            debug!("pruned {removed} shares");
        }
    }
}

/// Reacts to new upstream blocks.
pub async fn follow_upstream(node: Arc<Node>) {
    let mut headers = node.upstream.subscribe_headers();
    loop {
        let header = tokio::select! {
            _ = node.cancel.cancelled() => return,
            header = headers.recv() => header,
        };
        match header {
            Ok(header) => {
                if let Err(e) = node.handle_header(header).await {
                    warn!("upstream announced a bad header: {e}");
                }
            }
            Err(RecvError::Lagged(skipped)) => debug!("missed {skipped} upstream headers"),
            Err(RecvError::Closed) => return,
        }
        node.set_best_share().await;
    }
}

pub async fn save_addr_store(node: &Node, path: &Path) -> Result<()> {
    let store = node.addr_store.lock().await.clone();
    store
        .save_to_file(path)
        .with_context(|| format!("failed to save addresses to {}", path.display()))?;
    debug!("saved {} addresses", store.len());
    Ok(())
}

pub async fn load_addr_store(node: &Node, path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    let store = crate::addrs::AddrStore::load_from_file(path)
        .with_context(|| format!("failed to load addresses from {}", path.display()))?;
    info!("loaded {} addresses", store.len());
    *node.addr_store.lock().await = store;
    Ok(())
}

/// Writes the address book out periodically.
pub async fn save_addrs(node: Arc<Node>) {
    let path: PathBuf = node.config.storage.addr_store_path();
    let mut interval = time::interval(Duration::from_secs(node.config.storage.save_interval_secs.max(1)));
    interval.tick().await;
    loop {
        tokio::select! {
            _ = node.cancel.cancelled() => return,
            _ = interval.tick() => {}
        }
        if let Err(e) = save_addr_store(&node, &path).await {
            warn!("{e:#}");
        }
    }
}
