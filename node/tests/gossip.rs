use node_lib::Node;
use node_lib::config::Config;
use node_lib::handler::handle_connection;
use node_lib::upstream::{StaticUpstream, UpstreamWork};
use sharelib::error::PoolError;
use sharelib::network::{
    FrameParser, Framing, Message, NetAddress, ProtocolError, ReplyResult, ShareReply, ShareRequest,
    Version,
};
use sharelib::pack::{Pack, VarInt, VarStr};
use sharelib::sha256::Hash;
use sharelib::testing::{ChainBuilder, test_params};
use sharelib::types::{FloatingInteger, RawShare, Script, Share, ShareContents};
use sharelib::{PROTOCOL_VERSION, SHARE_TYPE, U256};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(10);

fn node_for(builder: &ChainBuilder) -> Arc<Node> {
    node_with(builder, |_| {})
}

fn node_with(builder: &ChainBuilder, tweak: impl FnOnce(&mut Config)) -> Arc<Node> {
    let mut config = Config {
        net: test_params(),
        ..Config::default()
    };
    tweak(&mut config);
    let upstream = Arc::new(StaticUpstream::new(UpstreamWork {
        version: 2,
        previous_block: builder.previous_block,
        bits: builder.block_bits,
        subsidy: builder.subsidy,
        height: 100,
        transactions: Vec::new(),
    }));
    Node::new(config, upstream)
}

fn peer_addr() -> SocketAddr {
    "10.1.2.3:9333".parse().unwrap()
}

/// The remote end of a connection, driven by the test.
struct ScriptedPeer {
    framing: Framing,
    parser: FrameParser,
    stream: DuplexStream,
}

impl ScriptedPeer {
    fn connect(node: &Arc<Node>) -> (Self, JoinHandle<Result<(), PoolError>>) {
        Self::connect_from(node, peer_addr())
    }

    fn connect_from(node: &Arc<Node>, addr: SocketAddr) -> (Self, JoinHandle<Result<(), PoolError>>) {
        let (ours, theirs) = tokio::io::duplex(1 << 20);
        let handle = tokio::spawn(handle_connection(node.clone(), theirs, addr, true));
        let framing = Framing::new(&test_params());
        let peer = ScriptedPeer {
            framing,
            parser: framing.parser(),
            stream: ours,
        };
        (peer, handle)
    }

    async fn send(&mut self, message: Message) {
        message
            .send_async(&self.framing, &mut self.stream)
            .await
            .unwrap();
    }

    /// Next message matching `wanted`, skipping pings and the like.
    async fn recv_where(&mut self, wanted: impl Fn(&Message) -> bool) -> Message {
        loop {
            let message = timeout(WAIT, Message::receive_async(&mut self.parser, &mut self.stream))
                .await
                .expect("node went quiet")
                .expect("connection failed");
            if wanted(&message) {
                return message;
            }
        }
    }

    async fn handshake(&mut self, best_share_hash: Hash) -> Version {
        self.handshake_as(42, best_share_hash).await
    }

    async fn handshake_as(&mut self, nonce: u64, best_share_hash: Hash) -> Version {
        let Message::Version(theirs) = self
            .recv_where(|m| matches!(m, Message::Version(_)))
            .await
        else {
            unreachable!()
        };
        self.send(Message::Version(version(nonce, best_share_hash))).await;
        theirs
    }
}

fn version(nonce: u64, best_share_hash: Hash) -> Version {
    Version {
        version: PROTOCOL_VERSION,
        services: 0,
        addr_to: NetAddress::new(0, "10.0.0.1:9333".parse().unwrap()),
        addr_from: NetAddress::new(0, peer_addr()),
        nonce,
        sub_version: VarStr(b"scripted".to_vec()),
        mode: 1,
        best_share_hash,
    }
}

async fn wait_for_peers(node: &Node, count: usize) {
    timeout(WAIT, async {
        while node.peers.len() != count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("peers never registered");
}

fn share_hash(raw: &RawShare) -> Hash {
    ShareContents::unpack(raw.contents.as_ref()).unwrap().header.hash()
}

/// Mines a share that also meets the upstream block target.
fn mine_block(builder: &mut ChainBuilder, previous: Hash, n: u8) -> Arc<Share> {
    let mut contents = builder.contents(previous, ChainBuilder::script(n));
    let share_target = contents.share_info.bits.target();
    let block_target = contents.header.bits.target();
    loop {
        let hash = contents.header.hash();
        if hash.matches_target(share_target) && hash.matches_target(block_target) {
            break;
        }
        contents.header.nonce += 1;
    }
    let share = Share::new(contents, &builder.chain.net, None).unwrap();
    builder.chain.add_share(share).unwrap()
}

async fn wait_for_best(node: &Node, hash: Hash) {
    let mut best = node.subscribe_best_share();
    timeout(WAIT, best.wait_for(|best| *best == Some(hash)))
        .await
        .expect("best share never changed")
        .unwrap();
}

#[tokio::test]
async fn announced_share_is_fetched_with_its_ancestors() {
    let mut builder = ChainBuilder::new(test_params());
    let root = builder.mine(Hash::zero(), ChainBuilder::script(1));
    let child = builder.mine(root.hash, ChainBuilder::script(2));
    let node = node_for(&builder);
    let (mut peer, _connection) = ScriptedPeer::connect(&node);

    let theirs = peer.handshake(child.hash).await;
    assert!(theirs.best_share_hash.is_zero());

    let Message::ShareReq(request) = peer
        .recv_where(|m| matches!(m, Message::ShareReq(_)))
        .await
    else {
        unreachable!()
    };
    assert_eq!(request.hashes, vec![child.hash]);
    assert!(request.parents.0 > 0);
    peer.send(Message::ShareReply(ShareReply {
        id: request.id,
        result: ReplyResult::Good,
        shares: vec![child.to_raw(), root.to_raw()],
    }))
    .await;

    wait_for_best(&node, child.hash).await;
    let chain = node.chain.lock().await;
    assert!(chain.contains(&root.hash));
    assert!(chain.verified.contains(&child.hash));
}

#[tokio::test]
async fn oversized_payout_script_is_dropped_before_validation() {
    let mut builder = ChainBuilder::new(test_params());
    let bad = ChainBuilder::grind(builder.contents(Hash::zero(), Script(vec![0x51; 101])));
    let bad_hash = bad.header.hash();
    let bad = RawShare {
        share_type: VarInt(SHARE_TYPE),
        contents: VarStr(bad.pack()),
    };
    let good = builder.mine(Hash::zero(), ChainBuilder::script(3));
    let node = node_for(&builder);
    let (mut peer, _connection) = ScriptedPeer::connect(&node);
    peer.handshake(Hash::zero()).await;

    peer.send(Message::Shares(vec![bad, good.to_raw()])).await;
    wait_for_best(&node, good.hash).await;
    assert!(!node.chain.lock().await.contains(&bad_hash));
    // a malformed share is not a reason to drop the peer
    assert!(!node.is_banned(peer_addr().ip()));
    assert_eq!(node.peers.len(), 1);
}

#[tokio::test]
async fn share_requests_are_answered_from_the_chain() {
    let mut builder = ChainBuilder::new(test_params());
    let line = builder.mine_line(Hash::zero(), 4, ChainBuilder::script(4));
    let node = node_for(&builder);
    let raws = line.iter().map(|share| share.to_raw()).collect();
    assert_eq!(node.handle_shares(raws, None).await, 4);

    let (mut peer, _connection) = ScriptedPeer::connect(&node);
    let theirs = peer.handshake(Hash::zero()).await;
    assert_eq!(theirs.best_share_hash, line[3].hash);

    let id = U256::from(77u64);
    peer.send(Message::ShareReq(ShareRequest {
        id,
        hashes: vec![line[3].hash],
        parents: VarInt(2),
        stops: Vec::new(),
    }))
    .await;
    let Message::ShareReply(reply) = peer
        .recv_where(|m| matches!(m, Message::ShareReply(_)))
        .await
    else {
        unreachable!()
    };
    assert_eq!(reply.id, id);
    assert_eq!(reply.result, ReplyResult::Good);
    let hashes: Vec<Hash> = reply.shares.iter().map(share_hash).collect();
    assert_eq!(hashes, vec![line[3].hash, line[2].hash, line[1].hash]);
}

#[tokio::test]
async fn first_message_must_be_a_version() {
    let builder = ChainBuilder::new(test_params());
    let node = node_for(&builder);
    let (mut peer, connection) = ScriptedPeer::connect(&node);
    peer.send(Message::Ping).await;
    let result = timeout(WAIT, connection).await.unwrap().unwrap();
    assert!(matches!(
        result,
        Err(PoolError::Protocol(ProtocolError::Misbehaving(_)))
    ));
    assert!(node.is_banned(peer_addr().ip()));
    assert!(node.peers.is_empty());
}

#[tokio::test]
async fn connecting_to_ourselves_is_refused() {
    let builder = ChainBuilder::new(test_params());
    let node = node_for(&builder);
    let (mut peer, connection) = ScriptedPeer::connect(&node);
    peer.recv_where(|m| matches!(m, Message::Version(_))).await;
    peer.send(Message::Version(version(node.nonce, Hash::zero())))
        .await;
    let result = timeout(WAIT, connection).await.unwrap().unwrap();
    assert!(result.is_err());
    assert!(node.peers.is_empty());
}

#[tokio::test]
async fn two_nodes_converge_on_the_best_share() {
    let mut builder = ChainBuilder::new(test_params());
    let line = builder.mine_line(Hash::zero(), 5, ChainBuilder::script(5));
    let seeded = node_for(&builder);
    let fresh = node_for(&builder);
    let raws = line.iter().map(|share| share.to_raw()).collect();
    seeded.handle_shares(raws, None).await;
    assert_eq!(seeded.best_share(), Some(line[4].hash));

    let (a, b) = tokio::io::duplex(1 << 20);
    tokio::spawn(handle_connection(seeded.clone(), a, "10.9.0.1:9333".parse().unwrap(), false));
    tokio::spawn(handle_connection(fresh.clone(), b, "10.9.0.2:9333".parse().unwrap(), true));

    wait_for_best(&fresh, line[4].hash).await;
    assert_eq!(fresh.chain.lock().await.items.len(), 5);
    seeded.cancel.cancel();
    fresh.cancel.cancel();
}

#[tokio::test]
async fn second_connection_with_a_known_nonce_is_closed() {
    let builder = ChainBuilder::new(test_params());
    let node = node_for(&builder);
    let (mut first, _first_connection) = ScriptedPeer::connect(&node);
    first.handshake(Hash::zero()).await;
    wait_for_peers(&node, 1).await;

    let (mut second, connection) = ScriptedPeer::connect_from(&node, "10.4.4.4:9333".parse().unwrap());
    second.handshake(Hash::zero()).await;
    let result = timeout(WAIT, connection).await.unwrap().unwrap();
    assert!(result.is_ok());
    assert!(!node.is_banned("10.4.4.4".parse().unwrap()));
    assert_eq!(node.peers.len(), 1);
    assert_eq!(node.peers.get(&42).unwrap().addr, peer_addr());

    // the first connection is still served
    let id = U256::from(5u64);
    first
        .send(Message::ShareReq(ShareRequest {
            id,
            hashes: vec![Hash::hash256(b"unknown")],
            parents: VarInt(0),
            stops: Vec::new(),
        }))
        .await;
    let Message::ShareReply(reply) = first
        .recv_where(|m| matches!(m, Message::ShareReply(_)))
        .await
    else {
        unreachable!()
    };
    assert_eq!(reply.id, id);
    assert!(reply.shares.is_empty());
}

#[tokio::test]
async fn silent_peer_times_out_without_a_ban() {
    let builder = ChainBuilder::new(test_params());
    let node = node_with(&builder, |config| config.p2p.handshake_timeout_secs = 1);
    let (mut peer, connection) = ScriptedPeer::connect(&node);
    peer.recv_where(|m| matches!(m, Message::Version(_))).await;

    let result = timeout(WAIT, connection).await.unwrap().unwrap();
    assert!(matches!(result, Err(PoolError::Timeout)));
    assert!(!node.is_banned(peer_addr().ip()));
    assert!(node.peers.is_empty());
}

#[tokio::test]
async fn block_found_off_the_best_chain_still_reaches_peers() {
    let mut builder = ChainBuilder::new(test_params());
    builder.block_bits = FloatingInteger(0x207f_ffff);
    let mut trunk = Vec::new();
    let mut previous = Hash::zero();
    for _ in 0..6 {
        let share = mine_block(&mut builder, previous, 1);
        previous = share.hash;
        trunk.push(share);
    }
    let side = mine_block(&mut builder, trunk[1].hash, 2);
    let block = mine_block(&mut builder, side.hash, 2);
    let node = node_for(&builder);

    let (mut source, _source_connection) = ScriptedPeer::connect(&node);
    source.handshake(Hash::zero()).await;
    let (mut observer, _observer_connection) =
        ScriptedPeer::connect_from(&node, "10.7.0.1:9333".parse().unwrap());
    observer.handshake_as(43, Hash::zero()).await;
    wait_for_peers(&node, 2).await;

    source
        .send(Message::Shares(trunk.iter().map(|share| share.to_raw()).collect()))
        .await;
    wait_for_best(&node, trunk[5].hash).await;

    // the block arrives before its parent and cannot be verified yet
    source.send(Message::Shares(vec![block.to_raw()])).await;
    timeout(WAIT, async {
        while !node.desired().iter().any(|d| d.hash == side.hash) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("parent never became desired");

    let from_source = node.peers.get(&42).unwrap().value().clone();
    tokio::spawn(node.clone().handle_share_hashes(vec![side.hash], from_source));
    let Message::ShareReq(request) = source
        .recv_where(|m| matches!(m, Message::ShareReq(_)))
        .await
    else {
        unreachable!()
    };
    assert_eq!(request.hashes, vec![side.hash]);
    source
        .send(Message::ShareReply(ShareReply {
            id: request.id,
            result: ReplyResult::Good,
            shares: vec![side.to_raw()],
        }))
        .await;

    observer
        .recv_where(|m| matches!(m, Message::Shares(raws) if raws.iter().any(|raw| share_hash(raw) == block.hash)))
        .await;
    assert_eq!(node.best_share(), Some(trunk[5].hash));
    assert!(node.chain.lock().await.verified.contains(&block.hash));
}
