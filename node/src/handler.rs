use crate::Node;
use crate::peer::Peer;
use sharelib::error::{PoolError, Result};
use sharelib::network::{FrameParser, Message, ProtocolError, ReplyResult, ShareReply, Version};
use sharelib::pack::Pack;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Messages queued for one peer before relays start getting dropped.
const SEND_QUEUE: usize = 64;
const MAX_SUB_VERSION: usize = 512;

/// Runs one connection from handshake to close. Misbehaving peers are
/// banned before this returns.
pub async fn handle_connection<S>(node: Arc<Node>, stream: S, addr: SocketAddr, incoming: bool) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let cancel = node.cancel.child_token();
    let (sender, receiver) = kanal::bounded_async::<Message>(SEND_QUEUE);

    let framing = node.framing;
    let writer_cancel = cancel.clone();
    let writer_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = writer_cancel.cancelled() => break,
                message = receiver.recv() => {
                    let Ok(message) = message else { break };
                    if let Err(e) = message.send_async(&framing, &mut writer).await {
                        debug!("writing to {addr} failed: {e}");
                        writer_cancel.cancel();
                        break;
                    }
                }
            }
        }
        if let Err(e) = writer.shutdown().await {
            debug!("closing the stream to {addr} failed: {e}");
        }
    });

    let result = run_connection(&node, &mut reader, sender, addr, incoming, &cancel).await;
    cancel.cancel();
    if let Err(e) = writer_task.await {
        warn!("writer task for {addr} failed: {e}");
    }

    match &result {
        Err(PoolError::Protocol(ProtocolError::Misbehaving(reason))) => {
            warn!("peer {addr} misbehaved: {reason}");
            node.ban(addr.ip());
        }
        Err(PoolError::Protocol(ProtocolError::BadChecksum { command })) => {
            warn!("peer {addr} sent {command} with a bad checksum");
            node.ban(addr.ip());
        }
        Err(PoolError::Protocol(ProtocolError::Closed)) | Ok(()) => {}
        Err(e) => info!("dropping connection to {addr}: {e}"),
    }
    result
}

async fn run_connection<R>(
    node: &Arc<Node>,
    reader: &mut R,
    sender: kanal::AsyncSender<Message>,
    addr: SocketAddr,
    incoming: bool,
    cancel: &CancellationToken,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let p2p = &node.config.p2p;
    let mut parser = node.framing.parser();

    sender
        .send(Message::Version(node.version_message(addr)))
        .await
        .map_err(|_| ProtocolError::Closed)?;

    let handshake = timeout(
        Duration::from_secs(p2p.handshake_timeout_secs),
        Message::receive_async(&mut parser, reader),
    );
    let version = tokio::select! {
        _ = cancel.cancelled() => return Ok(()),
        result = handshake => match result {
            Err(_) => {
                info!("handshake with {addr} timed out");
                return Err(PoolError::Timeout);
            }
            Ok(message) => match message? {
                Message::Version(version) => version,
                other => {
                    return Err(misbehaving(format!("expected version, got {}", other.command())));
                }
            },
        }
    };
    check_version(node, &version)?;

    let mut sub_version = String::from_utf8_lossy(&version.sub_version.0).into_owned();
    sub_version.truncate(MAX_SUB_VERSION);
    let peer = Arc::new(Peer::new(
        addr,
        version.nonce,
        incoming,
        version.version,
        sub_version,
        version.services,
        sender,
        Duration::from_secs(p2p.request_timeout_secs),
        cancel.clone(),
    ));
    if !node.register_peer(peer.clone()) {
        info!("already connected to {addr} (nonce {:016x}), closing", version.nonce);
        return Ok(());
    }

    spawn_keepalive(node.clone(), peer.clone());
    if !version.best_share_hash.is_zero() {
        tokio::spawn(
            node.clone()
                .handle_share_hashes(vec![version.best_share_hash], peer.clone()),
        );
    }

    let result = message_loop(node, &peer, reader, &mut parser).await;
    node.unregister_peer(&peer);
    peer.replies.fail_all();
    info!("lost peer {addr}");
    result
}

fn misbehaving(reason: String) -> PoolError {
    ProtocolError::Misbehaving(reason).into()
}

fn check_version(node: &Node, version: &Version) -> Result<()> {
    if version.nonce == node.nonce {
        return Err(misbehaving("connected to ourselves".to_string()));
    }
    if version.version < node.net.min_peer_version {
        return Err(misbehaving(format!(
            "protocol version {} is older than {}",
            version.version, node.net.min_peer_version
        )));
    }
    Ok(())
}

async fn message_loop<R>(node: &Arc<Node>, peer: &Arc<Peer>, reader: &mut R, parser: &mut FrameParser) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let idle = Duration::from_secs(node.config.p2p.idle_timeout_secs);
    loop {
        let message = tokio::select! {
            _ = peer.cancel.cancelled() => return Ok(()),
            result = timeout(idle, Message::receive_async(parser, reader)) => match result {
                Err(_) => {
                    info!("connection to {peer} went idle");
                    return Err(PoolError::Timeout);
                }
                Ok(message) => message?,
            }
        };
        handle_message(node, peer, message).await?;
    }
}

async fn handle_message(node: &Arc<Node>, peer: &Arc<Peer>, message: Message) -> Result<()> {
    match message {
        Message::Version(_) => return Err(misbehaving("repeated version message".to_string())),
        Message::Ping => {}
        Message::AddrMe { port } => node.handle_addrme(peer, port).await,
        Message::Addrs(records) => node.handle_addrs(records).await,
        Message::GetAddrs { count } => {
            let records = node.good_addr_records(count).await;
            peer.send(Message::Addrs(records)).await?;
        }
        Message::Shares(shares) => {
            node.handle_shares(shares, Some(peer)).await;
        }
        Message::ShareReq(request) => {
            let shares = node
                .handle_get_shares(&request.hashes, request.parents.0, &request.stops)
                .await;
            let mut reply = ShareReply {
                id: request.id,
                result: ReplyResult::Good,
                shares,
            };
            if reply.packed_size() > node.framing.max_payload {
                debug!("reply of {} shares to {peer} is too long", reply.shares.len());
                reply.result = ReplyResult::TooLong;
                reply.shares.clear();
            }
            peer.send(Message::ShareReply(reply)).await?;
        }
        Message::ShareReply(reply) => {
            if !peer.replies.got_response(reply) {
                debug!("{peer} answered a request we did not make");
            }
        }
        Message::BestBlock(header) => node.handle_header(header).await?,
    }
    Ok(())
}

/// Pings the peer and advertises our port at random intervals until the
/// connection closes.
fn spawn_keepalive(node: Arc<Node>, peer: Arc<Peer>) {
    let pinged = peer.clone();
    tokio::spawn(async move {
        loop {
            let delay = Duration::from_secs_f64(sharelib::util::expovariate(100.0));
            tokio::select! {
                _ = pinged.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
            if pinged.send(Message::Ping).await.is_err() {
                break;
            }
        }
    });

    if !node.config.p2p.advertise {
        return;
    }
    tokio::spawn(async move {
        loop {
            let mean = 100.0 * node.peers.len() as f64 + 1.0;
            let delay = Duration::from_secs_f64(sharelib::util::expovariate(mean));
            tokio::select! {
                _ = peer.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
            let port = node.config.p2p.port;
            if peer.send(Message::AddrMe { port }).await.is_err() {
                break;
            }
        }
    });
}
