//! Peer-to-peer messages and their framing.
//!
//! A frame is `prefix (8) | command (12, NUL padded) | length (u32) |
//! checksum (4) | payload`, where the checksum is the first four bytes of
//! the double SHA-256 of the payload. [`FrameParser`] turns a byte stream
//! into frames without ever needing more than it asks for.

use crate::U256;
use crate::pack::{Pack, PackError, Reader, VarInt, VarStr};
use crate::params::NetworkParams;
use crate::sha256::Hash;
use crate::types::{BlockHeader, RawShare};
use crate::{impl_pack, util};
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::warn;

const COMMAND_LEN: usize = 12;
const HEADER_LEN: usize = COMMAND_LEN + 4 + 4;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("{command} payload of {length} bytes exceeds the {max} byte limit")]
    Oversized {
        command: String,
        length: usize,
        max: usize,
    },
    #[error("bad checksum on {command} message")]
    BadChecksum { command: String },
    #[error("command field is not a valid name")]
    InvalidCommand,
    #[error("cannot decode {command} payload: {source}")]
    Payload {
        command: String,
        #[source]
        source: PackError,
    },
    #[error("connection closed")]
    Closed,
    #[error("peer misbehaving: {0}")]
    Misbehaving(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Peer address as carried on the wire: IPv6 (IPv4 mapped) and a
/// big-endian port.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NetAddress {
    pub services: u64,
    pub address: [u8; 16],
    pub port: u16,
}

impl NetAddress {
    pub fn new(services: u64, addr: SocketAddr) -> Self {
        let ip = match addr.ip() {
            IpAddr::V4(ip) => ip.to_ipv6_mapped(),
            IpAddr::V6(ip) => ip,
        };
        NetAddress {
            services,
            address: ip.octets(),
            port: addr.port(),
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(Ipv6Addr::from(self.address).to_canonical(), self.port)
    }
}

impl Pack for NetAddress {
    fn write(&self, out: &mut Vec<u8>) {
        self.services.write(out);
        self.address.write(out);
        out.extend_from_slice(&self.port.to_be_bytes());
    }
    fn read(reader: &mut Reader<'_>) -> Result<Self, PackError> {
        Ok(NetAddress {
            services: u64::read(reader)?,
            address: reader.take_array()?,
            port: u16::from_be_bytes(reader.take_array()?),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Version {
    pub version: u32,
    pub services: u64,
    pub addr_to: NetAddress,
    pub addr_from: NetAddress,
    pub nonce: u64,
    pub sub_version: VarStr,
    /// always 1
    pub mode: u32,
    /// zero when the sender has no best share
    pub best_share_hash: Hash,
}
impl_pack!(Version {
    version,
    services,
    addr_to,
    addr_from,
    nonce,
    sub_version,
    mode,
    best_share_hash,
});

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AddrRecord {
    pub timestamp: u64,
    pub address: NetAddress,
}
impl_pack!(AddrRecord { timestamp, address });

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShareRequest {
    pub id: U256,
    pub hashes: Vec<Hash>,
    pub parents: VarInt,
    pub stops: Vec<Hash>,
}
impl_pack!(ShareRequest {
    id,
    hashes,
    parents,
    stops
});

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplyResult {
    Good,
    TooLong,
    /// codes 2 to 6, reserved
    Unknown(u8),
}

impl Pack for ReplyResult {
    fn write(&self, out: &mut Vec<u8>) {
        let code = match self {
            ReplyResult::Good => 0,
            ReplyResult::TooLong => 1,
            ReplyResult::Unknown(code) => u64::from(*code),
        };
        VarInt(code).write(out);
    }
    fn read(reader: &mut Reader<'_>) -> Result<Self, PackError> {
        match VarInt::read(reader)?.0 {
            0 => Ok(ReplyResult::Good),
            1 => Ok(ReplyResult::TooLong),
            code @ 2..=6 => Ok(ReplyResult::Unknown(code as u8)),
            value => Err(PackError::InvalidEnum {
                kind: "sharereply result",
                value,
            }),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShareReply {
    pub id: U256,
    pub result: ReplyResult,
    pub shares: Vec<RawShare>,
}
impl_pack!(ShareReply { id, result, shares });

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    Version(Version),
    Ping,
    AddrMe { port: u16 },
    Addrs(Vec<AddrRecord>),
    GetAddrs { count: u32 },
    Shares(Vec<RawShare>),
    ShareReq(ShareRequest),
    ShareReply(ShareReply),
    BestBlock(BlockHeader),
}

impl Message {
    pub fn command(&self) -> &'static str {
        match self {
            Message::Version(_) => "version",
            Message::Ping => "ping",
            Message::AddrMe { .. } => "addrme",
            Message::Addrs(_) => "addrs",
            Message::GetAddrs { .. } => "getaddrs",
            Message::Shares(_) => "shares",
            Message::ShareReq(_) => "sharereq",
            Message::ShareReply(_) => "sharereply",
            Message::BestBlock(_) => "bestblock",
        }
    }

    pub fn payload(&self) -> Vec<u8> {
        match self {
            Message::Version(version) => version.pack(),
            Message::Ping => Vec::new(),
            Message::AddrMe { port } => port.to_be_bytes().to_vec(),
            Message::Addrs(addrs) => addrs.pack(),
            Message::GetAddrs { count } => count.pack(),
            Message::Shares(shares) => shares.pack(),
            Message::ShareReq(request) => request.pack(),
            Message::ShareReply(reply) => reply.pack(),
            Message::BestBlock(header) => header.pack(),
        }
    }

    /// `Ok(None)` for commands this node does not speak.
    pub fn decode(command: &str, payload: &[u8]) -> Result<Option<Message>, ProtocolError> {
        let wrap = |source| ProtocolError::Payload {
            command: command.to_string(),
            source,
        };
        let message = match command {
            "version" => Message::Version(Version::unpack(payload).map_err(wrap)?),
            "ping" => Message::Ping,
            "addrme" => {
                let port = <[u8; 2]>::unpack(payload).map_err(wrap)?;
                Message::AddrMe {
                    port: u16::from_be_bytes(port),
                }
            }
            "addrs" => Message::Addrs(Vec::unpack(payload).map_err(wrap)?),
            "getaddrs" => Message::GetAddrs {
                count: u32::unpack(payload).map_err(wrap)?,
            },
            "shares" => Message::Shares(Vec::unpack(payload).map_err(wrap)?),
            "sharereq" => Message::ShareReq(ShareRequest::unpack(payload).map_err(wrap)?),
            "sharereply" => Message::ShareReply(ShareReply::unpack(payload).map_err(wrap)?),
            "bestblock" => Message::BestBlock(BlockHeader::unpack(payload).map_err(wrap)?),
            _ => return Ok(None),
        };
        Ok(Some(message))
    }

    /// Writes one framed message.
    pub async fn send_async(
        &self,
        framing: &Framing,
        writer: &mut (impl AsyncWrite + Unpin),
    ) -> Result<(), ProtocolError> {
        let bytes = framing.encode(self)?;
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Reads frames until one carries a message this node understands.
    pub async fn receive_async(
        parser: &mut FrameParser,
        reader: &mut (impl AsyncRead + Unpin),
    ) -> Result<Message, ProtocolError> {
        loop {
            let frame = parser.read_frame(reader).await?;
            if let Some(message) = Message::decode(&frame.command, &frame.payload)? {
                return Ok(message);
            }
            tracing::debug!("ignoring unknown command {:?}", frame.command);
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub command: String,
    pub payload: Vec<u8>,
}

fn checksum(payload: &[u8]) -> [u8; 4] {
    let hash = Hash::hash256(payload);
    let mut out = [0u8; 4];
    out.copy_from_slice(&hash.as_bytes()[..4]);
    out
}

/// Prefix and size limit of one network's frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Framing {
    pub prefix: [u8; 8],
    pub max_payload: usize,
}

impl Framing {
    pub fn new(net: &NetworkParams) -> Self {
        Framing {
            prefix: net.prefix_bytes(),
            max_payload: net.max_payload_length,
        }
    }

    pub fn parser(&self) -> FrameParser {
        FrameParser::new(self.prefix, self.max_payload)
    }

    pub fn encode(&self, message: &Message) -> Result<Vec<u8>, ProtocolError> {
        self.encode_frame(message.command(), &message.payload())
    }

    pub fn encode_frame(&self, command: &str, payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        if command.len() > COMMAND_LEN {
            return Err(ProtocolError::InvalidCommand);
        }
        if payload.len() > self.max_payload {
            return Err(ProtocolError::Oversized {
                command: command.to_string(),
                length: payload.len(),
                max: self.max_payload,
            });
        }
        let mut out = Vec::with_capacity(self.prefix.len() + HEADER_LEN + payload.len());
        out.extend_from_slice(&self.prefix);
        let mut name = [0u8; COMMAND_LEN];
        name[..command.len()].copy_from_slice(command.as_bytes());
        out.extend_from_slice(&name);
        out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        out.extend_from_slice(&checksum(payload));
        out.extend_from_slice(payload);
        Ok(out)
    }

    /// Packs `shares` into as few `shares` messages as fit, halving batches
    /// that are too large. A single share that cannot fit is dropped.
    pub fn fragment_shares(&self, shares: Vec<RawShare>) -> Vec<Message> {
        let mut out = Vec::new();
        let mut pending = vec![shares];
        while let Some(mut batch) = pending.pop() {
            if batch.is_empty() {
                continue;
            }
            if batch.packed_size() <= self.max_payload {
                out.push(Message::Shares(batch));
                continue;
            }
            if batch.len() == 1 {
                warn!("dropping a share too large for any message");
                continue;
            }
            let second = batch.split_off(batch.len() / 2);
            // popped first half first
            pending.push(second);
            pending.push(batch);
        }
        out
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum ParseState {
    SeekPrefix,
    Header,
    Payload {
        command: String,
        length: usize,
        checksum: [u8; 4],
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Parsed {
    /// at least this many more bytes are needed
    NeedBytes(usize),
    Complete(Frame),
}

/// Incremental frame decoder. Bytes before a prefix are skipped.
#[derive(Clone, Debug)]
pub struct FrameParser {
    prefix: [u8; 8],
    max_payload: usize,
    buffer: Vec<u8>,
    state: ParseState,
}

impl FrameParser {
    pub fn new(prefix: [u8; 8], max_payload: usize) -> Self {
        FrameParser {
            prefix,
            max_payload,
            buffer: Vec::new(),
            state: ParseState::SeekPrefix,
        }
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Advances as far as the buffered bytes allow.
    pub fn next(&mut self) -> Result<Parsed, ProtocolError> {
        loop {
            match &self.state {
                ParseState::SeekPrefix => {
                    let found = self
                        .buffer
                        .windows(self.prefix.len())
                        .position(|window| window == self.prefix);
                    match found {
                        Some(position) => {
                            self.buffer.drain(..position + self.prefix.len());
                            self.state = ParseState::Header;
                        }
                        None => {
                            // keep a possible partial prefix
                            let keep = self.buffer.len().min(self.prefix.len() - 1);
                            self.buffer.drain(..self.buffer.len() - keep);
                            return Ok(Parsed::NeedBytes(self.prefix.len() - keep));
                        }
                    }
                }
                ParseState::Header => {
                    if self.buffer.len() < HEADER_LEN {
                        return Ok(Parsed::NeedBytes(HEADER_LEN - self.buffer.len()));
                    }
                    let header: Vec<u8> = self.buffer.drain(..HEADER_LEN).collect();
                    let command = parse_command(&header[..COMMAND_LEN])?;
                    let mut length = [0u8; 4];
                    length.copy_from_slice(&header[COMMAND_LEN..COMMAND_LEN + 4]);
                    let length = u32::from_le_bytes(length) as usize;
                    if length > self.max_payload {
                        self.state = ParseState::SeekPrefix;
                        return Err(ProtocolError::Oversized {
                            command,
                            length,
                            max: self.max_payload,
                        });
                    }
                    let mut checksum = [0u8; 4];
                    checksum.copy_from_slice(&header[COMMAND_LEN + 4..]);
                    self.state = ParseState::Payload {
                        command,
                        length,
                        checksum,
                    };
                }
                ParseState::Payload {
                    command,
                    length,
                    checksum: expected,
                } => {
                    if self.buffer.len() < *length {
                        return Ok(Parsed::NeedBytes(*length - self.buffer.len()));
                    }
                    let payload: Vec<u8> = self.buffer.drain(..*length).collect();
                    let command = command.clone();
                    let matches = checksum(&payload) == *expected;
                    self.state = ParseState::SeekPrefix;
                    if !matches {
                        return Err(ProtocolError::BadChecksum { command });
                    }
                    return Ok(Parsed::Complete(Frame { command, payload }));
                }
            }
        }
    }

    /// Reads exactly the bytes the parser asks for until a frame completes.
    pub async fn read_frame(
        &mut self,
        reader: &mut (impl AsyncRead + Unpin),
    ) -> Result<Frame, ProtocolError> {
        loop {
            match self.next()? {
                Parsed::Complete(frame) => return Ok(frame),
                Parsed::NeedBytes(count) => {
                    let mut bytes = vec![0u8; count];
                    match reader.read_exact(&mut bytes).await {
                        Ok(_) => self.feed(&bytes),
                        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                            return Err(ProtocolError::Closed);
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }
    }
}

fn parse_command(raw: &[u8]) -> Result<String, ProtocolError> {
    let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
    if raw[end..].iter().any(|b| *b != 0) {
        return Err(ProtocolError::InvalidCommand);
    }
    let name = &raw[..end];
    if name.is_empty() || !name.iter().all(|b| b.is_ascii_graphic()) {
        return Err(ProtocolError::InvalidCommand);
    }
    String::from_utf8(name.to_vec()).map_err(|_| ProtocolError::InvalidCommand)
}

/// Address record stamped with the current time.
pub fn addr_record(services: u64, addr: SocketAddr) -> AddrRecord {
    AddrRecord {
        timestamp: util::now().max(0) as u64,
        address: NetAddress::new(services, addr),
    }
}
