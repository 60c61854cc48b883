use crate::network::ProtocolError;
use crate::pack::PackError;
use crate::sha256::Hash;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("malformed share: {0}")]
    MalformedShare(String),
    #[error("invalid share: {0}")]
    InvalidShare(String),
    #[error("missing ancestor {0}")]
    MissingAncestor(Hash),
    #[error("duplicate share {0}")]
    DuplicateShare(Hash),
    #[error("share {0} has children and cannot be removed")]
    NotRemovable(Hash),
    #[error("unknown share {0}")]
    UnknownShare(Hash),
    #[error("only {available} shares known below {start}, {requested} requested")]
    ChainTooShort {
        start: Hash,
        requested: u64,
        available: u64,
    },
    #[error("skip list cannot take a single step from {0}")]
    Overshoot(Hash),
    #[error("request timed out")]
    Timeout,
    #[error("peer refused the request: {0}")]
    RequestRefused(String),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("decode error: {0}")]
    Pack(#[from] PackError),
    #[error("share store: {0}")]
    Store(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PoolError>;
