mod block;
mod share;
mod transaction;

pub use block::{
    Block, BlockHeader, FloatingInteger, average_attempts_to_target, target_to_average_attempts,
};
pub use share::{
    Punishment, RawShare, Share, ShareContents, ShareData, ShareInfo, StaleInfo,
    generate_share_transaction, ref_hash,
};
pub use transaction::{OutPoint, Script, Transaction, TxIn, TxOut, sigop_count};
