//! The coin node this pool mines on top of.

use anyhow::Result;
use async_trait::async_trait;
use sharelib::sha256::Hash;
use sharelib::types::{Block, BlockHeader, FloatingInteger, Transaction};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tracing::info;

/// Height reported for blocks the upstream node does not know.
pub const UNKNOWN_BLOCK_HEIGHT: i64 = -1_000_000;

/// What miners should currently build on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpstreamWork {
    pub version: u32,
    pub previous_block: Hash,
    pub bits: FloatingInteger,
    pub subsidy: u64,
    pub height: i64,
    pub transactions: Vec<Transaction>,
}

#[async_trait]
pub trait UpstreamNode: Send + Sync {
    async fn get_block(&self, hash: Hash) -> Result<Option<Block>>;
    async fn get_block_header(&self, hash: Hash) -> Result<Option<BlockHeader>>;
    async fn submit_transaction(&self, tx: Transaction) -> Result<()>;
    async fn submit_block(&self, block: Block) -> Result<()>;
    /// Headers of newly announced blocks.
    fn subscribe_headers(&self) -> broadcast::Receiver<BlockHeader>;
    fn current_work(&self) -> UpstreamWork;
    /// Height of `hash` relative to the current tip: 0 for the tip,
    /// negative below it.
    fn block_rel_height(&self, hash: &Hash) -> i64;
}

struct StaticState {
    work: UpstreamWork,
    headers: HashMap<Hash, (BlockHeader, i64)>,
    blocks: HashMap<Hash, Block>,
    submitted_blocks: Vec<Block>,
    submitted_transactions: Vec<Transaction>,
}

/// Upstream whose work only changes when told to. Records everything
/// submitted to it.
pub struct StaticUpstream {
    state: Mutex<StaticState>,
    headers: broadcast::Sender<BlockHeader>,
}

impl StaticUpstream {
    pub fn new(work: UpstreamWork) -> Self {
        let (headers, _) = broadcast::channel(64);
        StaticUpstream {
            state: Mutex::new(StaticState {
                work,
                headers: HashMap::new(),
                blocks: HashMap::new(),
                submitted_blocks: Vec::new(),
                submitted_transactions: Vec::new(),
            }),
            headers,
        }
    }

    fn state(&self) -> MutexGuard<'_, StaticState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_work(&self, work: UpstreamWork) {
        self.state().work = work;
    }

    /// Records `header` at `height` and announces it to subscribers.
    pub fn announce_header(&self, header: BlockHeader, height: i64) {
        self.state()
            .headers
            .insert(header.hash(), (header.clone(), height));
        // nobody listening is fine
        let _ = self.headers.send(header);
    }

    pub fn submitted_blocks(&self) -> Vec<Block> {
        self.state().submitted_blocks.clone()
    }

    pub fn submitted_transactions(&self) -> Vec<Transaction> {
        self.state().submitted_transactions.clone()
    }
}

#[async_trait]
impl UpstreamNode for StaticUpstream {
    async fn get_block(&self, hash: Hash) -> Result<Option<Block>> {
        Ok(self.state().blocks.get(&hash).cloned())
    }

    async fn get_block_header(&self, hash: Hash) -> Result<Option<BlockHeader>> {
        let state = self.state();
        Ok(state
            .headers
            .get(&hash)
            .map(|(header, _)| header.clone())
            .or_else(|| state.blocks.get(&hash).map(|block| block.header.clone())))
    }

    async fn submit_transaction(&self, tx: Transaction) -> Result<()> {
        self.state().submitted_transactions.push(tx);
        Ok(())
    }

    async fn submit_block(&self, block: Block) -> Result<()> {
        info!("upstream accepted block {}", block.hash());
        let mut state = self.state();
        state.blocks.insert(block.hash(), block.clone());
        state.submitted_blocks.push(block);
        Ok(())
    }

    fn subscribe_headers(&self) -> broadcast::Receiver<BlockHeader> {
        self.headers.subscribe()
    }

    fn current_work(&self) -> UpstreamWork {
        self.state().work.clone()
    }

    fn block_rel_height(&self, hash: &Hash) -> i64 {
        let state = self.state();
        if *hash == state.work.previous_block {
            return 0;
        }
        match state.headers.get(hash) {
            Some((_, height)) => (height - state.work.height).min(0),
            None => UNKNOWN_BLOCK_HEIGHT,
        }
    }
}
