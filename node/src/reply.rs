//! Matches `sharereply` messages to the requests that caused them.

use dashmap::DashMap;
use rand::Rng;
use sharelib::U256;
use sharelib::error::{PoolError, Result};
use sharelib::network::{ProtocolError, ReplyResult, ShareReply};
use sharelib::types::RawShare;
use std::time::Duration;
use tokio::sync::oneshot;

pub struct ReplyMatcher {
    pending: DashMap<U256, oneshot::Sender<ShareReply>>,
    timeout: Duration,
}

/// A request waiting for its reply.
pub struct PendingReply {
    pub id: U256,
    receiver: oneshot::Receiver<ShareReply>,
}

impl ReplyMatcher {
    pub fn new(timeout: Duration) -> Self {
        ReplyMatcher {
            pending: DashMap::new(),
            timeout,
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Reserves a fresh request id.
    pub fn register(&self) -> PendingReply {
        let (sender, receiver) = oneshot::channel();
        let mut rng = rand::thread_rng();
        loop {
            let id = U256(rng.r#gen());
            if let dashmap::mapref::entry::Entry::Vacant(entry) = self.pending.entry(id) {
                entry.insert(sender);
                return PendingReply { id, receiver };
            }
        }
    }

    /// Waits for the reply to `pending`. The id is released on timeout.
    pub async fn wait(&self, pending: PendingReply) -> Result<Vec<RawShare>> {
        let PendingReply { id, receiver } = pending;
        let reply = match tokio::time::timeout(self.timeout, receiver).await {
            Ok(Ok(reply)) => reply,
            // sender dropped: the connection closed
            Ok(Err(_)) => return Err(ProtocolError::Closed.into()),
            Err(_) => {
                self.pending.remove(&id);
                return Err(PoolError::Timeout);
            }
        };
        match reply.result {
            ReplyResult::Good => Ok(reply.shares),
            other => Err(PoolError::RequestRefused(format!("{other:?}"))),
        }
    }

    /// Delivers a reply; false when nothing is waiting for its id.
    pub fn got_response(&self, reply: ShareReply) -> bool {
        match self.pending.remove(&reply.id) {
            Some((_, sender)) => sender.send(reply).is_ok(),
            None => false,
        }
    }

    /// Fails every outstanding request.
    pub fn fail_all(&self) {
        self.pending.clear();
    }
}
