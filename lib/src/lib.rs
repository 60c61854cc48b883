use serde::{Deserialize, Serialize};
use uint::construct_uint;
construct_uint! {
// consisting of 4 x 64-bit words
#[derive(Serialize, Deserialize)]
pub struct U256(4);
}
construct_uint! {
// intermediate products of payout arithmetic
pub struct U512(8);
}

impl From<U256> for U512 {
    fn from(value: U256) -> Self {
        let mut words = [0u64; 8];
        words[..4].copy_from_slice(&value.0);
        U512(words)
    }
}
pub mod chain;
pub mod error;
pub mod event;
pub mod forest;
pub mod network;
pub mod pack;
pub mod params;
pub mod sha256;
pub mod skiplist;
pub mod store;
pub mod types;
pub mod util;
pub mod weights;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

// version advertised in the handshake
pub const PROTOCOL_VERSION: u32 = 3301;
// share wire format understood by this build
pub const SHARE_TYPE: u64 = 17;
// weights are expressed in 1/65535 units of a share's attempts
pub const DONATION_SCALE: u64 = 65535;
// how far back `far_share_hash` points
pub const FAR_SHARE_DISTANCE: u64 = 99;
// maximum number of shares served for a single request
pub const MAX_SHARES_PER_REQUEST: u64 = 1000;
// a share may claim a timestamp at most this far in the future (seconds)
pub const MAX_FUTURE_TIMESTAMP: i64 = 600;
