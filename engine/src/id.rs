//! Operation IDs and sync tokens.
//!
//! Both use `YYYYMMDDhhmmss` followed by a random alphanumeric suffix. The
//! suffix comes from the thread-local CSPRNG (reseeded from the OS), so IDs
//! minted in the same second by concurrent sessions do not collide.

use crate::{OperationId, Timestamp};
use rand::distributions::Alphanumeric;
use rand::Rng;

/// Length of the random suffix of operation IDs.
pub const OPERATION_ID_SUFFIX_LEN: usize = 8;

/// Length of the random suffix of sync tokens.
pub const SYNC_TOKEN_SUFFIX_LEN: usize = 16;

fn timestamped(now: Timestamp, suffix_len: usize) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(suffix_len)
        .map(char::from)
        .collect();
    format!("{}{}", now.format("%Y%m%d%H%M%S"), suffix)
}

/// Mint a server-side operation ID.
pub fn operation_id(now: Timestamp) -> OperationId {
    timestamped(now, OPERATION_ID_SUFFIX_LEN)
}

/// Mint the token identifying a completed sync session.
pub fn sync_token(now: Timestamp) -> String {
    timestamped(now, SYNC_TOKEN_SUFFIX_LEN)
}
