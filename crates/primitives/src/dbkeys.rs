pub const MESSAGE_PREFIX: &[u8] = b"m";
pub const BLOCK_HASH_INPUT_FEED_PREFIX: &[u8] = b"b";

pub const MESSAGE_COUNT_KEY: &[u8] = b"_messageCount";
pub const ESPRESSO_SUBMITTED_POS_KEY: &[u8] = b"_espressoSubmittedPos";
pub const ESPRESSO_SUBMITTED_HASH_KEY: &[u8] = b"_espressoSubmittedHash";
pub const ESPRESSO_PENDING_TXNS_POSITIONS_KEY: &[u8] = b"_espressoPendingTxnsPositions";

/// Encodes a u64 as bytes in a lexically sortable manner for database
/// iteration. Only used for database keys; values use RLP.
pub fn uint64_to_key(x: u64) -> [u8; 8] {
    x.to_be_bytes()
}

pub fn db_key(prefix: &[u8], index: u64) -> Vec<u8> {
    let mut v = Vec::with_capacity(prefix.len() + 8);
    v.extend_from_slice(prefix);
    v.extend_from_slice(&uint64_to_key(index));
    v
}
