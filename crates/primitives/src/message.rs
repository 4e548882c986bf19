use alloy_primitives::B256;
use alloy_rlp::{Decodable, Encodable, Header};

use crate::l1::L1IncomingMessage;

/// A message in the canonical log: the L1 payload plus the cumulative
/// number of delayed-inbox messages consumed up to and including it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageWithMetadata {
    pub message: L1IncomingMessage,
    pub delayed_messages_read: u64,
}

impl MessageWithMetadata {
    /// Semantic equality: byte equality after clearing the batch-gas-cost
    /// cache on both sides.
    pub fn equals_ignoring_caches(&self, other: &Self) -> bool {
        self.delayed_messages_read == other.delayed_messages_read
            && self.message.equals_ignoring_batch_gas_cost(&other.message)
    }
}

impl Encodable for MessageWithMetadata {
    fn length(&self) -> usize {
        let payload_len = self.message.length() + self.delayed_messages_read.length();
        let header = Header { list: true, payload_length: payload_len };
        header.length() + payload_len
    }

    fn encode(&self, out: &mut dyn bytes::BufMut) {
        let payload_len = self.message.length() + self.delayed_messages_read.length();
        Header { list: true, payload_length: payload_len }.encode(out);
        self.message.encode(out);
        self.delayed_messages_read.encode(out);
    }
}

impl Decodable for MessageWithMetadata {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        let header = Header::decode(buf)?;
        if !header.list {
            return Err(alloy_rlp::Error::Custom("expected list for MessageWithMetadata"));
        }
        let mut bytes = &buf[..header.payload_length];
        let message = L1IncomingMessage::decode(&mut bytes)?;
        let delayed_messages_read = u64::decode(&mut bytes)?;
        *buf = &buf[header.payload_length..];
        Ok(Self { message, delayed_messages_read })
    }
}

/// A log message paired with the block hash its execution produced, when
/// one is known (feed messages carry it; freshly synced ones do not).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageWithMetadataAndBlockHash {
    pub message_with_meta: MessageWithMetadata,
    pub block_hash: Option<B256>,
}

/// A block's hash as stored in the database. The wrapper keeps an absent
/// hash representable for entries written before hashes were recorded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockHashDbValue {
    pub block_hash: Option<B256>,
}

impl Encodable for BlockHashDbValue {
    fn length(&self) -> usize {
        self.block_hash.map_or(1, |h| h.length())
    }

    fn encode(&self, out: &mut dyn bytes::BufMut) {
        match self.block_hash {
            Some(h) => h.encode(out),
            None => out.put_u8(0x80),
        }
    }
}

impl Decodable for BlockHashDbValue {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        if buf.first().copied() == Some(0x80) {
            *buf = &buf[1..];
            return Ok(Self { block_hash: None });
        }
        let h = B256::decode(buf)?;
        Ok(Self { block_hash: Some(h) })
    }
}

/// Result of digesting one message in the execution engine.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MessageResult {
    pub block_hash: B256,
    pub send_root: B256,
}

/// An unconfirmed message received over the broadcast feed.
#[derive(Clone, Debug)]
pub struct BroadcastFeedMessage {
    pub sequence_number: u64,
    pub message: MessageWithMetadata,
    pub block_hash: Option<B256>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::l1::L1IncomingMessageHeader;
    use alloy_primitives::{Address, U256};

    fn msg(delayed: u64) -> MessageWithMetadata {
        MessageWithMetadata {
            message: L1IncomingMessage {
                header: L1IncomingMessageHeader {
                    kind: 3,
                    poster: Address::ZERO,
                    block_number: 0,
                    timestamp: 0,
                    request_id: None,
                    l1_base_fee: U256::ZERO,
                },
                l2msg: vec![0xab],
                batch_gas_cost: None,
            },
            delayed_messages_read: delayed,
        }
    }

    #[test]
    fn message_with_metadata_roundtrip() {
        let m = msg(4);
        let encoded = alloy_rlp::encode(&m);
        assert_eq!(MessageWithMetadata::decode(&mut encoded.as_slice()).unwrap(), m);
    }

    #[test]
    fn block_hash_value_roundtrip() {
        for h in [None, Some(B256::repeat_byte(0x11))] {
            let v = BlockHashDbValue { block_hash: h };
            let encoded = alloy_rlp::encode(&v);
            assert_eq!(BlockHashDbValue::decode(&mut encoded.as_slice()).unwrap(), v);
        }
    }
}
