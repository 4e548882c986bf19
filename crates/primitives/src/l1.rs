use alloy_primitives::{Address, B256, U256};
use alloy_rlp::{Decodable, Encodable, Header};
use anyhow::anyhow;

/// Message kinds understood by the streamer. Everything else is opaque.
pub const L1_MESSAGE_TYPE_L2_MESSAGE: u8 = 3;
pub const L1_MESSAGE_TYPE_INITIALIZE: u8 = 11;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct L1IncomingMessageHeader {
    pub kind: u8,
    pub poster: Address,
    pub block_number: u64,
    pub timestamp: u64,
    pub request_id: Option<B256>,
    pub l1_base_fee: U256,
}

impl L1IncomingMessageHeader {
    /// The delayed-inbox sequence number carried in `request_id`.
    pub fn seq_num(&self) -> anyhow::Result<u64> {
        let Some(req) = self.request_id else {
            return Err(anyhow!("message header has no requestId"));
        };
        let n = U256::from_be_bytes(req.0);
        if n > U256::from(u64::MAX) {
            return Err(anyhow!("requestId out of range"));
        }
        Ok(n.to::<u64>())
    }

    fn payload_length(&self) -> usize {
        self.kind.length()
            + self.poster.length()
            + self.block_number.length()
            + self.timestamp.length()
            + self.request_id.map_or(1, |req| req.length())
            + self.l1_base_fee.length()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct L1IncomingMessage {
    pub header: L1IncomingMessageHeader,
    pub l2msg: Vec<u8>,
    /// Derived cache; its presence is not a semantic difference.
    pub batch_gas_cost: Option<u64>,
}

impl L1IncomingMessage {
    pub fn cleared_batch_gas_cost(&self) -> Self {
        let mut msg = self.clone();
        msg.batch_gas_cost = None;
        msg
    }

    /// Equality under the rule that the batch-gas-cost cache carries no
    /// meaning.
    pub fn equals_ignoring_batch_gas_cost(&self, other: &Self) -> bool {
        self.header == other.header && self.l2msg == other.l2msg
    }

    fn payload_length(&self) -> usize {
        self.header.length()
            + self.l2msg.length()
            + self.batch_gas_cost.map_or(0, |g| g.length())
    }
}

impl Encodable for L1IncomingMessageHeader {
    fn length(&self) -> usize {
        let payload_len = self.payload_length();
        let header = Header { list: true, payload_length: payload_len };
        header.length() + payload_len
    }

    fn encode(&self, out: &mut dyn bytes::BufMut) {
        let header = Header { list: true, payload_length: self.payload_length() };
        header.encode(out);
        self.kind.encode(out);
        self.poster.encode(out);
        self.block_number.encode(out);
        self.timestamp.encode(out);
        match self.request_id {
            Some(req) => req.encode(out),
            // Empty list marks an absent requestId.
            None => out.put_u8(0xc0),
        }
        self.l1_base_fee.encode(out);
    }
}

impl Decodable for L1IncomingMessageHeader {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        let payload = Header::decode(buf)?;
        if !payload.list {
            return Err(alloy_rlp::Error::Custom("expected list for L1IncomingMessageHeader"));
        }
        let mut bytes = &buf[..payload.payload_length];
        let kind = u8::decode(&mut bytes)?;
        let poster = Address::decode(&mut bytes)?;
        let block_number = u64::decode(&mut bytes)?;
        let timestamp = u64::decode(&mut bytes)?;
        let peek = *bytes.first().ok_or(alloy_rlp::Error::InputTooShort)?;
        let request_id = if peek == 0xc0 {
            bytes = &bytes[1..];
            None
        } else {
            Some(B256::decode(&mut bytes)?)
        };
        let l1_base_fee = U256::decode(&mut bytes)?;
        *buf = &buf[payload.payload_length..];
        Ok(Self { kind, poster, block_number, timestamp, request_id, l1_base_fee })
    }
}

impl Encodable for L1IncomingMessage {
    fn length(&self) -> usize {
        let payload_len = self.payload_length();
        let header = Header { list: true, payload_length: payload_len };
        header.length() + payload_len
    }

    fn encode(&self, out: &mut dyn bytes::BufMut) {
        let header = Header { list: true, payload_length: self.payload_length() };
        header.encode(out);
        self.header.encode(out);
        self.l2msg.encode(out);
        if let Some(g) = self.batch_gas_cost {
            g.encode(out);
        }
    }
}

impl Decodable for L1IncomingMessage {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        let payload = Header::decode(buf)?;
        if !payload.list {
            return Err(alloy_rlp::Error::Custom("expected list for L1IncomingMessage"));
        }
        let mut bytes = &buf[..payload.payload_length];
        let header = L1IncomingMessageHeader::decode(&mut bytes)?;
        let l2msg = Vec::<u8>::decode(&mut bytes)?;
        let batch_gas_cost = if bytes.is_empty() { None } else { Some(u64::decode(&mut bytes)?) };
        *buf = &buf[payload.payload_length..];
        Ok(Self { header, l2msg, batch_gas_cost })
    }
}
