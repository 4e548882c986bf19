//! Payload codec for messages routed through the Espresso notarizer.
//!
//! A notarized message is an L2 message whose payload starts with the
//! Espresso L2-message kind byte, followed by an RLP list of transaction
//! payloads and a justification record. The justification starts out with
//! every field absent and is back-filled once the notarizer finalizes the
//! submission.

use alloy_rlp::{Decodable, Encodable, Header};
use anyhow::anyhow;

use crate::l1::{L1IncomingMessage, L1IncomingMessageHeader, L1_MESSAGE_TYPE_L2_MESSAGE};

pub const L2_MESSAGE_KIND_ESPRESSO: u8 = 10;

/// Proof bundle attached to notarizer-routed messages. All fields are
/// opaque blobs produced by the notarizer query service.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EspressoJustification {
    pub header: Option<Vec<u8>>,
    pub proof: Option<Vec<u8>>,
    pub vid_common: Option<Vec<u8>>,
    pub block_merkle: Option<Vec<u8>>,
}

fn opt_length(v: &Option<Vec<u8>>) -> usize {
    v.as_ref().map_or(1, |b| b.length())
}

fn opt_encode(v: &Option<Vec<u8>>, out: &mut dyn bytes::BufMut) {
    match v {
        Some(b) => b.encode(out),
        // Empty list marks an absent field, as with an absent requestId.
        None => out.put_u8(0xc0),
    }
}

fn opt_decode(buf: &mut &[u8]) -> alloy_rlp::Result<Option<Vec<u8>>> {
    if buf.first().copied() == Some(0xc0) {
        *buf = &buf[1..];
        return Ok(None);
    }
    Ok(Some(Vec::<u8>::decode(buf)?))
}

impl EspressoJustification {
    fn payload_length(&self) -> usize {
        opt_length(&self.header)
            + opt_length(&self.proof)
            + opt_length(&self.vid_common)
            + opt_length(&self.block_merkle)
    }
}

impl Encodable for EspressoJustification {
    fn length(&self) -> usize {
        let payload_len = self.payload_length();
        let header = Header { list: true, payload_length: payload_len };
        header.length() + payload_len
    }

    fn encode(&self, out: &mut dyn bytes::BufMut) {
        Header { list: true, payload_length: self.payload_length() }.encode(out);
        opt_encode(&self.header, out);
        opt_encode(&self.proof, out);
        opt_encode(&self.vid_common, out);
        opt_encode(&self.block_merkle, out);
    }
}

impl Decodable for EspressoJustification {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        let header = Header::decode(buf)?;
        if !header.list {
            return Err(alloy_rlp::Error::Custom("expected list for EspressoJustification"));
        }
        let mut bytes = &buf[..header.payload_length];
        let jst = Self {
            header: opt_decode(&mut bytes)?,
            proof: opt_decode(&mut bytes)?,
            vid_common: opt_decode(&mut bytes)?,
            block_merkle: opt_decode(&mut bytes)?,
        };
        *buf = &buf[header.payload_length..];
        Ok(jst)
    }
}

struct EspressoMessageBody {
    txns: Vec<Vec<u8>>,
    justification: EspressoJustification,
}

impl EspressoMessageBody {
    fn txns_payload_length(&self) -> usize {
        self.txns.iter().map(|t| t.length()).sum()
    }

    fn payload_length(&self) -> usize {
        let txns_payload = self.txns_payload_length();
        let txns_header = Header { list: true, payload_length: txns_payload };
        txns_header.length() + txns_payload + self.justification.length()
    }
}

impl Encodable for EspressoMessageBody {
    fn length(&self) -> usize {
        let payload_len = self.payload_length();
        let header = Header { list: true, payload_length: payload_len };
        header.length() + payload_len
    }

    fn encode(&self, out: &mut dyn bytes::BufMut) {
        Header { list: true, payload_length: self.payload_length() }.encode(out);
        Header { list: true, payload_length: self.txns_payload_length() }.encode(out);
        for txn in &self.txns {
            txn.encode(out);
        }
        self.justification.encode(out);
    }
}

impl Decodable for EspressoMessageBody {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        let header = Header::decode(buf)?;
        if !header.list {
            return Err(alloy_rlp::Error::Custom("expected list for espresso message body"));
        }
        let mut bytes = &buf[..header.payload_length];
        let txns_header = Header::decode(&mut bytes)?;
        if !txns_header.list {
            return Err(alloy_rlp::Error::Custom("expected list of espresso transactions"));
        }
        let mut txn_bytes = &bytes[..txns_header.payload_length];
        let mut txns = Vec::new();
        while !txn_bytes.is_empty() {
            txns.push(Vec::<u8>::decode(&mut txn_bytes)?);
        }
        bytes = &bytes[txns_header.payload_length..];
        let justification = EspressoJustification::decode(&mut bytes)?;
        *buf = &buf[header.payload_length..];
        Ok(Self { txns, justification })
    }
}

pub fn is_espresso_msg(msg: &L1IncomingMessage) -> bool {
    msg.header.kind == L1_MESSAGE_TYPE_L2_MESSAGE
        && msg.l2msg.first() == Some(&L2_MESSAGE_KIND_ESPRESSO)
}

/// Splits a notarized message into its transaction payloads and
/// justification.
pub fn parse_espresso_msg(
    msg: &L1IncomingMessage,
) -> anyhow::Result<(Vec<Vec<u8>>, EspressoJustification)> {
    if !is_espresso_msg(msg) {
        return Err(anyhow!("not an espresso message"));
    }
    let mut bytes = &msg.l2msg[1..];
    let body = EspressoMessageBody::decode(&mut bytes)
        .map_err(|e| anyhow!("malformed espresso message body: {e}"))?;
    Ok((body.txns, body.justification))
}

/// Builds a notarized message from transaction payloads and a
/// justification, reusing the original header.
pub fn espresso_message_from_txns(
    txns: Vec<Vec<u8>>,
    justification: &EspressoJustification,
    header: &L1IncomingMessageHeader,
) -> L1IncomingMessage {
    let body = EspressoMessageBody { txns, justification: justification.clone() };
    let mut l2msg = Vec::with_capacity(1 + body.length());
    l2msg.push(L2_MESSAGE_KIND_ESPRESSO);
    body.encode(&mut l2msg);
    L1IncomingMessage { header: header.clone(), l2msg, batch_gas_cost: None }
}

/// Builds the single-transaction message the sovereign-sequencer path
/// submits and later finalizes.
pub fn message_from_espresso_sovereign_txn(
    txn: Vec<u8>,
    justification: &EspressoJustification,
    header: &L1IncomingMessageHeader,
) -> L1IncomingMessage {
    espresso_message_from_txns(vec![txn], justification, header)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{Address, U256};

    fn l2_header() -> L1IncomingMessageHeader {
        L1IncomingMessageHeader {
            kind: L1_MESSAGE_TYPE_L2_MESSAGE,
            poster: Address::ZERO,
            block_number: 1,
            timestamp: 2,
            request_id: None,
            l1_base_fee: U256::ZERO,
        }
    }

    #[test]
    fn parse_rebuild_roundtrip() {
        let jst = EspressoJustification {
            header: Some(vec![1]),
            proof: None,
            vid_common: Some(vec![]),
            block_merkle: None,
        };
        let msg = espresso_message_from_txns(vec![vec![0xaa, 0xbb], vec![0xcc]], &jst, &l2_header());
        assert!(is_espresso_msg(&msg));
        let (txns, parsed) = parse_espresso_msg(&msg).unwrap();
        assert_eq!(txns, vec![vec![0xaa, 0xbb], vec![0xcc]]);
        assert_eq!(parsed, jst);
    }

    #[test]
    fn non_espresso_payload_is_rejected() {
        let mut msg = espresso_message_from_txns(vec![vec![1]], &EspressoJustification::default(), &l2_header());
        msg.l2msg[0] = 0;
        assert!(!is_espresso_msg(&msg));
        assert!(parse_espresso_msg(&msg).is_err());
    }

    #[test]
    fn justification_backfill_changes_bytes_only_in_expected_field() {
        let header = l2_header();
        let without = espresso_message_from_txns(vec![vec![7]], &EspressoJustification::default(), &header);
        let (txns, mut jst) = parse_espresso_msg(&without).unwrap();
        jst.block_merkle = Some(vec![0xde, 0xad]);
        let with = espresso_message_from_txns(txns, &jst, &header);
        assert_ne!(without.l2msg, with.l2msg);
        let (_, parsed) = parse_espresso_msg(&with).unwrap();
        assert_eq!(parsed.block_merkle.as_deref(), Some(&[0xde, 0xad][..]));
    }
}
