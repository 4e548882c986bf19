//! Bridge to the Espresso notarizer: submits sequenced messages and
//! back-fills their finality proof into the log once notarized.
//!
//! State is three persisted scalars — the outstanding submission's
//! position and handle, and the queue of positions awaiting submission —
//! always batched together with any log rewrite so crash recovery finds a
//! consistent snapshot. At most one submission is outstanding at a time.

use std::time::Duration;

use alloy_rlp::{Decodable, Encodable, Header};
use anyhow::Result;
use async_trait::async_trait;
use tracing::{error, info, warn};

use rollup_db::{is_not_found, Batch, Database};
use rollup_primitives::dbkeys::{
    ESPRESSO_PENDING_TXNS_POSITIONS_KEY, ESPRESSO_SUBMITTED_HASH_KEY, ESPRESSO_SUBMITTED_POS_KEY,
};
use rollup_primitives::espresso::{message_from_espresso_sovereign_txn, parse_espresso_msg};
use tokio_util::sync::CancellationToken;

use crate::streamer::TransactionStreamer;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EspressoTransaction {
    pub payload: Vec<u8>,
    pub namespace: u64,
}

#[derive(Clone, Debug)]
pub struct TransactionQueryData {
    pub block_height: u64,
}

#[derive(Clone, Debug)]
pub struct TransactionsInBlock {
    pub proof: Vec<u8>,
    pub vid_common: Vec<u8>,
}

/// Client for the notarizer's submit and query APIs. The handle returned
/// by submission is an opaque string.
#[async_trait]
pub trait EspressoClient: Send + Sync {
    async fn submit_transaction(&self, txn: EspressoTransaction) -> Result<String>;
    async fn fetch_transaction_by_hash(&self, hash: &str) -> Result<TransactionQueryData>;
    async fn fetch_header_by_height(&self, height: u64) -> Result<Vec<u8>>;
    async fn fetch_transactions_in_block(
        &self,
        height: u64,
        namespace: u64,
    ) -> Result<TransactionsInBlock>;
}

fn encode_u64_list(values: &[u64]) -> Vec<u8> {
    let payload_len: usize = values.iter().map(|v| v.length()).sum();
    let mut out = Vec::with_capacity(payload_len + 9);
    Header { list: true, payload_length: payload_len }.encode(&mut out);
    for v in values {
        v.encode(&mut out);
    }
    out
}

fn decode_u64_list(mut bytes: &[u8]) -> alloy_rlp::Result<Vec<u64>> {
    let header = Header::decode(&mut bytes)?;
    if !header.list {
        return Err(alloy_rlp::Error::Custom("expected list of positions"));
    }
    let mut items = &bytes[..header.payload_length];
    let mut out = Vec::new();
    while !items.is_empty() {
        out.push(u64::decode(&mut items)?);
    }
    Ok(out)
}

impl<D: Database> TransactionStreamer<D> {
    pub fn get_espresso_submitted_pos(&self) -> Result<u64> {
        let data = self.db().get(ESPRESSO_SUBMITTED_POS_KEY)?;
        let mut bytes = data.as_slice();
        Ok(u64::decode(&mut bytes)?)
    }

    pub fn get_espresso_submitted_hash(&self) -> Result<String> {
        let data = self.db().get(ESPRESSO_SUBMITTED_HASH_KEY)?;
        let mut bytes = data.as_slice();
        Ok(String::decode(&mut bytes)?)
    }

    pub fn get_espresso_pending_txns_pos(&self) -> Result<Vec<u64>> {
        let data = self.db().get(ESPRESSO_PENDING_TXNS_POSITIONS_KEY)?;
        Ok(decode_u64_list(&data)?)
    }

    fn set_espresso_submitted_pos(&self, batch: &mut dyn Batch, pos: Option<u64>) -> Result<()> {
        match pos {
            Some(pos) => batch.put(ESPRESSO_SUBMITTED_POS_KEY, &alloy_rlp::encode(pos)),
            None => batch.delete(ESPRESSO_SUBMITTED_POS_KEY),
        }
    }

    fn set_espresso_submitted_hash(&self, batch: &mut dyn Batch, hash: Option<&str>) -> Result<()> {
        match hash {
            Some(hash) => batch.put(ESPRESSO_SUBMITTED_HASH_KEY, &alloy_rlp::encode(hash)),
            None => batch.delete(ESPRESSO_SUBMITTED_HASH_KEY),
        }
    }

    fn set_espresso_pending_txns_pos(&self, batch: &mut dyn Batch, pos: &[u64]) -> Result<()> {
        batch.put(ESPRESSO_PENDING_TXNS_POSITIONS_KEY, &encode_u64_list(pos))
    }

    /// Queues `pos` for submission. The espresso state lock must be held.
    pub(crate) fn submit_espresso_transaction_pos(
        &self,
        pos: u64,
        mut batch: Box<dyn Batch>,
    ) -> Result<()> {
        let mut pending = match self.get_espresso_pending_txns_pos() {
            Ok(pending) => pending,
            Err(err) if is_not_found(&err) => Vec::new(),
            Err(err) => {
                error!(%err, "failed to get the pending txns positions");
                return Err(err);
            }
        };
        pending.push(pos);
        self.set_espresso_pending_txns_pos(batch.as_mut(), &pending)?;
        batch.write()?;
        Ok(())
    }

    /// Checks whether the outstanding submission landed; if so, re-writes
    /// the message at its position with the notarizer's header, namespace
    /// proof, and VID common back-filled into the justification, and
    /// clears the submission scalars in the same batch. Returns zero when
    /// done, the polling interval while still waiting.
    pub async fn poll_submitted_transaction_for_finality(&self) -> Duration {
        let interval = (self.config)().espresso_txns_polling_interval;
        let Some(client) = self.espresso_client.clone() else {
            return interval;
        };
        let submitted_pos = match self.get_espresso_submitted_pos() {
            Ok(pos) => pos,
            Err(err) => {
                warn!(%err, "submitted pos not found");
                return interval;
            }
        };
        let submitted_hash = match self.get_espresso_submitted_hash() {
            Ok(hash) => hash,
            Err(err) => {
                warn!(%err, "submitted hash not found");
                return interval;
            }
        };
        let data = match client.fetch_transaction_by_hash(&submitted_hash).await {
            Ok(data) => data,
            Err(err) => {
                error!(%err, hash = %submitted_hash, "failed to fetch the submitted transaction");
                return interval;
            }
        };
        let mut msg = match self.get_message_with_block_hash(submitted_pos) {
            Ok(msg) => msg,
            Err(err) => {
                error!(%err, "failed to get espresso message at submitted txn pos");
                return interval;
            }
        };
        let (txns, mut jst) = match parse_espresso_msg(&msg.message_with_meta.message) {
            Ok(parsed) => parsed,
            Err(err) => {
                error!(%err, "failed to parse espresso message");
                return interval;
            }
        };
        let Some(payload) = txns.into_iter().next() else {
            error!(pos = submitted_pos, "submitted espresso message has no transactions");
            return interval;
        };
        let espresso_header = match client.fetch_header_by_height(data.block_height).await {
            Ok(header) => header,
            Err(err) => {
                error!(%err, "failed to fetch espresso header by height");
                return interval;
            }
        };
        let resp = match client
            .fetch_transactions_in_block(data.block_height, (self.config)().espresso_namespace)
            .await
        {
            Ok(resp) => resp,
            Err(err) => {
                warn!(%err, "failed to fetch the transactions in block, will retry");
                return interval;
            }
        };

        jst.header = Some(espresso_header);
        jst.proof = Some(resp.proof);
        jst.vid_common = Some(resp.vid_common);
        msg.message_with_meta.message = message_from_espresso_sovereign_txn(
            payload,
            &jst,
            &msg.message_with_meta.message.header,
        );

        let _guard = self.espresso_state_lock.lock().await;
        let mut batch = self.db().new_batch();
        if let Err(err) = self.write_message(submitted_pos, &msg, batch.as_mut()) {
            warn!(%err, "failed to stage the finalized espresso message");
            return interval;
        }
        if let Err(err) = self.set_espresso_submitted_pos(batch.as_mut(), None) {
            warn!(%err, "failed to clear the submitted pos");
            return interval;
        }
        if let Err(err) = self.set_espresso_submitted_hash(batch.as_mut(), None) {
            warn!(%err, "failed to clear the submitted hash");
            return interval;
        }
        if let Err(err) = batch.write() {
            error!(%err, "failed to write espresso finality batch to db");
            self.report_fatal(err);
            return interval;
        }
        Duration::ZERO
    }

    /// One tick of the submission loop: finish the outstanding submission
    /// first, then submit the head of the pending queue, moving it into
    /// the submitted scalars atomically.
    pub async fn submit_espresso_transactions_once(&self) -> Duration {
        let interval = (self.config)().espresso_txns_polling_interval;
        match self.get_espresso_submitted_pos() {
            Ok(_) => {
                if !self.poll_submitted_transaction_for_finality().await.is_zero() {
                    return interval;
                }
            }
            Err(err) if is_not_found(&err) => {}
            Err(err) => {
                warn!(%err, "error getting submitted pos");
                return interval;
            }
        }

        let pending = match self.get_espresso_pending_txns_pos() {
            Ok(pending) => pending,
            Err(err) => {
                if !is_not_found(&err) {
                    warn!(%err, "failed to get pending txns positions");
                }
                return interval;
            }
        };
        let Some(&head) = pending.first() else {
            return interval;
        };
        let Some(client) = self.espresso_client.clone() else {
            return interval;
        };

        let msg = match self.get_message(head) {
            Ok(msg) => msg,
            Err(err) => {
                error!(%err, "failed to get espresso message at pending txn pos");
                return interval;
            }
        };
        let (txns, _) = match parse_espresso_msg(&msg.message) {
            Ok(parsed) => parsed,
            Err(err) => {
                error!(%err, "failed to parse espresso message before submitting");
                return interval;
            }
        };
        let Some(payload) = txns.into_iter().next() else {
            error!(pos = head, "pending espresso message has no transactions");
            return interval;
        };

        info!(pos = head, "submitting transaction to espresso using sovereign sequencer");
        let hash = match client
            .submit_transaction(EspressoTransaction {
                payload,
                namespace: (self.config)().espresso_namespace,
            })
            .await
        {
            Ok(hash) => hash,
            Err(err) => {
                error!(%err, "failed to submit transaction to espresso");
                return interval;
            }
        };

        let _guard = self.espresso_state_lock.lock().await;
        let mut batch = self.db().new_batch();
        if let Err(err) = self.set_espresso_submitted_pos(batch.as_mut(), Some(head)) {
            error!(%err, "failed to set the submitted txn pos");
            return interval;
        }
        if let Err(err) = self.set_espresso_pending_txns_pos(batch.as_mut(), &pending[1..]) {
            error!(%err, "failed to set the pending txns");
            return interval;
        }
        if let Err(err) = self.set_espresso_submitted_hash(batch.as_mut(), Some(&hash)) {
            error!(%err, "failed to set the submitted hash");
            return interval;
        }
        if let Err(err) = batch.write() {
            error!(%err, "failed to write espresso submission batch to db");
            self.report_fatal(err);
            return interval;
        }

        interval
    }
}

impl<D: Database + 'static> TransactionStreamer<D> {
    pub async fn run_espresso_submission_loop(
        self: std::sync::Arc<Self>,
        token: CancellationToken,
    ) {
        loop {
            if token.is_cancelled() {
                return;
            }
            let delay = self.submit_espresso_transactions_once().await;
            tokio::select! {
                _ = token.cancelled() => return,
                _ = self.new_sovereign_txn_notifier.notified() => {}
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
