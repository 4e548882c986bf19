#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use alloy_primitives::{Address, B256, U256};
use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

use rollup_db_sled::SledDb;
use rollup_primitives::espresso::{espresso_message_from_txns, EspressoJustification};
use rollup_primitives::l1::{
    L1IncomingMessage, L1IncomingMessageHeader, L1_MESSAGE_TYPE_INITIALIZE,
    L1_MESSAGE_TYPE_L2_MESSAGE,
};
use rollup_primitives::message::{
    MessageResult, MessageWithMetadata, MessageWithMetadataAndBlockHash,
};
use rollup_streamer::config::{fixed_config, StreamerConfig};
use rollup_streamer::engine::ExecEngine;
use rollup_streamer::espresso::{
    EspressoClient, EspressoTransaction, TransactionQueryData, TransactionsInBlock,
};
use rollup_streamer::streamer::TransactionStreamer;
use rollup_streamer::traits::{BroadcastServer, SeqCoordinator};

pub const TEST_BLOCK_HASH: [u8; 32] = [0x11; 32];

#[derive(Clone, Debug)]
pub struct ReorgCall {
    pub new_count: u64,
    pub new_messages: Vec<MessageWithMetadata>,
    pub old_messages: Vec<MessageWithMetadata>,
}

#[derive(Default)]
pub struct TestEngine {
    pub head: Mutex<u64>,
    pub digested: Mutex<Vec<u64>>,
    pub reorg_calls: Mutex<Vec<ReorgCall>>,
}

#[async_trait]
impl ExecEngine for TestEngine {
    async fn head_message_index(&self) -> Result<u64> {
        Ok(*self.head.lock().unwrap())
    }

    async fn digest_message(
        &self,
        msg_idx: u64,
        _msg: &MessageWithMetadata,
        _msg_for_prefetch: Option<&MessageWithMetadata>,
    ) -> Result<MessageResult> {
        *self.head.lock().unwrap() = msg_idx;
        self.digested.lock().unwrap().push(msg_idx);
        Ok(MessageResult { block_hash: B256::from(TEST_BLOCK_HASH), send_root: B256::ZERO })
    }

    async fn reorg(
        &self,
        new_count: u64,
        new_messages: &[MessageWithMetadataAndBlockHash],
        old_messages: &[MessageWithMetadata],
    ) -> Result<Vec<MessageResult>> {
        self.reorg_calls.lock().unwrap().push(ReorgCall {
            new_count,
            new_messages: new_messages.iter().map(|m| m.message_with_meta.clone()).collect(),
            old_messages: old_messages.to_vec(),
        });
        *self.head.lock().unwrap() = new_count + new_messages.len() as u64 - 1;
        Ok(new_messages
            .iter()
            .map(|_| MessageResult { block_hash: B256::from(TEST_BLOCK_HASH), send_root: B256::ZERO })
            .collect())
    }

    async fn result_at_message_index(&self, _msg_idx: u64) -> Result<MessageResult> {
        Ok(MessageResult { block_hash: B256::from(TEST_BLOCK_HASH), send_root: B256::ZERO })
    }

    async fn mark_feed_start(&self, _to: u64) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingBroadcast {
    pub calls: Mutex<Vec<(u64, usize)>>,
}

impl BroadcastServer for RecordingBroadcast {
    fn broadcast_messages(
        &self,
        msgs: &[MessageWithMetadataAndBlockHash],
        pos: u64,
    ) -> Result<()> {
        self.calls.lock().unwrap().push((pos, msgs.len()));
        Ok(())
    }
}

pub struct TestCoordinator {
    pub chosen: AtomicBool,
    pub veto: AtomicBool,
    pub sequenced: Mutex<Vec<u64>>,
}

impl TestCoordinator {
    pub fn new(chosen: bool) -> Self {
        Self {
            chosen: AtomicBool::new(chosen),
            veto: AtomicBool::new(false),
            sequenced: Mutex::new(Vec::new()),
        }
    }
}

impl SeqCoordinator for TestCoordinator {
    fn currently_chosen(&self) -> bool {
        self.chosen.load(Ordering::Relaxed)
    }

    fn sequencing_message(&self, pos: u64, _msg: &MessageWithMetadata) -> Result<()> {
        if self.veto.load(Ordering::Relaxed) {
            anyhow::bail!("coordinator rejected message at {pos}");
        }
        self.sequenced.lock().unwrap().push(pos);
        Ok(())
    }
}

#[derive(Default)]
pub struct MockEspressoClient {
    pub submitted: Mutex<Vec<EspressoTransaction>>,
    pub finalized_height: Mutex<Option<u64>>,
    pub header: Vec<u8>,
    pub proof: Vec<u8>,
    pub vid_common: Vec<u8>,
}

impl MockEspressoClient {
    pub fn new() -> Self {
        Self {
            submitted: Mutex::new(Vec::new()),
            finalized_height: Mutex::new(None),
            header: b"header".to_vec(),
            proof: b"proof".to_vec(),
            vid_common: b"vid".to_vec(),
        }
    }
}

#[async_trait]
impl EspressoClient for MockEspressoClient {
    async fn submit_transaction(&self, txn: EspressoTransaction) -> Result<String> {
        let mut submitted = self.submitted.lock().unwrap();
        submitted.push(txn);
        Ok(format!("TX~{}", submitted.len()))
    }

    async fn fetch_transaction_by_hash(&self, _hash: &str) -> Result<TransactionQueryData> {
        match *self.finalized_height.lock().unwrap() {
            Some(block_height) => Ok(TransactionQueryData { block_height }),
            None => anyhow::bail!("transaction not yet included"),
        }
    }

    async fn fetch_header_by_height(&self, _height: u64) -> Result<Vec<u8>> {
        Ok(self.header.clone())
    }

    async fn fetch_transactions_in_block(
        &self,
        _height: u64,
        _namespace: u64,
    ) -> Result<TransactionsInBlock> {
        Ok(TransactionsInBlock { proof: self.proof.clone(), vid_common: self.vid_common.clone() })
    }
}

pub struct TestSetup {
    pub streamer: Arc<TransactionStreamer<SledDb>>,
    pub engine: Arc<TestEngine>,
    pub broadcast: Arc<RecordingBroadcast>,
    pub fatal_rx: mpsc::Receiver<anyhow::Error>,
    _dir: tempfile::TempDir,
}

pub fn setup(config: StreamerConfig) -> TestSetup {
    setup_with(config, None, None)
}

pub fn setup_with(
    config: StreamerConfig,
    espresso_client: Option<Arc<dyn EspressoClient>>,
    coordinator: Option<Arc<dyn SeqCoordinator>>,
) -> TestSetup {
    let dir = tempfile::tempdir().unwrap();
    let db = Arc::new(SledDb::open(dir.path().to_str().unwrap()).unwrap());
    let engine = Arc::new(TestEngine::default());
    let broadcast = Arc::new(RecordingBroadcast::default());
    let (fatal_tx, fatal_rx) = mpsc::channel(8);
    let streamer = Arc::new(
        TransactionStreamer::new(
            db,
            engine.clone(),
            Some(broadcast.clone()),
            espresso_client,
            fatal_tx,
            fixed_config(config),
            None,
        )
        .unwrap(),
    );
    if let Some(coordinator) = coordinator {
        streamer.set_seq_coordinator(coordinator);
    }
    TestSetup { streamer, engine, broadcast, fatal_rx, _dir: dir }
}

fn header(kind: u8, request_id: Option<B256>) -> L1IncomingMessageHeader {
    L1IncomingMessageHeader {
        kind,
        poster: Address::ZERO,
        block_number: 0,
        timestamp: 0,
        request_id,
        l1_base_fee: U256::ZERO,
    }
}

fn request_id(seq: u64) -> B256 {
    B256::from(U256::from(seq).to_be_bytes::<32>())
}

/// `Mk` from the scenarios: a delayed message with `DelayedMessagesRead =
/// delayed_read` whose requestId points at delayed message
/// `delayed_read - 1`.
pub fn delayed_msg(delayed_read: u64, body: &[u8]) -> MessageWithMetadata {
    MessageWithMetadata {
        message: L1IncomingMessage {
            header: header(L1_MESSAGE_TYPE_L2_MESSAGE, Some(request_id(delayed_read - 1))),
            l2msg: body.to_vec(),
            batch_gas_cost: None,
        },
        delayed_messages_read: delayed_read,
    }
}

/// A non-delayed L2 message.
pub fn plain_msg(delayed_read: u64, body: &[u8]) -> MessageWithMetadata {
    MessageWithMetadata {
        message: L1IncomingMessage {
            header: header(L1_MESSAGE_TYPE_L2_MESSAGE, None),
            l2msg: body.to_vec(),
            batch_gas_cost: None,
        },
        delayed_messages_read: delayed_read,
    }
}

pub fn init_msg() -> MessageWithMetadata {
    MessageWithMetadata {
        message: L1IncomingMessage {
            header: header(L1_MESSAGE_TYPE_INITIALIZE, Some(request_id(0))),
            l2msg: b"init".to_vec(),
            batch_gas_cost: None,
        },
        delayed_messages_read: 1,
    }
}

pub fn espresso_msg(
    payload: &[u8],
    delayed_read: u64,
    jst: &EspressoJustification,
) -> MessageWithMetadata {
    MessageWithMetadata {
        message: espresso_message_from_txns(
            vec![payload.to_vec()],
            jst,
            &header(L1_MESSAGE_TYPE_L2_MESSAGE, None),
        ),
        delayed_messages_read: delayed_read,
    }
}
