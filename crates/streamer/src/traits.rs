use alloy_primitives::B256;
use async_trait::async_trait;
use rollup_primitives::l1::L1IncomingMessage;
use rollup_primitives::message::{MessageWithMetadata, MessageWithMetadataAndBlockHash};

/// Downstream rebroadcast of authoritative results. Best effort; failures
/// are logged by the caller, never propagated.
pub trait BroadcastServer: Send + Sync {
    fn broadcast_messages(
        &self,
        msgs: &[MessageWithMetadataAndBlockHash],
        pos: u64,
    ) -> anyhow::Result<()>;
}

/// Sequencer-coordination lock service.
pub trait SeqCoordinator: Send + Sync {
    fn currently_chosen(&self) -> bool;
    fn sequencing_message(&self, pos: u64, msg: &MessageWithMetadata) -> anyhow::Result<()>;
}

#[async_trait]
pub trait BlockValidator: Send + Sync {
    async fn reorg(&self, new_count: u64) -> anyhow::Result<()>;
}

/// A delayed message re-read from L1, with the inbox accumulator after it.
#[derive(Clone, Debug)]
pub struct DelayedInboxMessage {
    pub after_inbox_acc: B256,
    pub message: L1IncomingMessage,
}

/// The L1 inbox reader and delayed-message bridge, used to re-validate
/// displaced delayed messages before resequencing them.
#[async_trait]
pub trait InboxReaderApi: Send + Sync {
    fn get_delayed_acc(&self, seq_num: u64) -> anyhow::Result<B256>;
    async fn lookup_messages_in_range(
        &self,
        block_lo: u64,
        block_hi: u64,
    ) -> anyhow::Result<Vec<DelayedInboxMessage>>;
    fn populate_feed_backlog(&self, broadcast: &dyn BroadcastServer) -> anyhow::Result<()>;
}
