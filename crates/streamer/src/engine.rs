use anyhow::Result;
use async_trait::async_trait;
use rollup_primitives::message::{
    MessageResult, MessageWithMetadata, MessageWithMetadataAndBlockHash,
};

/// The execution engine consumed by the streamer. It is the consistency
/// root across itself, the message log, and the validator.
#[async_trait]
pub trait ExecEngine: Send + Sync {
    async fn head_message_index(&self) -> Result<u64>;
    async fn digest_message(
        &self,
        msg_idx: u64,
        msg: &MessageWithMetadata,
        msg_for_prefetch: Option<&MessageWithMetadata>,
    ) -> Result<MessageResult>;
    /// Rewinds the engine to `new_count` messages and re-sequences what it
    /// can of `old_messages`. The returned results align with
    /// `new_messages`.
    async fn reorg(
        &self,
        new_count: u64,
        new_messages: &[MessageWithMetadataAndBlockHash],
        old_messages: &[MessageWithMetadata],
    ) -> Result<Vec<MessageResult>>;
    async fn result_at_message_index(&self, msg_idx: u64) -> Result<MessageResult>;
    /// Hint that everything below `to` is confirmed; lets the engine drop
    /// pricing caches for that region.
    async fn mark_feed_start(&self, to: u64) -> Result<()>;
}
