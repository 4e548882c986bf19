//! The ordered, persistent ingestion engine between a node's message
//! sources (confirmed L1 inbox, broadcast feed, local sequencer) and its
//! execution engine. Maintains a single gap-free message log in the
//! database, reconciles divergences between sources, and drives the
//! execution engine forward one message at a time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use alloy_primitives::{Address, B256, U256};
use alloy_rlp::Decodable;
use anyhow::{anyhow, Context, Result};
use tokio::sync::{mpsc, Mutex, Notify, RwLock, RwLockReadGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use rollup_db::util::{delete_from_range, delete_starting_at};
use rollup_db::{is_not_found, Batch, Database};
use rollup_primitives::dbkeys::{
    db_key, uint64_to_key, BLOCK_HASH_INPUT_FEED_PREFIX, MESSAGE_COUNT_KEY, MESSAGE_PREFIX,
};
use rollup_primitives::espresso::{
    espresso_message_from_txns, is_espresso_msg, parse_espresso_msg,
};
use rollup_primitives::l1::{
    L1IncomingMessage, L1IncomingMessageHeader, L1_MESSAGE_TYPE_INITIALIZE,
};
use rollup_primitives::message::{
    BlockHashDbValue, BroadcastFeedMessage, MessageResult, MessageWithMetadata,
    MessageWithMetadataAndBlockHash,
};

use crate::config::{SnapSyncConfig, StreamerConfigFetcher};
use crate::engine::ExecEngine;
use crate::error::StreamerError;
use crate::espresso::EspressoClient;
use crate::metrics::StreamerMetrics;
use crate::traits::{BlockValidator, BroadcastServer, InboxReaderApi, SeqCoordinator};

pub const BLOCK_HASH_MISMATCH_LOG_MSG: &str =
    "BlockHash from feed doesn't match locally computed hash. Check feed source.";

const FEED_REORG_LOG_INTERVAL: Duration = Duration::from_secs(60);

/// A batch that is created on demand; `None` until something needs it.
pub(crate) type BatchSlot = Option<Box<dyn Batch>>;

fn end_batch(batch: BatchSlot) -> Result<()> {
    match batch {
        Some(b) => b.write(),
        None => Ok(()),
    }
}

/// Contiguous run of unconfirmed broadcast messages buffered ahead of the
/// confirmed tip. Guarded by the insertion lock; the run's start position
/// is additionally published through `queued_feed_pos` for the lock-free
/// fast path.
struct FeedCache {
    queued: Vec<MessageWithMetadataAndBlockHash>,
    active_reorg: bool,
    next_allowed_feed_reorg_log: Instant,
}

pub struct TransactionStreamer<D: Database> {
    db: Arc<D>,
    exec: Arc<dyn ExecEngine>,
    broadcast_server: Option<Arc<dyn BroadcastServer>>,
    validator: OnceLock<Arc<dyn BlockValidator>>,
    coordinator: OnceLock<Arc<dyn SeqCoordinator>>,
    inbox_reader: OnceLock<Arc<dyn InboxReaderApi>>,
    pub(crate) espresso_client: Option<Arc<dyn EspressoClient>>,

    pub(crate) config: StreamerConfigFetcher,
    snap_sync: Option<SnapSyncConfig>,
    fatal_err_tx: mpsc::Sender<anyhow::Error>,

    // Lock order: insertion outside reorg_lock. Never acquire the
    // insertion lock while holding reorg_lock exclusively.
    insertion: Mutex<FeedCache>,
    reorg_lock: RwLock<()>,
    pub(crate) espresso_state_lock: Mutex<()>,

    queued_feed_pos: AtomicU64,
    exec_last_msg_count: AtomicU64,

    new_message_notifier: Notify,
    pub(crate) new_sovereign_txn_notifier: Notify,

    metrics: StreamerMetrics,
}

impl<D: Database> TransactionStreamer<D> {
    pub fn new(
        db: Arc<D>,
        exec: Arc<dyn ExecEngine>,
        broadcast_server: Option<Arc<dyn BroadcastServer>>,
        espresso_client: Option<Arc<dyn EspressoClient>>,
        fatal_err_tx: mpsc::Sender<anyhow::Error>,
        config: StreamerConfigFetcher,
        snap_sync: Option<SnapSyncConfig>,
    ) -> Result<Self> {
        if (config)().sovereign_sequencer_enabled && espresso_client.is_none() {
            return Err(anyhow!("sovereign sequencer enabled without an espresso client"));
        }
        let streamer = Self {
            db,
            exec,
            broadcast_server,
            validator: OnceLock::new(),
            coordinator: OnceLock::new(),
            inbox_reader: OnceLock::new(),
            espresso_client,
            config,
            snap_sync,
            fatal_err_tx,
            insertion: Mutex::new(FeedCache {
                queued: Vec::new(),
                active_reorg: false,
                next_allowed_feed_reorg_log: Instant::now(),
            }),
            reorg_lock: RwLock::new(()),
            espresso_state_lock: Mutex::new(()),
            queued_feed_pos: AtomicU64::new(0),
            exec_last_msg_count: AtomicU64::new(0),
            new_message_notifier: Notify::new(),
            new_sovereign_txn_notifier: Notify::new(),
            metrics: StreamerMetrics::default(),
        };
        streamer.cleanup_inconsistent_state()?;
        streamer.metrics.message_count.set(streamer.get_message_count()? as f64);
        Ok(streamer)
    }

    pub fn set_block_validator(&self, validator: Arc<dyn BlockValidator>) {
        if self.validator.set(validator).is_err() {
            panic!("trying to set block validator when already set");
        }
    }

    pub fn set_seq_coordinator(&self, coordinator: Arc<dyn SeqCoordinator>) {
        if self.coordinator.set(coordinator).is_err() {
            panic!("trying to set coordinator when already set");
        }
    }

    pub fn set_inbox_reader(&self, inbox_reader: Arc<dyn InboxReaderApi>) {
        if self.inbox_reader.set(inbox_reader).is_err() {
            panic!("trying to set inbox reader when already set");
        }
    }

    pub(crate) fn db(&self) -> &D {
        &self.db
    }

    /// Initializes the message count on first boot and prunes trailing
    /// log entries a crashed run may have left at or after `count`.
    fn cleanup_inconsistent_state(&self) -> Result<()> {
        if !self.db.has(MESSAGE_COUNT_KEY)? {
            let mut batch = self.db.new_batch();
            self.set_message_count(batch.as_mut(), 0)?;
            return batch.write();
        }
        let count = self.get_message_count()?;
        for prefix in [MESSAGE_PREFIX, BLOCK_HASH_INPUT_FEED_PREFIX] {
            let pruned = delete_from_range(self.db.as_ref(), prefix, count, u64::MAX)?;
            if !pruned.is_empty() {
                warn!(count, ?pruned, "pruned trailing message-log entries");
            }
        }
        Ok(())
    }

    pub fn get_message_count(&self) -> Result<u64> {
        let data = self.db.get(MESSAGE_COUNT_KEY)?;
        let mut bytes = data.as_slice();
        Ok(u64::decode(&mut bytes)?)
    }

    pub async fn get_processed_message_count(&self) -> Result<u64> {
        let msg_count = self.get_message_count()?;
        let digested_head = self.exec.head_message_index().await?;
        Ok(msg_count.min(digested_head + 1))
    }

    pub fn get_message(&self, msg_idx: u64) -> Result<MessageWithMetadata> {
        let data = self.db.get(&db_key(MESSAGE_PREFIX, msg_idx))?;
        let mut bytes = data.as_slice();
        Ok(MessageWithMetadata::decode(&mut bytes)?)
    }

    /// The block hash is read separately and may be absent: entries written
    /// before hashes were recorded only have the message.
    pub fn get_message_with_block_hash(
        &self,
        msg_idx: u64,
    ) -> Result<MessageWithMetadataAndBlockHash> {
        let message_with_meta = self.get_message(msg_idx)?;
        let block_hash = match self.db.get(&db_key(BLOCK_HASH_INPUT_FEED_PREFIX, msg_idx)) {
            Ok(data) => {
                let mut bytes = data.as_slice();
                BlockHashDbValue::decode(&mut bytes)?.block_hash
            }
            Err(err) if is_not_found(&err) => None,
            Err(err) => return Err(err),
        };
        Ok(MessageWithMetadataAndBlockHash { message_with_meta, block_hash })
    }

    fn set_message_count(&self, batch: &mut dyn Batch, count: u64) -> Result<()> {
        batch.put(MESSAGE_COUNT_KEY, &alloy_rlp::encode(count))?;
        self.metrics.message_count.set(count as f64);
        Ok(())
    }

    pub(crate) fn write_message(
        &self,
        pos: u64,
        msg: &MessageWithMetadataAndBlockHash,
        batch: &mut dyn Batch,
    ) -> Result<()> {
        batch.put(
            &db_key(MESSAGE_PREFIX, pos),
            &alloy_rlp::encode(&msg.message_with_meta),
        )?;
        let block_hash = BlockHashDbValue { block_hash: msg.block_hash };
        batch.put(
            &db_key(BLOCK_HASH_INPUT_FEED_PREFIX, pos),
            &alloy_rlp::encode(&block_hash),
        )?;
        Ok(())
    }

    /// The insertion lock must be held and `pos` must be the current
    /// message count (or the count a reorg in this operation produced).
    /// Commits the batch and wakes the execution pump.
    fn write_messages(
        &self,
        pos: u64,
        messages: &[MessageWithMetadataAndBlockHash],
        batch: BatchSlot,
    ) -> Result<()> {
        let mut batch = batch.unwrap_or_else(|| self.db.new_batch());
        for (i, msg) in messages.iter().enumerate() {
            self.write_message(pos + i as u64, msg, batch.as_mut())?;
        }
        self.set_message_count(batch.as_mut(), pos + messages.len() as u64)?;
        batch.write()?;
        self.new_message_notifier.notify_one();
        Ok(())
    }

    fn broadcast_messages(&self, msgs: &[MessageWithMetadataAndBlockHash], pos: u64) {
        let Some(server) = &self.broadcast_server else { return };
        if let Err(err) = server.broadcast_messages(msgs, pos) {
            error!(pos, %err, "failed broadcasting messages");
        }
    }

    fn get_prev_prev_delayed_read(&self, pos: u64) -> Result<u64> {
        if let Some(snap) = &self.snap_sync {
            if snap.enabled && pos == snap.prev_batch_message_count {
                return Ok(snap.prev_delayed_read);
            }
        }
        if pos == 0 {
            return Ok(0);
        }
        let prev = self
            .get_message(pos - 1)
            .with_context(|| format!("failed to get previous message for pos {pos}"))?;
        Ok(prev.delayed_messages_read)
    }

    /// Walks stored messages from `pos` against `messages`, counting the
    /// byte-identical (or compatibly upgradable) prefix. Returns how many
    /// are duplicates, whether the first difference is a divergence, and
    /// the parsed stored message at that point. The two compatible
    /// upgrades — batch-gas-cost back-fill and block-merkle-justification
    /// back-fill — are the only in-place mutations ever staged, and only
    /// into `write_back`. Never takes locks.
    fn count_duplicate_messages(
        &self,
        mut pos: u64,
        messages: &[MessageWithMetadataAndBlockHash],
        mut write_back: Option<&mut BatchSlot>,
    ) -> Result<(usize, bool, Option<MessageWithMetadata>)> {
        let mut cur_msg = 0usize;
        while cur_msg < messages.len() {
            let key = db_key(MESSAGE_PREFIX, pos);
            if !self.db.has(&key)? {
                break;
            }
            let have_message = self.db.get(&key)?;
            let next_message = &messages[cur_msg];
            let want_message = alloy_rlp::encode(&next_message.message_with_meta);
            if have_message != want_message {
                let mut bytes = have_message.as_slice();
                let db_message = match MessageWithMetadata::decode(&mut bytes) {
                    Ok(m) => m,
                    Err(err) => {
                        warn!(pos, %err, "reorg detected: failed to parse message in database");
                        return Ok((cur_msg, true, None));
                    }
                };
                let mut duplicate = false;
                if db_message.message.batch_gas_cost.is_none()
                    || next_message.message_with_meta.message.batch_gas_cost.is_none()
                {
                    if db_message.equals_ignoring_caches(&next_message.message_with_meta) {
                        // Only the batch gas costs differed; not a reorg.
                        duplicate = true;
                        if next_message.message_with_meta.message.batch_gas_cost.is_some() {
                            if let Some(slot) = write_back.as_deref_mut() {
                                let batch = slot.get_or_insert_with(|| self.db.new_batch());
                                self.write_message(pos, next_message, batch.as_mut())?;
                            }
                        }
                    }
                }
                if !duplicate
                    && is_espresso_msg(&db_message.message)
                    && is_espresso_msg(&next_message.message_with_meta.message)
                    && self.is_justification_backfill(&db_message, &next_message.message_with_meta)?
                {
                    duplicate = true;
                    if let Some(slot) = write_back.as_deref_mut() {
                        info!(pos, "writing back-filled block merkle justification to database");
                        let batch = slot.get_or_insert_with(|| self.db.new_batch());
                        self.write_message(pos, next_message, batch.as_mut())?;
                    }
                }
                if !duplicate {
                    return Ok((cur_msg, true, Some(db_message)));
                }
            }
            cur_msg += 1;
            pos += 1;
        }
        Ok((cur_msg, false, None))
    }

    /// True when `incoming` is `stored` with a block-merkle justification
    /// added. Only the absent-to-present direction counts; everything else
    /// about the message must match.
    fn is_justification_backfill(
        &self,
        stored: &MessageWithMetadata,
        incoming: &MessageWithMetadata,
    ) -> Result<bool> {
        let (stored_txns, stored_jst) = parse_espresso_msg(&stored.message)?;
        let (_, incoming_jst) = parse_espresso_msg(&incoming.message)?;
        if stored_jst.block_merkle.is_some() || incoming_jst.block_merkle.is_none() {
            return Ok(false);
        }
        let upgraded = MessageWithMetadata {
            message: espresso_message_from_txns(
                stored_txns,
                &incoming_jst,
                &stored.message.header,
            ),
            delayed_messages_read: stored.delayed_messages_read,
        };
        Ok(upgraded.equals_ignoring_caches(incoming))
    }

    fn log_reorg(
        &self,
        cache: &mut FeedCache,
        pos: u64,
        db_msg: &MessageWithMetadata,
        new_msg: &MessageWithMetadata,
        confirmed: bool,
    ) {
        // Feed-sourced reorg warnings are rate limited; confirmed ones
        // always log.
        let now = Instant::now();
        if confirmed || now >= cache.next_allowed_feed_reorg_log {
            cache.next_allowed_feed_reorg_log = now + FEED_REORG_LOG_INTERVAL;
            warn!(
                confirmed,
                pos,
                got_delayed = new_msg.delayed_messages_read,
                got_header = ?new_msg.message.header,
                db_delayed = db_msg.delayed_messages_read,
                db_header = ?db_msg.message.header,
                "reorg detected",
            );
        }
    }

    /// Truncates the log to `count` messages and hands the displaced
    /// suffix to the execution engine for re-sequencing. The insertion
    /// lock must be held; this acquires the reorg lock exclusively for the
    /// window containing the engine call and the tail rewrite. Keys are
    /// staged into the caller's batch; the caller commits it.
    async fn reorg(
        &self,
        batch: &mut dyn Batch,
        count: u64,
        new_messages: &[MessageWithMetadataAndBlockHash],
    ) -> Result<()> {
        if count == 0 {
            return Err(StreamerError::ReorgOutInitMessage.into());
        }
        let mut last_delayed_seq_num = self.get_prev_prev_delayed_read(count)?;

        let mut target_msg_count = self.get_message_count()?;
        let config = (self.config)();
        if config.max_reorg_resequence_depth >= 0 {
            let max_resequence_msg_count = count + config.max_reorg_resequence_depth as u64;
            if max_resequence_msg_count < target_msg_count {
                error!(
                    reorging_to_count = count,
                    removing_messages = target_msg_count - count,
                    max_reorg_resequence_depth = config.max_reorg_resequence_depth,
                    "unable to re-sequence all old messages because there are too many",
                );
                self.metrics
                    .reorg_resequence_dropped
                    .increment(target_msg_count - max_resequence_msg_count);
                target_msg_count = max_resequence_msg_count;
            }
        }

        let mut old_messages: Vec<MessageWithMetadata> = Vec::new();
        for i in count..target_msg_count {
            let old_message = match self.get_message(i) {
                Ok(m) => m,
                Err(err) => {
                    error!(position = i, %err, "unable to lookup old message for re-sequencing");
                    break;
                }
            };

            if old_message.message.header.request_id.is_some() {
                // A delayed message is resequenced only if the database,
                // the tracked accumulator, and the message re-read from L1
                // all agree.
                let delayed_seq_num = match old_message.message.header.seq_num() {
                    Ok(n) => n,
                    Err(err) => {
                        error!(position = i, %err, "displaced delayed message has invalid requestId");
                        continue;
                    }
                };
                if delayed_seq_num + 1 != old_message.delayed_messages_read {
                    error!(
                        position = i,
                        delayed_seq_num,
                        delayed_messages_read = old_message.delayed_messages_read,
                        "delayed message header requestId doesn't match database delayedMessagesRead",
                    );
                    continue;
                }
                if delayed_seq_num != last_delayed_seq_num {
                    // Wrong position for this delayed message.
                    continue;
                }
                if let Some(reader) = self.inbox_reader.get() {
                    let expected_acc = match reader.get_delayed_acc(delayed_seq_num) {
                        Ok(acc) => acc,
                        Err(err) => {
                            if !is_not_found(&err) {
                                error!(%err, "reorg-resequence: failed to read expected accumulator");
                            }
                            continue;
                        }
                    };
                    let block = old_message.message.header.block_number;
                    let delayed_in_block = match reader.lookup_messages_in_range(block, block).await
                    {
                        Ok(msgs) => msgs,
                        Err(err) => {
                            error!(%err, "reorg-resequence: failed to re-read delayed messages from L1");
                            continue;
                        }
                    };
                    let mut message_found = false;
                    for found in &delayed_in_block {
                        if found.message.header.seq_num().ok() != Some(delayed_seq_num) {
                            continue;
                        }
                        if expected_acc == found.after_inbox_acc
                            && found.message.equals_ignoring_batch_gas_cost(&old_message.message)
                        {
                            message_found = true;
                        }
                        break;
                    }
                    if !message_found {
                        continue;
                    }
                }
                last_delayed_seq_num += 1;
            }

            old_messages.push(old_message);
        }

        let _reorg_guard = self.reorg_lock.write().await;

        let message_results = self.exec.reorg(count, new_messages, &old_messages).await?;

        let mut messages_with_computed_hash = Vec::with_capacity(message_results.len());
        for (new_message, result) in new_messages.iter().zip(&message_results) {
            messages_with_computed_hash.push(MessageWithMetadataAndBlockHash {
                message_with_meta: new_message.message_with_meta.clone(),
                block_hash: Some(result.block_hash),
            });
        }
        self.broadcast_messages(&messages_with_computed_hash, count);

        if let Some(validator) = self.validator.get() {
            validator.reorg(count).await?;
        }

        delete_starting_at(
            self.db.as_ref(),
            batch,
            BLOCK_HASH_INPUT_FEED_PREFIX,
            &uint64_to_key(count),
        )?;
        delete_starting_at(self.db.as_ref(), batch, MESSAGE_PREFIX, &uint64_to_key(count))?;
        self.set_message_count(batch, count)?;
        self.metrics.reorgs.increment(1);
        Ok(())
    }

    pub async fn reorg_to(&self, count: u64) -> Result<()> {
        self.reorg_to_and_end_batch(self.db.new_batch(), count).await
    }

    pub async fn reorg_to_and_end_batch(&self, mut batch: Box<dyn Batch>, count: u64) -> Result<()> {
        let _cache = self.insertion.lock().await;
        self.reorg(batch.as_mut(), count, &[]).await?;
        batch.write()
    }

    pub async fn add_messages(
        &self,
        pos: u64,
        messages_are_confirmed: bool,
        messages: Vec<MessageWithMetadata>,
    ) -> Result<()> {
        self.add_messages_and_end_batch(pos, messages_are_confirmed, messages, None).await
    }

    /// Writes the index-0 initialization message. Only for tests and
    /// local dev nodes.
    pub async fn add_fake_init_message(&self, chain_id: u64, chain_config: Vec<u8>) -> Result<()> {
        let mut l2msg = U256::from(chain_id).to_be_bytes::<32>().to_vec();
        l2msg.push(0);
        l2msg.extend_from_slice(&chain_config);
        let msg = MessageWithMetadata {
            message: L1IncomingMessage {
                header: L1IncomingMessageHeader {
                    kind: L1_MESSAGE_TYPE_INITIALIZE,
                    poster: Address::ZERO,
                    block_number: 0,
                    timestamp: 0,
                    request_id: Some(B256::ZERO),
                    l1_base_fee: U256::ZERO,
                },
                l2msg,
                batch_gas_cost: None,
            },
            delayed_messages_read: 1,
        };
        self.add_messages(0, false, vec![msg]).await
    }

    pub async fn add_messages_and_end_batch(
        &self,
        pos: u64,
        messages_are_confirmed: bool,
        messages: Vec<MessageWithMetadata>,
        batch: BatchSlot,
    ) -> Result<()> {
        let messages: Vec<MessageWithMetadataAndBlockHash> = messages
            .into_iter()
            .map(|message_with_meta| MessageWithMetadataAndBlockHash {
                message_with_meta,
                block_hash: None,
            })
            .collect();
        let mut batch = batch;

        if messages_are_confirmed {
            // Everything below the end of this run is confirmed; the
            // engine can drop pricing caches for it.
            if let Err(err) = self.exec.mark_feed_start(pos + messages.len() as u64).await {
                debug!(%err, "mark_feed_start failed");
            }
            let dups = {
                let _reorg_read = self.reorg_lock.read().await;
                self.count_duplicate_messages(pos, &messages, Some(&mut batch))?.0
            };
            if dups == messages.len() {
                return end_batch(batch);
            }
            // The reorg lock cannot be kept while acquiring the insertion
            // lock, so the remaining messages are re-evaluated under it.
        }

        let mut cache = self.insertion.lock().await;
        self.add_messages_and_end_batch_impl(&mut cache, pos, messages_are_confirmed, messages, batch)
            .await
    }

    /// Fast path reads only the atomic; the nonzero case re-checks under
    /// the insertion lock.
    pub async fn feed_pending_message_count(&self) -> u64 {
        if self.queued_feed_pos.load(Ordering::Acquire) == 0 {
            return 0;
        }
        let cache = self.insertion.lock().await;
        let pos = self.queued_feed_pos.load(Ordering::Acquire);
        if pos == 0 {
            return 0;
        }
        pos + cache.queued.len() as u64
    }

    /// Feed messages are unconfirmed and never reorg confirmed state: a
    /// divergent run is parked in the cache until L1 catches up.
    pub async fn add_broadcast_messages(
        &self,
        feed_messages: Vec<BroadcastFeedMessage>,
    ) -> Result<()> {
        if feed_messages.is_empty() {
            return Ok(());
        }
        let start_pos = feed_messages[0].sequence_number;
        let mut expected = start_pos;
        let mut messages = Vec::with_capacity(feed_messages.len());
        for feed_message in feed_messages {
            if feed_message.sequence_number != expected {
                return Err(StreamerError::FeedSequenceGap {
                    got: feed_message.sequence_number,
                    expected,
                }
                .into());
            }
            messages.push(MessageWithMetadataAndBlockHash {
                message_with_meta: feed_message.message,
                block_hash: feed_message.block_hash,
            });
            expected += 1;
        }

        let mut cache = self.insertion.lock().await;

        // Skip messages already in the database.
        let (dups, feed_reorg, old_msg) =
            self.count_duplicate_messages(start_pos, &messages, None)?;
        let mut broadcast_start_pos = start_pos + dups as u64;
        messages.drain(..dups);
        if let (Some(old), Some(first)) = (&old_msg, messages.first()) {
            self.log_reorg(&mut cache, broadcast_start_pos, old, &first.message_with_meta, false);
        }
        if messages.is_empty() {
            return Ok(());
        }

        if cache.queued.is_empty() || (feed_reorg && !cache.active_reorg) {
            // Empty cache, or the feed started disagreeing with the
            // database: hold the run until confirmed L1 messages catch up.
            cache.queued = messages;
            self.queued_feed_pos.store(broadcast_start_pos, Ordering::Release);
            cache.active_reorg = feed_reorg;
        } else {
            let queued_pos = self.queued_feed_pos.load(Ordering::Acquire);
            if queued_pos >= broadcast_start_pos {
                // The older run wins.
                cache.queued = messages;
                self.queued_feed_pos.store(broadcast_start_pos, Ordering::Release);
                cache.active_reorg = feed_reorg;
            } else if queued_pos + cache.queued.len() as u64 == broadcast_start_pos {
                // Contiguous append, bounded by the configured cap.
                let max_queue_size = (self.config)().max_broadcaster_queue_size;
                if max_queue_size == 0 || cache.queued.len() <= max_queue_size {
                    cache.queued.extend(messages);
                }
                broadcast_start_pos = queued_pos;
                // Existing reorg state is unchanged.
            } else {
                warn!(
                    queued_messages = cache.queued.len(),
                    expected_next_pos = queued_pos + cache.queued.len() as u64,
                    got_pos = broadcast_start_pos,
                    "broadcaster queue jumped positions",
                );
                cache.queued = messages;
                self.queued_feed_pos.store(broadcast_start_pos, Ordering::Release);
                cache.active_reorg = feed_reorg;
            }
        }

        if cache.active_reorg || cache.queued.is_empty() {
            return Ok(());
        }

        if broadcast_start_pos > 0 {
            match self.get_message(broadcast_start_pos - 1) {
                Ok(_) => {}
                // The predecessor isn't stored yet; don't append an
                // isolated run.
                Err(err) if is_not_found(&err) => return Ok(()),
                Err(err) => return Err(err),
            }
        }

        self.add_messages_and_end_batch_impl(&mut cache, broadcast_start_pos, false, Vec::new(), None)
            .await
            .context("error adding pending broadcaster messages")
    }

    async fn add_messages_and_end_batch_impl(
        &self,
        cache: &mut FeedCache,
        message_start_pos: u64,
        messages_are_confirmed: bool,
        messages: Vec<MessageWithMetadataAndBlockHash>,
        batch: BatchSlot,
    ) -> Result<()> {
        let mut messages = messages;
        let mut batch = batch;
        let mut message_start_pos = message_start_pos;
        let mut confirmed_reorg = false;
        let mut old_msg: Option<MessageWithMetadata> = None;
        let mut last_delayed_read = 0u64;
        let mut has_new_confirmed_messages = false;
        let mut cache_clear_len = 0usize;

        let messages_after_pos = message_start_pos + messages.len() as u64;
        let broadcast_start_pos = self.queued_feed_pos.load(Ordering::Acquire);

        if messages_are_confirmed {
            let (duplicates, reorg, old) =
                self.count_duplicate_messages(message_start_pos, &messages, Some(&mut batch))?;
            confirmed_reorg = reorg;
            old_msg = old;
            if duplicates > 0 {
                last_delayed_read =
                    messages[duplicates - 1].message_with_meta.delayed_messages_read;
                messages.drain(..duplicates);
                message_start_pos += duplicates as u64;
            }
            if !messages.is_empty() {
                has_new_confirmed_messages = true;
            }
        }

        let mut clear_queue_on_success = false;
        if (cache.active_reorg && message_start_pos <= broadcast_start_pos)
            || (!cache.active_reorg && broadcast_start_pos <= messages_after_pos)
        {
            // An active feed reorg with L1 messages reaching the cached
            // run, or no active reorg and a cached run starting at or
            // before the end of this one: splice usable cache entries onto
            // the run and retire what was consumed or replaced.
            if messages_after_pos >= broadcast_start_pos {
                let broadcast_slice_index = (messages_after_pos - broadcast_start_pos) as usize;
                let messages_old_len = messages.len();
                if broadcast_slice_index < cache.queued.len() {
                    messages.extend_from_slice(&cache.queued[broadcast_slice_index..]);
                }
                cache_clear_len = broadcast_slice_index + messages.len() - messages_old_len;
            }
            clear_queue_on_success = true;
        }

        let mut feed_reorg = false;
        if !has_new_confirmed_messages {
            let (duplicates, reorg, old) =
                self.count_duplicate_messages(message_start_pos, &messages, None)?;
            feed_reorg = reorg;
            old_msg = old;
            if duplicates > 0 {
                last_delayed_read =
                    messages[duplicates - 1].message_with_meta.delayed_messages_read;
                messages.drain(..duplicates);
                message_start_pos += duplicates as u64;
            }
        }
        if let (Some(old), Some(first)) = (&old_msg, messages.first()) {
            self.log_reorg(
                cache,
                message_start_pos,
                old,
                &first.message_with_meta,
                confirmed_reorg,
            );
        }

        if feed_reorg {
            // Never allow the feed to reorg confirmed state. Any remaining
            // messages are feed-sourced, so this operation is done.
            return end_batch(batch);
        }

        if last_delayed_read == 0 {
            last_delayed_read = self.get_prev_prev_delayed_read(message_start_pos)?;
        }

        for (i, msg) in messages.iter().enumerate() {
            let msg_pos = message_start_pos + i as u64;
            let next_delayed_read = msg.message_with_meta.delayed_messages_read;
            let diff = next_delayed_read.wrapping_sub(last_delayed_read);
            if diff != 0 && diff != 1 {
                return Err(StreamerError::DelayedMessagesReadJump {
                    prev: last_delayed_read,
                    next: next_delayed_read,
                    pos: msg_pos,
                }
                .into());
            }
            last_delayed_read = next_delayed_read;
        }

        if confirmed_reorg {
            // The reorg is a transactional tail rewrite: truncate and the
            // engine coordination commit in their own batch, ahead of the
            // append below.
            let mut reorg_batch = self.db.new_batch();
            self.reorg(reorg_batch.as_mut(), message_start_pos, &messages).await?;
            reorg_batch.write()?;
        }
        if messages.is_empty() {
            return end_batch(batch);
        }

        self.write_messages(message_start_pos, &messages, batch)?;

        if clear_queue_on_success {
            // Messages appended to the cache tail after the splice was
            // computed stay queued.
            if cache.queued.len() > cache_clear_len {
                cache.queued.drain(..cache_clear_len);
                self.queued_feed_pos
                    .store(broadcast_start_pos + cache_clear_len as u64, Ordering::Release);
            } else {
                cache.queued.clear();
                self.queued_feed_pos.store(0, Ordering::Release);
            }
            cache.active_reorg = false;
        }

        Ok(())
    }

    /// The caller must already hold the insertion lock.
    pub fn expect_chosen_sequencer(&self) -> Result<()> {
        if let Some(coordinator) = self.coordinator.get() {
            if !coordinator.currently_chosen() {
                return Err(StreamerError::RetrySequencer.into());
            }
        }
        Ok(())
    }

    /// Sequencer entry point. Never blocks: a held insertion lock fails
    /// with a distinct retryable error instead.
    pub async fn write_message_from_sequencer(
        &self,
        pos: u64,
        msg_with_meta: MessageWithMetadata,
        msg_result: MessageResult,
    ) -> Result<()> {
        self.expect_chosen_sequencer()?;
        let Ok(_cache) = self.insertion.try_lock() else {
            return Err(StreamerError::SequencerInsertLockTaken.into());
        };

        let msg_count = self.get_message_count()?;
        if msg_count != pos {
            return Err(StreamerError::WrongSequencerPosition { got: pos, expected: msg_count }.into());
        }

        if let Some(coordinator) = self.coordinator.get() {
            coordinator.sequencing_message(pos, &msg_with_meta)?;
        }

        let msg_with_block_hash = MessageWithMetadataAndBlockHash {
            message_with_meta: msg_with_meta,
            block_hash: Some(msg_result.block_hash),
        };
        self.write_messages(
            pos,
            std::slice::from_ref(&msg_with_block_hash),
            Some(self.db.new_batch()),
        )?;
        self.broadcast_messages(std::slice::from_ref(&msg_with_block_hash), pos);

        if is_espresso_msg(&msg_with_block_hash.message_with_meta.message) {
            let _espresso_guard = self.espresso_state_lock.lock().await;
            self.submit_espresso_transaction_pos(pos, self.db.new_batch())?;
            self.new_sovereign_txn_notifier.notify_one();
        }

        Ok(())
    }

    /// Holds off reorgs until the guard drops (may be called concurrently).
    pub async fn pause_reorgs(&self) -> RwLockReadGuard<'_, ()> {
        self.reorg_lock.read().await
    }

    pub fn populate_feed_backlog(&self) -> Result<()> {
        let Some(server) = &self.broadcast_server else { return Ok(()) };
        let Some(reader) = self.inbox_reader.get() else { return Ok(()) };
        reader.populate_feed_backlog(server.as_ref())
    }

    pub async fn result_at_message_count(&self, count: u64) -> Result<MessageResult> {
        if count == 0 {
            return Ok(MessageResult::default());
        }
        self.exec.result_at_message_index(count - 1).await
    }

    fn check_result(&self, msg_result: &MessageResult, expected_block_hash: Option<&B256>) {
        let Some(expected) = expected_block_hash else { return };
        if msg_result.block_hash != *expected {
            warn!(
                expected = %expected,
                actual = %msg_result.block_hash,
                "{}",
                BLOCK_HASH_MISMATCH_LOG_MSG,
            );
        }
    }

    pub(crate) fn report_fatal(&self, err: anyhow::Error) {
        if self.fatal_err_tx.try_send(err).is_err() {
            error!("fatal error channel full or closed");
        }
    }

    /// One execution-pump tick. Returns true when another message is
    /// already waiting, i.e. the caller should run again immediately.
    pub async fn execute_next_msg(&self) -> bool {
        // A reorg in progress owns the log tail; skip this tick.
        let Ok(_reorg_read) = self.reorg_lock.try_read() else {
            return false;
        };
        let prev_message_count = self.exec_last_msg_count.load(Ordering::Relaxed);
        let msg_count = match self.get_message_count() {
            Ok(count) => count,
            Err(err) => {
                error!(%err, "execute_next_msg failed to get message count");
                return false;
            }
        };
        self.exec_last_msg_count.store(msg_count, Ordering::Relaxed);
        let head = match self.exec.head_message_index().await {
            Ok(head) => head,
            Err(err) => {
                error!(%err, "execute_next_msg failed to get execution engine head");
                return false;
            }
        };
        let pos = head + 1;
        if pos >= msg_count {
            return false;
        }
        let msg_and_block_hash = match self.get_message_with_block_hash(pos) {
            Ok(msg) => msg,
            Err(err) => {
                error!(pos, %err, "execute_next_msg failed to read message");
                return false;
            }
        };
        let msg_for_prefetch = if pos + 1 < msg_count {
            match self.get_message(pos + 1) {
                Ok(msg) => Some(msg),
                Err(err) => {
                    error!(pos = pos + 1, %err, "execute_next_msg failed to read message");
                    return false;
                }
            }
        } else {
            None
        };
        let started = Instant::now();
        let msg_result = match self
            .exec
            .digest_message(pos, &msg_and_block_hash.message_with_meta, msg_for_prefetch.as_ref())
            .await
        {
            Ok(result) => result,
            Err(err) => {
                // Stuck on the same message: downgrade to debug to avoid
                // log spam.
                if msg_count == prev_message_count {
                    debug!(pos, %err, "execute_next_msg failed to send message to execution engine");
                } else {
                    warn!(pos, %err, "execute_next_msg failed to send message to execution engine");
                }
                return false;
            }
        };
        self.metrics.digest_duration.record(started.elapsed().as_secs_f64());

        self.check_result(&msg_result, msg_and_block_hash.block_hash.as_ref());

        let msg_with_block_hash = MessageWithMetadataAndBlockHash {
            message_with_meta: msg_and_block_hash.message_with_meta,
            block_hash: Some(msg_result.block_hash),
        };
        self.broadcast_messages(std::slice::from_ref(&msg_with_block_hash), pos);
        pos + 1 < msg_count
    }
}

impl<D: Database + 'static> TransactionStreamer<D> {
    /// Spawns the cooperative loops: the execution pump, and the notarizer
    /// submission loop when the sovereign sequencer is enabled.
    pub fn start(self: &Arc<Self>, token: CancellationToken) {
        if (self.config)().sovereign_sequencer_enabled {
            tokio::spawn(self.clone().run_espresso_submission_loop(token.clone()));
        }
        tokio::spawn(self.clone().run_execute_messages_loop(token));
    }

    pub async fn run_execute_messages_loop(self: Arc<Self>, token: CancellationToken) {
        loop {
            if token.is_cancelled() {
                return;
            }
            if self.execute_next_msg().await {
                continue;
            }
            let delay = (self.config)().execute_message_loop_delay;
            tokio::select! {
                _ = token.cancelled() => return,
                _ = self.new_message_notifier.notified() => {}
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
