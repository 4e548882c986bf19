use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct StreamerConfig {
    /// Maximum cache of pending broadcaster messages (0 = unbounded).
    pub max_broadcaster_queue_size: usize,
    /// Maximum number of messages to attempt to resequence on reorg
    /// (0 = never resequence, -1 = always resequence).
    pub max_reorg_resequence_depth: i64,
    /// Delay when polling calls to execute messages.
    pub execute_message_loop_delay: Duration,
    /// If true, transactions are sent to the espresso sovereign sequencer
    /// to be notarized.
    pub sovereign_sequencer_enabled: bool,
    /// Url of the hotshot sequencer.
    pub hotshot_url: String,
    /// Espresso namespace that corresponds to the L2 chain.
    pub espresso_namespace: u64,
    /// Interval between polling for submitted transaction finality.
    pub espresso_txns_polling_interval: Duration,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            max_broadcaster_queue_size: 50_000,
            max_reorg_resequence_depth: 1024,
            execute_message_loop_delay: Duration::from_millis(100),
            sovereign_sequencer_enabled: false,
            hotshot_url: String::new(),
            espresso_namespace: 0,
            espresso_txns_polling_interval: Duration::from_millis(100),
        }
    }
}

/// Config for tests: tiny pump delay, smaller feed cache, deep
/// resequencing.
pub fn test_config() -> StreamerConfig {
    StreamerConfig {
        max_broadcaster_queue_size: 10_000,
        max_reorg_resequence_depth: 128 * 1024,
        execute_message_loop_delay: Duration::from_millis(1),
        sovereign_sequencer_enabled: false,
        hotshot_url: String::new(),
        espresso_namespace: 0,
        espresso_txns_polling_interval: Duration::from_millis(100),
    }
}

pub type StreamerConfigFetcher = Arc<dyn Fn() -> StreamerConfig + Send + Sync>;

pub fn fixed_config(config: StreamerConfig) -> StreamerConfigFetcher {
    Arc::new(move || config.clone())
}

/// Snap-sync bootstrap override: at boot with `pos ==
/// prev_batch_message_count` the previous delayed-read count comes from
/// here instead of the (absent) predecessor message.
#[derive(Clone, Debug, Default)]
pub struct SnapSyncConfig {
    pub enabled: bool,
    pub prev_batch_message_count: u64,
    pub prev_delayed_read: u64,
}
