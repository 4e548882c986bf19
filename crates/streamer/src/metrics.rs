use metrics::{Counter, Gauge, Histogram};
use metrics_derive::Metrics;

/// Metrics for the transaction streamer.
#[derive(Metrics, Clone)]
#[metrics(scope = "transaction_streamer")]
pub(crate) struct StreamerMetrics {
    /// Number of messages in the canonical log.
    pub message_count: Gauge,
    /// Number of reorgs applied to the log.
    pub reorgs: Counter,
    /// Displaced messages dropped because they exceeded the resequence
    /// depth cap.
    pub reorg_resequence_dropped: Counter,
    /// Duration of a single execution-engine digest call.
    pub digest_duration: Histogram,
}
