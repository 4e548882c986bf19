/// Error kinds callers need to tell apart. Embedded in `anyhow::Error`
/// and recovered by downcast.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StreamerError {
    /// This node is not the chosen sequencer right now; the caller should
    /// retry against the current one.
    #[error("retry sequencer: not the chosen sequencer")]
    RetrySequencer,
    /// The insertion lock was held; the sequencer path never blocks on it.
    #[error("insertion lock already held")]
    SequencerInsertLockTaken,
    #[error("wrong position {got}, expected {expected}")]
    WrongSequencerPosition { got: u64, expected: u64 },
    #[error("invalid feed sequence number {got}, expected {expected}")]
    FeedSequenceGap { got: u64, expected: u64 },
    #[error(
        "attempted to insert jump from {prev} delayed messages read to {next} at message index {pos}"
    )]
    DelayedMessagesReadJump { prev: u64, next: u64, pos: u64 },
    #[error("cannot reorg out the init message")]
    ReorgOutInitMessage,
}
