//! Protocol error kinds.
//!
//! Every failure here is local to one message: batches keep processing and
//! aggregate these for reporting. Nothing is fatal to the process.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConsensusError {
    /// The message could not be serialized for digesting or transport.
    #[error("message could not be encoded: {0}")]
    Encoding(#[from] serde_json::Error),

    /// A second round was started while one is still live.
    #[error("a consensus round is already in progress")]
    ConsensusInProgress,

    /// The message's view does not match the live round's view.
    #[error("view {got} does not match current view {expected}")]
    InvalidView { expected: i64, got: i64 },

    /// Replay/staleness guard: the sequence does not advance past the last
    /// committed sequence.
    #[error("sequence {got} does not advance past last committed sequence {last}")]
    StaleSequence { last: i64, got: i64 },

    /// The carried digest does not match the locally recomputed one. The
    /// message is treated as corrupted and its vote is never recorded.
    #[error("digest mismatch: expected {expected}, got {got}")]
    DigestMismatch { expected: String, got: String },

    /// A commit quorum was reached without a request on file. This cannot
    /// happen under correct operation and is surfaced as an invariant
    /// violation.
    #[error("commit quorum reached with no request on file for this round")]
    UnknownClient,
}
