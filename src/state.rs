//! Consensus state machine for one in-flight round.
//!
//! A `ConsensusState` is created lazily on the first message of a round and
//! owned by the node until the round commits or is abandoned. It tracks the
//! phase, the per-sender vote logs, and the quorum tests; the dispatcher and
//! transport live elsewhere.

use std::collections::HashMap;

use chrono::Utc;

use crate::digest::digest;
use crate::error::ConsensusError;
use crate::message::{CommitMsg, PrePrepareMsg, PrepareMsg, ReplyMsg, RequestMsg};

/// Fixed result string carried by the terminal reply.
pub const REPLY_RESULT: &str = "new block has been submitted";

/// Sentinel for "no sequence committed yet".
pub const NO_SEQUENCE: i64 = -1;

/// Phase of a round. Ordered and monotonic: a round only ever moves right.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Idle,
    PrePrepared,
    Prepared,
    Committed,
}

/// Per-round message logs. Vote maps are keyed by sender, so a later vote
/// from the same sender overwrites instead of double-counting.
#[derive(Debug, Default)]
pub struct MsgLogs {
    pub request: Option<RequestMsg>,
    pub pre_prepare_votes: HashMap<String, PrePrepareMsg>,
    pub prepare_votes: HashMap<String, PrepareMsg>,
    pub commit_votes: HashMap<String, CommitMsg>,
}

#[derive(Debug)]
pub struct ConsensusState {
    view_id: i64,
    last_sequence_id: i64,
    stage: Stage,
    quorum: usize,
    /// Digest of the request on file, recomputed locally when the request
    /// was stored. Callers compare incoming vote digests against this before
    /// recording the vote.
    request_digest: Option<String>,
    logs: MsgLogs,
}

impl ConsensusState {
    pub fn new(view_id: i64, last_sequence_id: i64, quorum: usize) -> Self {
        Self {
            view_id,
            last_sequence_id,
            stage: Stage::Idle,
            quorum,
            request_digest: None,
            logs: MsgLogs::default(),
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn view_id(&self) -> i64 {
        self.view_id
    }

    pub fn request_digest(&self) -> Option<&str> {
        self.request_digest.as_deref()
    }

    pub fn prepare_vote_count(&self) -> usize {
        self.logs.prepare_votes.len()
    }

    pub fn commit_vote_count(&self) -> usize {
        self.logs.commit_votes.len()
    }

    /// Begin a round for a request this node originated or relayed.
    ///
    /// The sequence number starts from wall-clock milliseconds and is bumped
    /// until it strictly exceeds the last committed sequence, so it stays
    /// monotonic under clock skew or back-to-back rounds in one tick.
    pub fn start_consensus(
        &mut self,
        mut request: RequestMsg,
        node_id: &str,
    ) -> Result<PrePrepareMsg, ConsensusError> {
        let mut sequence_id = Utc::now().timestamp_millis();
        while sequence_id <= self.last_sequence_id {
            sequence_id += 1;
        }
        request.sequence_id = sequence_id;

        let digest = digest(&request)?;

        self.logs.request = Some(request.clone());
        self.request_digest = Some(digest.clone());
        self.advance(Stage::PrePrepared);

        Ok(PrePrepareMsg {
            view_id: self.view_id,
            sequence_id,
            digest,
            node_id: node_id.to_string(),
            request_msg: request,
        })
    }

    /// Accept a leader's pre-prepare and echo a prepare vote.
    pub fn pre_prepared(
        &mut self,
        msg: PrePrepareMsg,
        node_id: &str,
    ) -> Result<PrepareMsg, ConsensusError> {
        self.verify(msg.view_id, msg.sequence_id)?;

        let prepare = PrepareMsg {
            view_id: self.view_id,
            sequence_id: msg.sequence_id,
            digest: msg.digest.clone(),
            node_id: node_id.to_string(),
        };

        self.logs.request = Some(msg.request_msg.clone());
        self.request_digest = Some(msg.digest.clone());
        self.logs.pre_prepare_votes.insert(msg.node_id.clone(), msg);
        self.advance(Stage::PrePrepared);

        Ok(prepare)
    }

    /// Record a prepare vote. Returns the commit vote to broadcast once the
    /// prepare quorum is reached, `None` below it.
    pub fn prepared(
        &mut self,
        msg: PrepareMsg,
        node_id: &str,
    ) -> Result<Option<CommitMsg>, ConsensusError> {
        self.verify(msg.view_id, msg.sequence_id)?;

        let sequence_id = msg.sequence_id;
        let digest = msg.digest.clone();
        self.logs.prepare_votes.insert(msg.node_id.clone(), msg);
        tracing::info!(votes = self.logs.prepare_votes.len(), "prepare vote recorded");

        if !self.is_prepared() {
            return Ok(None);
        }

        self.advance(Stage::Prepared);

        Ok(Some(CommitMsg {
            view_id: self.view_id,
            sequence_id,
            digest,
            node_id: node_id.to_string(),
        }))
    }

    /// Record a commit vote. On commit quorum, returns the reply for the
    /// client paired with the original request so the caller can validate
    /// the client linkage.
    pub fn committed(
        &mut self,
        msg: CommitMsg,
        node_id: &str,
    ) -> Result<Option<(ReplyMsg, RequestMsg)>, ConsensusError> {
        self.verify(msg.view_id, msg.sequence_id)?;

        self.logs.commit_votes.insert(msg.node_id.clone(), msg);
        tracing::info!(votes = self.logs.commit_votes.len(), "commit vote recorded");

        if !self.is_committed() {
            return Ok(None);
        }

        // A quorum without a stored request means the round never saw its
        // request, which correct operation rules out.
        let request = self.logs.request.clone().ok_or(ConsensusError::UnknownClient)?;

        self.advance(Stage::Committed);

        let reply = ReplyMsg {
            view_id: self.view_id,
            timestamp: Utc::now().timestamp_millis(),
            client_id: request.client_id.clone(),
            node_id: node_id.to_string(),
            result: REPLY_RESULT.to_string(),
        };

        Ok(Some((reply, request)))
    }

    /// True once `2f` distinct senders have sent matching prepares.
    pub fn is_prepared(&self) -> bool {
        self.logs.prepare_votes.len() >= self.quorum
    }

    /// True once `2f` distinct senders have sent matching commits.
    pub fn is_committed(&self) -> bool {
        self.logs.commit_votes.len() >= self.quorum
    }

    /// View and staleness guard shared by the three vote-recording
    /// transitions. Digest equality is the caller's job before recording.
    fn verify(&self, view_id: i64, sequence_id: i64) -> Result<(), ConsensusError> {
        if view_id != self.view_id {
            return Err(ConsensusError::InvalidView {
                expected: self.view_id,
                got: view_id,
            });
        }
        if sequence_id <= self.last_sequence_id {
            return Err(ConsensusError::StaleSequence {
                last: self.last_sequence_id,
                got: sequence_id,
            });
        }
        Ok(())
    }

    /// Move to `next` without ever regressing.
    fn advance(&mut self, next: Stage) {
        self.stage = self.stage.max(next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const QUORUM: usize = 2;

    fn request() -> RequestMsg {
        RequestMsg {
            timestamp: 1700000000000,
            client_id: "client-1".into(),
            operation: "put k v".into(),
            sequence_id: 0,
        }
    }

    fn pre_prepare(view_id: i64, sequence_id: i64) -> PrePrepareMsg {
        let mut req = request();
        req.sequence_id = sequence_id;
        let digest = digest(&req).unwrap();
        PrePrepareMsg {
            view_id,
            sequence_id,
            digest,
            node_id: "node2".into(),
            request_msg: req,
        }
    }

    fn prepare(view_id: i64, sequence_id: i64, digest: &str, sender: &str) -> PrepareMsg {
        PrepareMsg {
            view_id,
            sequence_id,
            digest: digest.into(),
            node_id: sender.into(),
        }
    }

    fn commit(view_id: i64, sequence_id: i64, digest: &str, sender: &str) -> CommitMsg {
        CommitMsg {
            view_id,
            sequence_id,
            digest: digest.into(),
            node_id: sender.into(),
        }
    }

    #[test]
    fn start_consensus_assigns_strictly_increasing_sequence() {
        // Force a last sequence far in the future so the wall-clock seed is
        // always behind it.
        let last = i64::MAX - 10;
        let mut state = ConsensusState::new(0, last, QUORUM);

        let pp = state.start_consensus(request(), "node1").unwrap();
        assert_eq!(pp.sequence_id, last + 1);
        assert_eq!(pp.request_msg.sequence_id, last + 1);
        assert_eq!(state.stage(), Stage::PrePrepared);
    }

    #[test]
    fn start_consensus_digest_covers_assigned_sequence() {
        let mut state = ConsensusState::new(0, NO_SEQUENCE, QUORUM);
        let pp = state.start_consensus(request(), "node1").unwrap();
        assert_eq!(pp.digest, digest(&pp.request_msg).unwrap());
        assert_eq!(state.request_digest(), Some(pp.digest.as_str()));
    }

    #[test]
    fn pre_prepared_echoes_view_sequence_digest() {
        let mut state = ConsensusState::new(0, NO_SEQUENCE, QUORUM);
        let pp = pre_prepare(0, 100);

        let prepare = state.pre_prepared(pp.clone(), "node3").unwrap();
        assert_eq!(prepare.view_id, 0);
        assert_eq!(prepare.sequence_id, 100);
        assert_eq!(prepare.digest, pp.digest);
        assert_eq!(prepare.node_id, "node3");
        assert_eq!(state.stage(), Stage::PrePrepared);
    }

    #[test]
    fn prepare_quorum_gates_commit() {
        let mut state = ConsensusState::new(0, NO_SEQUENCE, QUORUM);
        let pp = pre_prepare(0, 100);
        let d = pp.digest.clone();
        state.pre_prepared(pp, "node1").unwrap();

        let first = state
            .prepared(prepare(0, 100, &d, "node2"), "node1")
            .unwrap();
        assert!(first.is_none());
        assert_eq!(state.stage(), Stage::PrePrepared);

        let second = state
            .prepared(prepare(0, 100, &d, "node3"), "node1")
            .unwrap();
        let commit_msg = second.expect("second distinct vote reaches quorum");
        assert_eq!(commit_msg.sequence_id, 100);
        assert_eq!(commit_msg.node_id, "node1");
        assert_eq!(state.stage(), Stage::Prepared);
    }

    #[test]
    fn duplicate_sender_does_not_double_count() {
        let mut state = ConsensusState::new(0, NO_SEQUENCE, QUORUM);
        let pp = pre_prepare(0, 100);
        let d = pp.digest.clone();
        state.pre_prepared(pp, "node1").unwrap();

        for _ in 0..3 {
            let out = state
                .prepared(prepare(0, 100, &d, "node2"), "node1")
                .unwrap();
            assert!(out.is_none());
        }
        assert_eq!(state.prepare_vote_count(), 1);
    }

    #[test]
    fn commit_quorum_produces_reply_with_client_linkage() {
        let mut state = ConsensusState::new(0, NO_SEQUENCE, QUORUM);
        let pp = pre_prepare(0, 100);
        let d = pp.digest.clone();
        state.pre_prepared(pp, "node1").unwrap();
        state.prepared(prepare(0, 100, &d, "node2"), "node1").unwrap();
        state.prepared(prepare(0, 100, &d, "node3"), "node1").unwrap();

        assert!(state
            .committed(commit(0, 100, &d, "node2"), "node1")
            .unwrap()
            .is_none());

        let (reply, original) = state
            .committed(commit(0, 100, &d, "node3"), "node1")
            .unwrap()
            .expect("second commit vote reaches quorum");
        assert_eq!(reply.client_id, "client-1");
        assert_eq!(reply.result, REPLY_RESULT);
        assert_eq!(reply.node_id, "node1");
        assert_eq!(original.client_id, reply.client_id);
        assert_eq!(state.stage(), Stage::Committed);
    }

    #[test]
    fn commit_quorum_without_request_is_invariant_violation() {
        let mut state = ConsensusState::new(0, NO_SEQUENCE, QUORUM);

        assert!(state
            .committed(commit(0, 100, "d", "node2"), "node1")
            .unwrap()
            .is_none());
        let err = state
            .committed(commit(0, 100, "d", "node3"), "node1")
            .unwrap_err();
        assert!(matches!(err, ConsensusError::UnknownClient));
    }

    #[test]
    fn stale_sequence_is_rejected_and_not_recorded() {
        let mut state = ConsensusState::new(0, 500, QUORUM);

        let err = state
            .prepared(prepare(0, 500, "d", "node2"), "node1")
            .unwrap_err();
        assert!(matches!(err, ConsensusError::StaleSequence { last: 500, got: 500 }));
        assert_eq!(state.prepare_vote_count(), 0);
    }

    #[test]
    fn view_mismatch_is_rejected_and_not_recorded() {
        let mut state = ConsensusState::new(0, NO_SEQUENCE, QUORUM);

        let err = state
            .committed(commit(5, 100, "d", "node2"), "node1")
            .unwrap_err();
        assert!(matches!(err, ConsensusError::InvalidView { expected: 0, got: 5 }));
        assert_eq!(state.commit_vote_count(), 0);
    }

    #[test]
    fn stages_are_ordered_and_never_regress() {
        assert!(Stage::Idle < Stage::PrePrepared);
        assert!(Stage::PrePrepared < Stage::Prepared);
        assert!(Stage::Prepared < Stage::Committed);

        let mut state = ConsensusState::new(0, NO_SEQUENCE, QUORUM);
        let pp = pre_prepare(0, 100);
        let d = pp.digest.clone();
        state.pre_prepared(pp.clone(), "node1").unwrap();
        state.prepared(prepare(0, 100, &d, "node2"), "node1").unwrap();
        state.prepared(prepare(0, 100, &d, "node3"), "node1").unwrap();
        assert_eq!(state.stage(), Stage::Prepared);

        // A late pre-prepare must not pull the round backwards.
        state.pre_prepared(pp, "node1").unwrap();
        assert_eq!(state.stage(), Stage::Prepared);
    }
}
