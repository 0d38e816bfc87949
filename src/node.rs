//! The replica node: dispatcher, message buffer, and resolver.
//!
//! Two long-lived tasks cooperate over bounded channels. The dispatcher owns
//! the buffer and decides, per message kind, whether the current phase
//! admits the message or it must wait; an alarm interval re-runs that
//! decision so nothing is stuck behind a slow phase transition. The resolver
//! consumes admitted batches one at a time and is the only task that mutates
//! the round state, so phase admission stays race-free.

use std::collections::HashMap;
use std::sync::Arc;

use metrics::counter;
use serde::Serialize;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::Config;
use crate::digest::digest;
use crate::error::ConsensusError;
use crate::message::{CommitMsg, PrePrepareMsg, PrepareMsg, ProtocolMessage, ReplyMsg, RequestMsg};
use crate::state::{ConsensusState, Stage, NO_SEQUENCE};
use crate::transport::Transport;

/// Per-kind holding area for messages that arrived before the node was
/// ready for them. FIFO per kind; draining a kind clears it. Replies have
/// no lane: they are terminal and dropped at the gate.
#[derive(Debug, Default)]
pub struct MessageBuffer {
    requests: Vec<RequestMsg>,
    pre_prepares: Vec<PrePrepareMsg>,
    prepares: Vec<PrepareMsg>,
    commits: Vec<CommitMsg>,
}

impl MessageBuffer {
    fn drain_requests(&mut self, tail: RequestMsg) -> Vec<RequestMsg> {
        let mut batch = std::mem::take(&mut self.requests);
        batch.push(tail);
        batch
    }

    fn drain_pre_prepares(&mut self, tail: PrePrepareMsg) -> Vec<PrePrepareMsg> {
        let mut batch = std::mem::take(&mut self.pre_prepares);
        batch.push(tail);
        batch
    }

    fn drain_prepares(&mut self, tail: PrepareMsg) -> Vec<PrepareMsg> {
        let mut batch = std::mem::take(&mut self.prepares);
        batch.push(tail);
        batch
    }

    fn drain_commits(&mut self, tail: CommitMsg) -> Vec<CommitMsg> {
        let mut batch = std::mem::take(&mut self.commits);
        batch.push(tail);
        batch
    }

    pub fn len(&self) -> usize {
        self.requests.len()
            + self.pre_prepares.len()
            + self.prepares.len()
            + self.commits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One admitted batch, handed from the dispatcher to the resolver. Batches
/// are homogeneous: the dispatcher flushes one kind at a time.
#[derive(Debug)]
pub enum Batch {
    Requests(Vec<RequestMsg>),
    PrePrepares(Vec<PrePrepareMsg>),
    Prepares(Vec<PrepareMsg>),
    Commits(Vec<CommitMsg>),
}

/// State shared between the dispatcher (stage reads only) and the resolver
/// (sole writer). The committed history is appended by the resolver after a
/// commit quorum and read when seeding the next round.
#[derive(Default)]
struct Shared {
    state: RwLock<Option<ConsensusState>>,
    committed_log: RwLock<Vec<CommitMsg>>,
}

/// Handle to a spawned node: the entrance channel and the task handles.
pub struct NodeHandle {
    entrance: mpsc::Sender<ProtocolMessage>,
    dispatcher: JoinHandle<()>,
    resolver: JoinHandle<()>,
}

impl NodeHandle {
    pub fn entrance(&self) -> mpsc::Sender<ProtocolMessage> {
        self.entrance.clone()
    }

    pub fn abort(&self) {
        self.dispatcher.abort();
        self.resolver.abort();
    }
}

pub struct Node;

impl Node {
    /// Spawn the dispatcher and resolver tasks for one replica and return
    /// the handle feeding its entrance channel.
    pub fn spawn(config: Arc<Config>, transport: Arc<dyn Transport>) -> NodeHandle {
        let (entrance_tx, entrance_rx) = mpsc::channel(config.channel_capacity);
        let (delivery_tx, delivery_rx) = mpsc::channel(config.channel_capacity);
        let shared = Arc::new(Shared::default());

        let dispatcher = tokio::spawn(run_dispatcher(
            config.clone(),
            shared.clone(),
            entrance_rx,
            delivery_tx,
        ));
        let resolver = tokio::spawn(run_resolver(config, shared, transport, delivery_rx));

        NodeHandle {
            entrance: entrance_tx,
            dispatcher,
            resolver,
        }
    }
}

/// Stage of the live round, if any. The dispatcher tolerates a stale value
/// here: worst case a message waits one alarm tick.
async fn current_stage(shared: &Shared) -> Option<Stage> {
    shared.state.read().await.as_ref().map(|s| s.stage())
}

/// The routing gate. Sole owner of the buffer; processes one event at a
/// time from either the entrance channel or the alarm interval.
async fn run_dispatcher(
    config: Arc<Config>,
    shared: Arc<Shared>,
    mut entrance: mpsc::Receiver<ProtocolMessage>,
    delivery: mpsc::Sender<Batch>,
) {
    let mut buffer = MessageBuffer::default();
    let mut alarm = tokio::time::interval(config.alarm_interval);
    // Pulses are best-effort and must not queue up behind a busy loop.
    alarm.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            maybe = entrance.recv() => {
                let Some(msg) = maybe else {
                    tracing::info!("entrance closed, dispatcher stopping");
                    break;
                };
                msg.log_arrival();
                counter!("pbft.messages_received").increment(1);
                route(&shared, &mut buffer, &delivery, msg).await;
            }
            _ = alarm.tick() => {
                route_on_alarm(&shared, &mut buffer, &delivery).await;
            }
        }
    }
}

/// Admit-or-buffer, per message kind: a kind is admitted only when the
/// current phase is the one it legally advances from.
async fn route(
    shared: &Shared,
    buffer: &mut MessageBuffer,
    delivery: &mpsc::Sender<Batch>,
    msg: ProtocolMessage,
) {
    let stage = current_stage(shared).await;

    match msg {
        ProtocolMessage::Request(m) => {
            if stage.is_none() {
                deliver(delivery, Batch::Requests(buffer.drain_requests(m))).await;
            } else {
                buffer.requests.push(m);
                counter!("pbft.messages_buffered").increment(1);
            }
        }
        ProtocolMessage::PrePrepare(m) => {
            if stage.is_none() {
                deliver(delivery, Batch::PrePrepares(buffer.drain_pre_prepares(m))).await;
            } else {
                buffer.pre_prepares.push(m);
                counter!("pbft.messages_buffered").increment(1);
            }
        }
        ProtocolMessage::Prepare(m) => {
            if stage == Some(Stage::PrePrepared) {
                deliver(delivery, Batch::Prepares(buffer.drain_prepares(m))).await;
            } else {
                buffer.prepares.push(m);
                counter!("pbft.messages_buffered").increment(1);
            }
        }
        ProtocolMessage::Commit(m) => {
            if stage == Some(Stage::Prepared) {
                deliver(delivery, Batch::Commits(buffer.drain_commits(m))).await;
            } else {
                buffer.commits.push(m);
                counter!("pbft.messages_buffered").increment(1);
            }
        }
        // Replies are accepted at the boundary but the replica does not
        // process them further.
        ProtocolMessage::Reply(m) => {
            tracing::debug!(node_id = %m.node_id, "reply received, dropping");
        }
    }
}

/// Alarm pulse: flush whatever the current phase licenses, so no message is
/// stuck forever behind a slow transition.
async fn route_on_alarm(shared: &Shared, buffer: &mut MessageBuffer, delivery: &mpsc::Sender<Batch>) {
    match current_stage(shared).await {
        None => {
            if !buffer.requests.is_empty() {
                let batch = std::mem::take(&mut buffer.requests);
                deliver(delivery, Batch::Requests(batch)).await;
            }
            if !buffer.pre_prepares.is_empty() {
                let batch = std::mem::take(&mut buffer.pre_prepares);
                deliver(delivery, Batch::PrePrepares(batch)).await;
            }
        }
        Some(Stage::PrePrepared) => {
            if !buffer.prepares.is_empty() {
                let batch = std::mem::take(&mut buffer.prepares);
                deliver(delivery, Batch::Prepares(batch)).await;
            }
        }
        Some(Stage::Prepared) => {
            if !buffer.commits.is_empty() {
                let batch = std::mem::take(&mut buffer.commits);
                deliver(delivery, Batch::Commits(batch)).await;
            }
        }
        Some(Stage::Idle) | Some(Stage::Committed) => {}
    }
}

async fn deliver(delivery: &mpsc::Sender<Batch>, batch: Batch) {
    counter!("pbft.batches_delivered").increment(1);
    if delivery.send(batch).await.is_err() {
        tracing::warn!("delivery channel closed, dropping batch");
    }
}

/// The phase advancer. Consumes one batch at a time; per-message errors are
/// collected and reported, never fatal to the batch.
async fn run_resolver(
    config: Arc<Config>,
    shared: Arc<Shared>,
    transport: Arc<dyn Transport>,
    mut delivery: mpsc::Receiver<Batch>,
) {
    while let Some(batch) = delivery.recv().await {
        let errors = match batch {
            Batch::Requests(msgs) => {
                let mut errors = Vec::new();
                for msg in msgs {
                    if let Err(err) = handle_request(&config, &shared, transport.as_ref(), msg).await {
                        errors.push(err);
                    }
                }
                errors
            }
            Batch::PrePrepares(msgs) => {
                let mut errors = Vec::new();
                for msg in msgs {
                    if let Err(err) =
                        handle_pre_prepare(&config, &shared, transport.as_ref(), msg).await
                    {
                        errors.push(err);
                    }
                }
                errors
            }
            Batch::Prepares(msgs) => {
                let mut errors = Vec::new();
                for msg in msgs {
                    if let Err(err) = handle_prepare(&config, &shared, transport.as_ref(), msg).await {
                        errors.push(err);
                    }
                }
                errors
            }
            Batch::Commits(msgs) => {
                let mut errors = Vec::new();
                for msg in msgs {
                    if let Err(err) = handle_commit(&config, &shared, transport.as_ref(), msg).await {
                        errors.push(err);
                    }
                }
                errors
            }
        };

        for err in &errors {
            match err {
                ConsensusError::UnknownClient => {
                    tracing::error!(%err, "protocol invariant violated");
                }
                _ => tracing::warn!(%err, "message rejected"),
            }
            counter!("pbft.messages_rejected").increment(1);
        }
    }
}

/// Last committed sequence observed so far, `-1` when nothing committed.
async fn last_committed_sequence(shared: &Shared) -> i64 {
    shared
        .committed_log
        .read()
        .await
        .last()
        .map_or(NO_SEQUENCE, |m| m.sequence_id)
}

/// Request accepted: start a round as its leader and broadcast pre-prepare.
async fn handle_request(
    config: &Config,
    shared: &Shared,
    transport: &dyn Transport,
    msg: RequestMsg,
) -> Result<(), ConsensusError> {
    let mut guard = shared.state.write().await;
    if guard.is_some() {
        return Err(ConsensusError::ConsensusInProgress);
    }

    let last_seq = last_committed_sequence(shared).await;
    let mut state = ConsensusState::new(config.view.view_id, last_seq, config.quorum());
    let pre_prepare = state.start_consensus(msg, &config.node_id)?;
    *guard = Some(state);
    drop(guard);

    tracing::info!(sequence_id = pre_prepare.sequence_id, "consensus round started");
    counter!("pbft.rounds_started").increment(1);

    report_failures(broadcast(config, transport, "/preprepare", &pre_prepare).await?);
    Ok(())
}

/// Pre-prepare accepted: start a round as a follower and broadcast prepare.
async fn handle_pre_prepare(
    config: &Config,
    shared: &Shared,
    transport: &dyn Transport,
    msg: PrePrepareMsg,
) -> Result<(), ConsensusError> {
    // Digest check precedes any vote recording: a mismatch means the payload
    // was corrupted or forged somewhere along the way.
    let expected = digest(&msg.request_msg)?;
    if expected != msg.digest {
        return Err(ConsensusError::DigestMismatch {
            expected,
            got: msg.digest,
        });
    }

    let mut guard = shared.state.write().await;
    if guard.is_some() {
        return Err(ConsensusError::ConsensusInProgress);
    }

    let last_seq = last_committed_sequence(shared).await;
    let mut state = ConsensusState::new(config.view.view_id, last_seq, config.quorum());
    let prepare = state.pre_prepared(msg, &config.node_id)?;
    *guard = Some(state);
    drop(guard);

    report_failures(broadcast(config, transport, "/prepare", &prepare).await?);
    Ok(())
}

/// Prepare vote: record it and broadcast commit once the quorum is reached.
async fn handle_prepare(
    config: &Config,
    shared: &Shared,
    transport: &dyn Transport,
    msg: PrepareMsg,
) -> Result<(), ConsensusError> {
    let mut guard = shared.state.write().await;
    let Some(state) = guard.as_mut() else {
        // The round completed between admission and resolution; the stale
        // admission is tolerated and the vote is simply dropped.
        tracing::debug!(sequence_id = msg.sequence_id, "no live round, dropping prepare");
        return Ok(());
    };

    check_digest(state, &msg.digest)?;

    let Some(commit_vote) = state.prepared(msg, &config.node_id)? else {
        return Ok(());
    };
    drop(guard);

    tracing::info!(sequence_id = commit_vote.sequence_id, "prepare quorum reached");
    counter!("pbft.prepare_quorums").increment(1);

    report_failures(broadcast(config, transport, "/commit", &commit_vote).await?);
    Ok(())
}

/// Commit vote: record it and, on quorum, finish the round and reply to the
/// leader endpoint.
async fn handle_commit(
    config: &Config,
    shared: &Shared,
    transport: &dyn Transport,
    msg: CommitMsg,
) -> Result<(), ConsensusError> {
    let mut guard = shared.state.write().await;
    let Some(state) = guard.as_mut() else {
        tracing::debug!(sequence_id = msg.sequence_id, "no live round, dropping commit");
        return Ok(());
    };

    check_digest(state, &msg.digest)?;

    let Some((reply, request)) = state.committed(msg.clone(), &config.node_id)? else {
        return Ok(());
    };

    // Round is terminal: record the committed sequence and free the slot
    // for the next round before going back to the network.
    shared.committed_log.write().await.push(msg);
    *guard = None;
    drop(guard);

    tracing::info!(
        client_id = %request.client_id,
        sequence_id = request.sequence_id,
        "commit quorum reached, round complete"
    );
    counter!("pbft.rounds_committed").increment(1);

    send_reply(config, transport, &reply).await;
    Ok(())
}

/// Compare a vote's digest against the locally recomputed digest of the
/// request on file. Mismatched votes are never recorded.
fn check_digest(state: &ConsensusState, got: &str) -> Result<(), ConsensusError> {
    match state.request_digest() {
        Some(expected) if expected != got => Err(ConsensusError::DigestMismatch {
            expected: expected.to_string(),
            got: got.to_string(),
        }),
        _ => Ok(()),
    }
}

/// Deliver one message to every peer except self. Per-peer failures are
/// collected, not propagated: a quorum protocol survives dropped messages
/// from a minority of replicas.
async fn broadcast<T: Serialize>(
    config: &Config,
    transport: &dyn Transport,
    path: &str,
    msg: &T,
) -> Result<HashMap<String, anyhow::Error>, ConsensusError> {
    let body = serde_json::to_value(msg)?;

    let sends = config
        .peers
        .iter()
        .filter(|(node_id, _)| **node_id != config.node_id)
        .map(|(node_id, addr)| {
            let body = body.clone();
            async move { (node_id.clone(), transport.send(addr, path, body).await) }
        });

    let mut failures = HashMap::new();
    for (node_id, result) in futures::future::join_all(sends).await {
        if let Err(err) = result {
            failures.insert(node_id, err);
        }
    }

    counter!("pbft.broadcasts").increment(1);
    Ok(failures)
}

fn report_failures(failures: HashMap<String, anyhow::Error>) {
    for (peer, err) in failures {
        tracing::warn!(%peer, error = %err, "broadcast delivery failed");
        counter!("pbft.broadcast_failures").increment(1);
    }
}

/// Send the terminal reply to the configured view leader's endpoint.
async fn send_reply(config: &Config, transport: &dyn Transport, reply: &ReplyMsg) {
    let Some(addr) = config.leader_addr() else {
        tracing::warn!(leader = %config.view.leader, "view leader missing from peer table");
        return;
    };

    let body = match serde_json::to_value(reply) {
        Ok(body) => body,
        Err(err) => {
            tracing::warn!(error = %err, "reply could not be encoded");
            return;
        }
    };

    if let Err(err) = transport.send(addr, "/reply", body).await {
        tracing::warn!(error = %err, "reply delivery failed");
    } else {
        counter!("pbft.replies_sent").increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(n: i64) -> RequestMsg {
        RequestMsg {
            timestamp: n,
            client_id: format!("client-{n}"),
            operation: "op".into(),
            sequence_id: 0,
        }
    }

    #[test]
    fn buffer_drains_in_fifo_order_and_clears() {
        let mut buffer = MessageBuffer::default();
        buffer.requests.push(request(1));
        buffer.requests.push(request(2));

        let batch = buffer.drain_requests(request(3));
        assert_eq!(
            batch.iter().map(|m| m.timestamp).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert!(buffer.is_empty());
    }

    #[test]
    fn buffer_len_spans_all_kinds() {
        let mut buffer = MessageBuffer::default();
        assert!(buffer.is_empty());

        buffer.requests.push(request(1));
        buffer.prepares.push(PrepareMsg {
            view_id: 0,
            sequence_id: 1,
            digest: "d".into(),
            node_id: "node2".into(),
        });
        assert_eq!(buffer.len(), 2);
    }
}
