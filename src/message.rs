//! Wire message catalog.
//!
//! Five message shapes cross the wire during one consensus round: a client
//! Request, the leader's PrePrepare, per-replica Prepare and Commit votes,
//! and the terminal Reply. Field names on the wire follow the deployed JSON
//! tags (`clientID`, `sequenceID`, `NodeId`, ...); fields whose tag differs
//! from the Rust name carry an explicit rename.

use serde::{Deserialize, Serialize};

/// Operation submitted by a client. The sequence number is assigned by the
/// replica that accepts the request, never by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMsg {
    pub timestamp: i64,
    #[serde(rename = "clientID")]
    pub client_id: String,
    pub operation: String,
    #[serde(rename = "sequenceID")]
    pub sequence_id: i64,
}

/// First phase message, carrying the full request payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrePrepareMsg {
    #[serde(rename = "viewID")]
    pub view_id: i64,
    #[serde(rename = "sequenceID")]
    pub sequence_id: i64,
    /// Content fingerprint of the request, not a signature.
    pub digest: String,
    #[serde(rename = "NodeId")]
    pub node_id: String,
    #[serde(rename = "requestMsg")]
    pub request_msg: RequestMsg,
}

/// Second phase vote, one per replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareMsg {
    #[serde(rename = "viewID")]
    pub view_id: i64,
    #[serde(rename = "sequenceID")]
    pub sequence_id: i64,
    pub digest: String,
    #[serde(rename = "NodeId")]
    pub node_id: String,
}

/// Third phase vote, one per replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitMsg {
    #[serde(rename = "viewID")]
    pub view_id: i64,
    #[serde(rename = "sequenceID")]
    pub sequence_id: i64,
    pub digest: String,
    #[serde(rename = "NodeId")]
    pub node_id: String,
}

/// Terminal artifact of a round, delivered to the client-facing endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyMsg {
    #[serde(rename = "viewID")]
    pub view_id: i64,
    pub timestamp: i64,
    #[serde(rename = "clientID")]
    pub client_id: String,
    #[serde(rename = "NodeId")]
    pub node_id: String,
    #[serde(rename = "Result")]
    pub result: String,
}

/// Closed union over the five message kinds. The entrance channel carries
/// this tag so the dispatcher can match exhaustively instead of downcasting.
#[derive(Debug, Clone)]
pub enum ProtocolMessage {
    Request(RequestMsg),
    PrePrepare(PrePrepareMsg),
    Prepare(PrepareMsg),
    Commit(CommitMsg),
    Reply(ReplyMsg),
}

impl ProtocolMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ProtocolMessage::Request(_) => "request",
            ProtocolMessage::PrePrepare(_) => "pre-prepare",
            ProtocolMessage::Prepare(_) => "prepare",
            ProtocolMessage::Commit(_) => "commit",
            ProtocolMessage::Reply(_) => "reply",
        }
    }

    /// Log the arrival of a message with its identifying fields.
    pub fn log_arrival(&self) {
        match self {
            ProtocolMessage::Request(m) => {
                tracing::info!(
                    client_id = %m.client_id,
                    timestamp = m.timestamp,
                    operation = %m.operation,
                    "[REQUEST]"
                );
            }
            ProtocolMessage::PrePrepare(m) => {
                tracing::info!(view_id = m.view_id, sequence_id = m.sequence_id, "[PREPREPARE]");
            }
            ProtocolMessage::Prepare(m) => {
                tracing::info!(node_id = %m.node_id, sequence_id = m.sequence_id, "[PREPARE]");
            }
            ProtocolMessage::Commit(m) => {
                tracing::info!(node_id = %m.node_id, sequence_id = m.sequence_id, "[COMMIT]");
            }
            ProtocolMessage::Reply(m) => {
                tracing::info!(node_id = %m.node_id, result = %m.result, "[REPLY]");
            }
        }
    }
}
