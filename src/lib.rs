//! Replica-side core of a Practical Byzantine Fault Tolerant protocol.
//!
//! A node accepts client requests, drives them through the three-phase
//! agreement (pre-prepare, prepare, commit) with its peer replicas, and
//! replies once a quorum has committed. The consensus state machine and the
//! single-writer dispatch loop live in [`state`] and [`node`]; HTTP ingress
//! and egress are thin adapters in [`server`] and [`transport`].

pub mod config;
pub mod digest;
pub mod error;
pub mod message;
pub mod node;
pub mod server;
pub mod state;
pub mod transport;

pub use config::{Config, View};
pub use error::ConsensusError;
pub use message::{
    CommitMsg, PrePrepareMsg, PrepareMsg, ProtocolMessage, ReplyMsg, RequestMsg,
};
pub use node::{Batch, MessageBuffer, Node, NodeHandle};
pub use state::{ConsensusState, Stage, NO_SEQUENCE, REPLY_RESULT};
pub use transport::{HttpTransport, Transport};
