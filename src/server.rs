//! Ingress boundary: one POST route per message kind.
//!
//! Handlers only decode and enqueue; all protocol decisions live behind the
//! entrance channel. A full channel answers 503 instead of blocking the
//! connection.

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::message::{CommitMsg, PrePrepareMsg, PrepareMsg, ProtocolMessage, ReplyMsg, RequestMsg};

#[derive(Clone)]
struct AppState {
    entrance: mpsc::Sender<ProtocolMessage>,
}

pub fn router(entrance: mpsc::Sender<ProtocolMessage>) -> Router {
    Router::new()
        .route("/req", post(post_request))
        .route("/preprepare", post(post_pre_prepare))
        .route("/prepare", post(post_prepare))
        .route("/commit", post(post_commit))
        .route("/reply", post(post_reply))
        .with_state(AppState { entrance })
}

async fn post_request(State(state): State<AppState>, Json(msg): Json<RequestMsg>) -> StatusCode {
    enqueue(&state, ProtocolMessage::Request(msg))
}

async fn post_pre_prepare(
    State(state): State<AppState>,
    Json(msg): Json<PrePrepareMsg>,
) -> StatusCode {
    enqueue(&state, ProtocolMessage::PrePrepare(msg))
}

async fn post_prepare(State(state): State<AppState>, Json(msg): Json<PrepareMsg>) -> StatusCode {
    enqueue(&state, ProtocolMessage::Prepare(msg))
}

async fn post_commit(State(state): State<AppState>, Json(msg): Json<CommitMsg>) -> StatusCode {
    enqueue(&state, ProtocolMessage::Commit(msg))
}

async fn post_reply(State(state): State<AppState>, Json(msg): Json<ReplyMsg>) -> StatusCode {
    enqueue(&state, ProtocolMessage::Reply(msg))
}

fn enqueue(state: &AppState, msg: ProtocolMessage) -> StatusCode {
    match state.entrance.try_send(msg) {
        Ok(()) => StatusCode::ACCEPTED,
        Err(TrySendError::Full(msg)) => {
            tracing::warn!(kind = msg.kind(), "entrance channel full, rejecting");
            StatusCode::SERVICE_UNAVAILABLE
        }
        Err(TrySendError::Closed(msg)) => {
            tracing::warn!(kind = msg.kind(), "entrance channel closed, rejecting");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

/// Bind the replica's listen address and serve until ctrl-c.
pub async fn serve(addr: &str, entrance: mpsc::Sender<ProtocolMessage>) -> Result<()> {
    let app = router(entrance);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(%addr, "replica listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn enqueue_reports_backpressure_when_full() {
        let (tx, _rx) = mpsc::channel(1);
        let state = AppState { entrance: tx };

        let msg = ProtocolMessage::Reply(ReplyMsg {
            view_id: 0,
            timestamp: 0,
            client_id: "c".into(),
            node_id: "node1".into(),
            result: "ok".into(),
        });

        assert_eq!(enqueue(&state, msg.clone()), StatusCode::ACCEPTED);
        assert_eq!(enqueue(&state, msg), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn enqueue_reports_closed_channel() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let state = AppState { entrance: tx };

        let msg = ProtocolMessage::Request(RequestMsg {
            timestamp: 0,
            client_id: "c".into(),
            operation: "op".into(),
            sequence_id: 0,
        });

        assert_eq!(enqueue(&state, msg), StatusCode::SERVICE_UNAVAILABLE);
    }
}
