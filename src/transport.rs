//! Egress boundary.
//!
//! The node only ever pushes JSON at peer addresses; the trait keeps that
//! seam narrow so tests can swap in an in-memory transport.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;

/// Request timeout so a dead peer cannot stall the resolver.
const SEND_TIMEOUT_SECS: u64 = 3;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver one JSON message to `http://{addr}{path}`.
    async fn send(&self, addr: &str, path: &str, body: serde_json::Value) -> Result<()>;
}

pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(SEND_TIMEOUT_SECS))
            .build()
            .context("failed to build the HTTP client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, addr: &str, path: &str, body: serde_json::Value) -> Result<()> {
        let url = format!("http://{addr}{path}");
        self.client
            .post(&url)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("delivery to {url} failed"))?
            .error_for_status()
            .with_context(|| format!("{url} rejected the message"))?;
        Ok(())
    }
}
