//! Coordinator-side RPC client
//!
//! Publishes a mount request to the owning node's subject with a private
//! reply inbox and a correlation-id header, then waits for the matching
//! reply. Late or foreign replies on the inbox are discarded by
//! correlation id, giving at-most-once response semantics.

use std::time::Duration;

use async_nats::HeaderMap;
use futures::StreamExt;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use dms_core::domain::{MountRequest, MountResponse};
use dms_core::ports::IMountTransport;

use crate::{redact_broker_url, subject_for_host, RpcError, CORRELATION_HEADER};

/// Broker client for mount/unmount calls.
///
/// One instance per coordinator process; the underlying connection is
/// cheap to clone and shared across calls. Each call creates its own
/// reply inbox, so concurrent calls never see each other's replies.
#[derive(Clone)]
pub struct RpcClient {
    nats: async_nats::Client,
    timeout: Duration,
}

impl RpcClient {
    /// Connect to the broker at `url`.
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self, RpcError> {
        let nats = async_nats::connect(url)
            .await
            .map_err(|e| RpcError::Connect(format!("{}: {e}", redact_broker_url(url))))?;

        debug!(broker = %redact_broker_url(url), "Connected to broker");
        Ok(Self { nats, timeout })
    }

    /// Wrap an existing connection (used by tests and the server).
    pub fn with_client(nats: async_nats::Client, timeout: Duration) -> Self {
        Self { nats, timeout }
    }

    /// Send `request` to the server owning `request.host` and await the
    /// correlated reply.
    pub async fn call(&self, request: &MountRequest) -> Result<MountResponse, RpcError> {
        let payload = serde_json::to_vec(request)
            .map_err(|e| RpcError::Malformed(format!("request encode: {e}")))?;

        let subject = subject_for_host(request.host.as_str());
        let inbox = self.nats.new_inbox();
        let correlation_id = Uuid::new_v4().to_string();

        let mut replies = self
            .nats
            .subscribe(inbox.clone())
            .await
            .map_err(|e| RpcError::Subscribe(e.to_string()))?;

        let mut headers = HeaderMap::new();
        headers.insert(CORRELATION_HEADER, correlation_id.as_str());

        self.nats
            .publish_with_reply_and_headers(subject.clone(), inbox, headers, payload.into())
            .await
            .map_err(|e| RpcError::Publish(e.to_string()))?;
        self.nats
            .flush()
            .await
            .map_err(|e| RpcError::Publish(e.to_string()))?;

        debug!(
            subject = %subject,
            correlation_id = %correlation_id,
            action = %request.action,
            job_id = %request.job.id,
            target_id = %request.backup_target.id,
            "Sent mount request"
        );

        let deadline = Instant::now() + self.timeout;
        let response = loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break Err(RpcError::Timeout(self.timeout.as_secs()));
            }

            let msg = match tokio::time::timeout(remaining, replies.next()).await {
                Ok(Some(msg)) => msg,
                Ok(None) => break Err(RpcError::ReplyChannelClosed),
                Err(_) => break Err(RpcError::Timeout(self.timeout.as_secs())),
            };

            if !correlation_matches(msg.headers.as_ref(), &correlation_id) {
                warn!(
                    subject = %subject,
                    correlation_id = %correlation_id,
                    "Discarding reply with foreign correlation id"
                );
                continue;
            }

            break serde_json::from_slice::<MountResponse>(&msg.payload)
                .map_err(|e| RpcError::Malformed(format!("reply decode: {e}")));
        };

        let _ = replies.unsubscribe().await;
        response
    }
}

/// Whether `headers` carry the expected correlation id.
fn correlation_matches(headers: Option<&HeaderMap>, expected: &str) -> bool {
    headers
        .and_then(|h| h.get(CORRELATION_HEADER))
        .map(|v| v.as_str() == expected)
        .unwrap_or(false)
}

#[async_trait::async_trait]
impl IMountTransport for RpcClient {
    async fn call(&self, request: &MountRequest) -> anyhow::Result<MountResponse> {
        Ok(RpcClient::call(self, request).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn correlation_requires_matching_header() {
        let id = "f2b0c7f4-5f3e-4a4e-9f63-2f3c7f9f0c11";

        let mut headers = HeaderMap::new();
        headers.insert(CORRELATION_HEADER, id);
        assert!(correlation_matches(Some(&headers), id));

        let mut other = HeaderMap::new();
        other.insert(CORRELATION_HEADER, "something-else");
        assert!(!correlation_matches(Some(&other), id));

        // Missing headers never match.
        assert!(!correlation_matches(None, id));
        let empty = HeaderMap::new();
        assert!(!correlation_matches(Some(&empty), id));
    }
}
