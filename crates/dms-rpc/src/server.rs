//! Per-node serving loop
//!
//! Subscribes to this node's inbound subject and hands each request to
//! the [`RpcHandler`]. Requests are processed strictly one at a time: a
//! slow mount delays the next request on this node rather than racing
//! it. Replies go to the request's reply inbox, echoing the
//! correlation-id header.

use async_nats::HeaderMap;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use dms_core::domain::{MountRequest, MountResponse};

use crate::{subject_for_host, RpcError, CORRELATION_HEADER};

/// Handler invoked for each inbound mount request.
///
/// Implementations must be infallible at this boundary: operational
/// failures are reported inside the [`MountResponse`], never as a missing
/// reply.
#[async_trait::async_trait]
pub trait RpcHandler: Send + Sync {
    async fn handle(&self, request: MountRequest) -> MountResponse;
}

/// Serving loop bound to one node id.
pub struct RpcServer {
    nats: async_nats::Client,
    node_id: String,
}

impl RpcServer {
    /// Connect to the broker and bind to `node_id`.
    pub async fn connect(url: &str, node_id: impl Into<String>) -> Result<Self, RpcError> {
        let nats = async_nats::connect(url)
            .await
            .map_err(|e| RpcError::Connect(format!("{}: {e}", crate::redact_broker_url(url))))?;
        Ok(Self {
            nats,
            node_id: node_id.into(),
        })
    }

    /// Wrap an existing connection.
    pub fn with_client(nats: async_nats::Client, node_id: impl Into<String>) -> Self {
        Self {
            nats,
            node_id: node_id.into(),
        }
    }

    /// The subject this server consumes.
    #[must_use]
    pub fn subject(&self) -> String {
        subject_for_host(&self.node_id)
    }

    /// Serve requests until `shutdown` fires or the subscription ends.
    ///
    /// Handler panics are not caught; everything else keeps the loop
    /// alive so one bad request cannot take the node offline.
    pub async fn run(
        &self,
        handler: &dyn RpcHandler,
        shutdown: CancellationToken,
    ) -> Result<(), RpcError> {
        let subject = self.subject();
        let mut requests = self
            .nats
            .subscribe(subject.clone())
            .await
            .map_err(|e| RpcError::Subscribe(e.to_string()))?;

        info!(subject = %subject, node_id = %self.node_id, "Serving mount requests");

        loop {
            let msg = tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!(subject = %subject, "Shutdown requested, draining subscription");
                    break;
                }

                msg = requests.next() => match msg {
                    Some(msg) => msg,
                    None => {
                        warn!(subject = %subject, "Inbound subscription ended");
                        return Err(RpcError::ReplyChannelClosed);
                    }
                },
            };

            let reply_to = msg.reply.clone();
            let correlation = msg
                .headers
                .as_ref()
                .and_then(|h| h.get(CORRELATION_HEADER))
                .map(|v| v.as_str().to_string());

            let response = match serde_json::from_slice::<MountRequest>(&msg.payload) {
                Ok(request) if request.host.as_str() != self.node_id => {
                    // Node-specific queue discipline: never execute a
                    // request addressed to another host.
                    let err = format!(
                        "Node mismatch: request for host '{}' received by node '{}'",
                        request.host, self.node_id
                    );
                    error!(subject = %subject, "{err}");
                    MountResponse::error(err)
                }
                Ok(request) => {
                    info!(
                        action = %request.action,
                        job_id = %request.job.id,
                        target_id = %request.backup_target.id,
                        "Processing mount request"
                    );
                    handler.handle(request).await
                }
                Err(e) => {
                    warn!(subject = %subject, error = %e, "Dropping malformed request");
                    MountResponse::error(format!("malformed request: {e}"))
                }
            };

            let Some(reply_to) = reply_to else {
                // Fire-and-forget request; the outcome lives only in logs.
                continue;
            };

            let payload = match serde_json::to_vec(&response) {
                Ok(p) => p,
                Err(e) => {
                    error!(error = %e, "Failed to encode reply");
                    continue;
                }
            };

            let mut headers = HeaderMap::new();
            if let Some(id) = &correlation {
                headers.insert(CORRELATION_HEADER, id.as_str());
            }

            if let Err(e) = self
                .nats
                .publish_with_headers(reply_to, headers, payload.into())
                .await
            {
                warn!(error = %e, "Failed to publish reply; requester will time out");
            }
        }

        let _ = requests.unsubscribe().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoHandler;

    #[async_trait::async_trait]
    impl RpcHandler for EchoHandler {
        async fn handle(&self, request: MountRequest) -> MountResponse {
            MountResponse::success("ok", request.mount_path().to_string())
        }
    }

    #[test]
    fn handler_trait_is_object_safe() {
        // The server stores handlers as trait objects.
        let _handler: &dyn RpcHandler = &EchoHandler;
    }
}
