//! Mount transport port (driven/secondary port)
//!
//! Interface for delivering a mount request to the server owning the
//! request's host and awaiting its reply. Implemented by the broker
//! client in `dms-rpc`; test doubles implement it directly.

use crate::domain::{MountRequest, MountResponse};

/// Port trait for the request/reply transport to per-node servers.
///
/// A `call` blocks (asynchronously) until the reply for this request
/// arrives or the transport's configured timeout elapses. Timeouts and
/// broker failures surface as errors; a reply carrying `status = error`
/// is a successful call.
#[async_trait::async_trait]
pub trait IMountTransport: Send + Sync {
    /// Send `request` to the server for `request.host` and await the
    /// correlated reply.
    async fn call(&self, request: &MountRequest) -> anyhow::Result<MountResponse>;
}
