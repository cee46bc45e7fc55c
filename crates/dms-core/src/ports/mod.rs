//! Port definitions (traits for adapters)
//!
//! The ports follow the dependency-inversion rule: the core defines the
//! interfaces, the adapter crates (`dms-ledger`, `dms-rpc`, `dms-daemon`)
//! implement them, and the coordinator consumes them as trait objects.

pub mod mount_ledger;
pub mod mount_transport;
pub mod secret_provider;

pub use mount_ledger::{IMountLedger, LedgerFilter};
pub use mount_transport::IMountTransport;
pub use secret_provider::{ISecretProvider, S3Credentials};
