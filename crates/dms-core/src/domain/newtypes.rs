//! Domain newtypes with validation
//!
//! Strongly-typed wrappers for the identifiers that make up a mount
//! binding. Each newtype validates at construction time so the rest of
//! the system never sees a malformed id.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::errors::DomainError;

// ============================================================================
// JobId
// ============================================================================

/// Identifier of a backup or restore job.
///
/// Always a signed 64-bit integer. The wire format carries it as a JSON
/// number; a JSON string fails deserialization, which is intentional.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(i64);

impl JobId {
    /// Wrap a raw job id
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Get the inner integer value
    #[must_use]
    pub const fn as_i64(&self) -> i64 {
        self.0
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<i64>()
            .map(Self)
            .map_err(|e| DomainError::InvalidJobId(format!("'{s}' is not an integer: {e}")))
    }
}

impl From<i64> for JobId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

// ============================================================================
// TargetId
// ============================================================================

/// Identifier of a backup target.
///
/// The id doubles as the stem of the target's pid file
/// (`<pid_dir>/<target_id>.pid`), so path separators and the dot
/// directories are rejected. Validation also runs on deserialization.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TargetId(String);

impl TargetId {
    /// Maximum length in bytes, matching the ledger column width.
    pub const MAX_LEN: usize = 255;

    /// Create a validated target id
    pub fn new(id: impl Into<String>) -> Result<Self, DomainError> {
        let id = id.into();
        if id.is_empty() {
            return Err(DomainError::InvalidTargetId("must not be empty".into()));
        }
        if id.len() > Self::MAX_LEN {
            return Err(DomainError::InvalidTargetId(format!(
                "longer than {} bytes",
                Self::MAX_LEN
            )));
        }
        if id == "." || id == ".." {
            return Err(DomainError::InvalidTargetId(format!("'{id}' is reserved")));
        }
        if id.contains('/') || id.contains('\0') {
            return Err(DomainError::InvalidTargetId(format!(
                "'{id}' contains a path separator or NUL"
            )));
        }
        Ok(Self(id))
    }

    /// Get the id as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for TargetId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TargetId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for TargetId {
    type Error = DomainError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<TargetId> for String {
    fn from(id: TargetId) -> Self {
        id.0
    }
}

// ============================================================================
// HostName
// ============================================================================

/// Name of the compute node a binding belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct HostName(String);

impl HostName {
    /// Maximum length in bytes, matching the ledger column width.
    pub const MAX_LEN: usize = 255;

    /// Create a validated host name
    pub fn new(host: impl Into<String>) -> Result<Self, DomainError> {
        let host = host.into();
        if host.is_empty() {
            return Err(DomainError::InvalidHost("must not be empty".into()));
        }
        if host.len() > Self::MAX_LEN {
            return Err(DomainError::InvalidHost(format!(
                "longer than {} bytes",
                Self::MAX_LEN
            )));
        }
        Ok(Self(host))
    }

    /// Get the host name as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for HostName {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for HostName {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for HostName {
    type Error = DomainError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<HostName> for String {
    fn from(host: HostName) -> Self {
        host.0
    }
}

// ============================================================================
// Tests
// ============================================================================
