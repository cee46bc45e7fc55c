//! Configuration module for the Dynamic Mount Service.
//!
//! Provides typed configuration structs that map to the YAML configuration
//! file, with loading, validation, defaults, environment overrides, and a
//! builder for programmatic use.
//!
//! Precedence is defaults < file < environment: `load` applies the file on
//! top of the defaults, and `apply_env_overrides` applies `DMS_*` variables
//! on top of whatever was loaded.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Config struct with sub-sections
// ---------------------------------------------------------------------------

/// Top-level configuration shared by the coordinator and the server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DmsConfig {
    pub broker: BrokerConfig,
    pub ledger: LedgerConfig,
    pub node: NodeConfig,
    pub auth: AuthConfig,
    pub fuse: FuseHelperConfig,
    pub mount_helper: MountHelperConfig,
    pub locking: LockConfig,
    pub logging: LoggingConfig,
}

/// Message broker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Broker connection URL.
    pub url: String,
    /// Seconds a caller waits for a mount/unmount reply.
    pub rpc_timeout_secs: u64,
}

/// Ledger database settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Database URL for the mount ledger (client side only).
    pub url: String,
}

/// Per-node identity and mount layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Node identifier; empty means "use the hostname".
    pub node_id: String,
    /// Base directory for mount points when a request omits one upstream.
    pub mount_base_path: PathBuf,
}

/// Identity service settings (server side only).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Identity service URL validating the tokens carried by requests.
    pub url: String,
}

/// FUSE helper process settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FuseHelperConfig {
    /// Path to the S3 FUSE helper binary.
    pub binary_path: PathBuf,
    /// Directory holding `<target_id>.pid` files.
    pub pid_dir: PathBuf,
    /// Seconds to wait for a freshly spawned helper to appear in the
    /// kernel mount table.
    pub readiness_timeout_secs: u64,
}

/// Privileged mount helper settings (NFS).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MountHelperConfig {
    /// Path to the privileged mount helper.
    pub path: PathBuf,
    /// Optional helper configuration file passed through to the helper.
    pub conf: Option<PathBuf>,
}

/// Host lock settings (client side only).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Directory holding the host lock file.
    pub lock_dir: PathBuf,
    /// Seconds to wait for the host lock before giving up.
    pub timeout_secs: u64,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: `trace`, `debug`, `info`, `warn`, or `error`.
    pub level: String,
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            rpc_timeout_secs: 60,
        }
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:///var/lib/dms/ledger.db".to_string(),
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            mount_base_path: PathBuf::from("/var/lib/dms/mounts"),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:5000/v3".to_string(),
        }
    }
}

impl Default for FuseHelperConfig {
    fn default() -> Self {
        Self {
            binary_path: PathBuf::from("/usr/bin/s3fusehelper"),
            pid_dir: PathBuf::from("/run/dms/s3"),
            readiness_timeout_secs: 30,
        }
    }
}

impl Default for MountHelperConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/usr/bin/mount"),
            conf: None,
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lock_dir: PathBuf::from("/var/lock/dms"),
            timeout_secs: 300,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl DmsConfig {
    /// Load configuration from a YAML file at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: DmsConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Try to load from `path`; fall back to [`DmsConfig::default`] on any
    /// error.
    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_default()
    }

    /// Platform-appropriate default path for the configuration file.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/etc"))
            .join("dms")
            .join("config.yaml")
    }

    /// Apply `DMS_*` environment variables on top of this configuration.
    ///
    /// Unparseable numeric variables are ignored rather than failing
    /// startup; validation will catch out-of-range values afterwards.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("DMS_BROKER_URL") {
            self.broker.url = v;
        }
        if let Ok(v) = std::env::var("DMS_RPC_TIMEOUT") {
            if let Ok(secs) = v.parse() {
                self.broker.rpc_timeout_secs = secs;
            }
        }
        if let Ok(v) = std::env::var("DMS_LEDGER_URL") {
            self.ledger.url = v;
        }
        if let Ok(v) = std::env::var("DMS_NODE_ID") {
            self.node.node_id = v;
        }
        if let Ok(v) = std::env::var("DMS_MOUNT_BASE") {
            self.node.mount_base_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("DMS_AUTH_URL") {
            self.auth.url = v;
        }
        if let Ok(v) = std::env::var("DMS_FUSE_BINARY") {
            self.fuse.binary_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("DMS_PID_DIR") {
            self.fuse.pid_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("DMS_MOUNT_HELPER") {
            self.mount_helper.path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("DMS_MOUNT_HELPER_CONF") {
            self.mount_helper.conf = Some(PathBuf::from(v));
        }
        if let Ok(v) = std::env::var("DMS_LOCK_DIR") {
            self.locking.lock_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("DMS_LOCK_TIMEOUT") {
            if let Ok(secs) = v.parse() {
                self.locking.timeout_secs = secs;
            }
        }
        if let Ok(v) = std::env::var("DMS_LOG_LEVEL") {
            self.logging.level = v;
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// A single validation error found in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path to the offending field, e.g. `"locking.timeout_secs"`.
    pub field: String,
    /// Human-readable explanation.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Valid values for `logging.level`.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

impl DmsConfig {
    /// Validate the configuration and return all errors found.
    ///
    /// An empty vector means the configuration is valid.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        // --- broker ---
        if self.broker.url.is_empty() {
            errors.push(ValidationError {
                field: "broker.url".into(),
                message: "must not be empty".into(),
            });
        }
        if self.broker.rpc_timeout_secs == 0 {
            errors.push(ValidationError {
                field: "broker.rpc_timeout_secs".into(),
                message: "must be greater than 0".into(),
            });
        }

        // --- ledger ---
        if self.ledger.url.is_empty() {
            errors.push(ValidationError {
                field: "ledger.url".into(),
                message: "must not be empty".into(),
            });
        }

        // --- fuse ---
        if !self.fuse.pid_dir.is_absolute() {
            errors.push(ValidationError {
                field: "fuse.pid_dir".into(),
                message: format!("must be absolute: {}", self.fuse.pid_dir.display()),
            });
        }
        if self.fuse.readiness_timeout_secs == 0 {
            errors.push(ValidationError {
                field: "fuse.readiness_timeout_secs".into(),
                message: "must be greater than 0".into(),
            });
        }

        // --- locking ---
        if !self.locking.lock_dir.is_absolute() {
            errors.push(ValidationError {
                field: "locking.lock_dir".into(),
                message: format!("must be absolute: {}", self.locking.lock_dir.display()),
            });
        }
        if self.locking.timeout_secs == 0 {
            errors.push(ValidationError {
                field: "locking.timeout_secs".into(),
                message: "must be greater than 0".into(),
            });
        }

        // --- node ---
        if !self.node.mount_base_path.is_absolute() {
            errors.push(ValidationError {
                field: "node.mount_base_path".into(),
                message: format!(
                    "must be absolute: {}",
                    self.node.mount_base_path.display()
                ),
            });
        }

        // --- logging ---
        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            errors.push(ValidationError {
                field: "logging.level".into(),
                message: format!(
                    "invalid level '{}'; valid options: {}",
                    self.logging.level,
                    VALID_LOG_LEVELS.join(", ")
                ),
            });
        }

        errors
    }
}

// ---------------------------------------------------------------------------
// ConfigBuilder
// ---------------------------------------------------------------------------

/// Builder for constructing a [`DmsConfig`] programmatically.
///
/// Starts from [`DmsConfig::default`] and allows selective overrides.
///
/// # Example
///
/// ```rust
/// use dms_core::config::ConfigBuilder;
///
/// let config = ConfigBuilder::new()
///     .broker_url("nats://broker:4222")
///     .node_id("compute-01")
///     .lock_timeout_secs(30)
///     .build();
/// assert_eq!(config.node.node_id, "compute-01");
/// ```
#[derive(Debug, Clone, Default)]
pub struct ConfigBuilder {
    config: DmsConfig,
}

impl ConfigBuilder {
    /// Create a new builder initialised with default values.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn broker_url(mut self, url: impl Into<String>) -> Self {
        self.config.broker.url = url.into();
        self
    }

    pub fn rpc_timeout_secs(mut self, secs: u64) -> Self {
        self.config.broker.rpc_timeout_secs = secs;
        self
    }

    pub fn ledger_url(mut self, url: impl Into<String>) -> Self {
        self.config.ledger.url = url.into();
        self
    }

    pub fn node_id(mut self, id: impl Into<String>) -> Self {
        self.config.node.node_id = id.into();
        self
    }

    pub fn mount_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.node.mount_base_path = path.into();
        self
    }

    pub fn auth_url(mut self, url: impl Into<String>) -> Self {
        self.config.auth.url = url.into();
        self
    }

    pub fn fuse_binary_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.fuse.binary_path = path.into();
        self
    }

    pub fn pid_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.fuse.pid_dir = path.into();
        self
    }

    pub fn readiness_timeout_secs(mut self, secs: u64) -> Self {
        self.config.fuse.readiness_timeout_secs = secs;
        self
    }

    pub fn mount_helper_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.mount_helper.path = path.into();
        self
    }

    pub fn lock_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.locking.lock_dir = path.into();
        self
    }

    pub fn lock_timeout_secs(mut self, secs: u64) -> Self {
        self.config.locking.timeout_secs = secs;
        self
    }

    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    /// Consume the builder and return the finished [`DmsConfig`].
    pub fn build(self) -> DmsConfig {
        self.config
    }

    /// Build and validate in one step. Returns `Err` with the list of
    /// validation errors if the configuration is invalid.
    pub fn build_validated(self) -> Result<DmsConfig, Vec<ValidationError>> {
        let config = self.build();
        let errors = config.validate();
        if errors.is_empty() {
            Ok(config)
        } else {
            Err(errors)
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
