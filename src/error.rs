//! Error types for resgraph
//!
//! All modules use `StoreResult<T>` as their return type. Every failure coming
//! out of SQLite is classified at the failing statement into one of the
//! [`ErrorKind`]s below, so callers decide on retries by kind and never by
//! inspecting driver errors.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for resgraph operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Coarse classification used by callers to decide what to do with an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A find found nothing, or the row is gone
    NotFound,
    /// A concurrent actor won a race; restart the enclosing transaction
    Retryable,
    /// A state-machine method was called from a state that forbids it
    InvalidTransition,
    /// The operation would break a structural rule (e.g. children present)
    Structural,
    /// A required base type or worker projection does not exist at all
    DependencyMissing,
    /// A stored row violates a shape invariant
    Invariant,
    /// I/O, driver, serialization or configuration failure
    Internal,
}

/// All errors that can occur in resgraph
#[derive(Error, Debug)]
pub enum StoreError {
    // Retryable conflicts
    #[error("resource config already exists")]
    ResourceConfigAlreadyExists,

    #[error("resource config parent disappeared")]
    ResourceConfigParentDisappeared,

    #[error("resource config disappeared")]
    ResourceConfigDisappeared,

    #[error("resource cache already exists")]
    ResourceCacheAlreadyExists,

    #[error("resource cache disappeared")]
    ResourceCacheDisappeared,

    #[error("concurrent update on {0}, safe to retry")]
    SafeRetry(&'static str),

    // Dependency errors
    #[error("base resource type not found: {0}")]
    BaseResourceTypeNotFound(String),

    #[error("base resource type {name} disappeared on worker {worker}")]
    WorkerBaseResourceTypeDisappeared { worker: String, name: String },

    #[error("custom resource type {0} has no version yet")]
    CustomTypeVersionMissing(String),

    #[error("worker not found: {0}")]
    WorkerNotFound(String),

    // Not found
    #[error("{entity} no longer in db: {handle}")]
    Missing { entity: &'static str, handle: String },

    #[error("container owner disappeared: {0}")]
    ContainerOwnerDisappeared(String),

    // State machine errors
    #[error("{entity} {handle} cannot transition from {from} to {to}")]
    InvalidTransition {
        entity: &'static str,
        handle: String,
        from: String,
        to: String,
    },

    #[error("volume {0} cannot be destroyed as children are present")]
    VolumeHasChildren(String),

    #[error("volume {handle} is {state}; only created volumes can have children")]
    ParentVolumeNotCreated { handle: String, state: String },

    #[error("volume {handle} holds a {payload} payload; only container volumes can be initialized")]
    VolumeNotInitializable { handle: String, payload: String },

    // Invariant violations
    #[error("corrupt {table} row {id}: {reason}")]
    Corrupt {
        table: &'static str,
        id: i64,
        reason: String,
    },

    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<StoreError>,
    },

    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Failed to create config directory {path}: {source}")]
    ConfigDirCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // Driver and serialization errors
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    User(String),
}

impl StoreError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a missing-row error
    pub fn missing(entity: &'static str, handle: impl Into<String>) -> Self {
        Self::Missing {
            entity,
            handle: handle.into(),
        }
    }

    /// Create a corrupt-row error
    pub fn corrupt(table: &'static str, id: i64, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            table,
            id,
            reason: reason.into(),
        }
    }

    /// Classify this error against the taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ResourceConfigAlreadyExists
            | Self::ResourceConfigParentDisappeared
            | Self::ResourceConfigDisappeared
            | Self::ResourceCacheAlreadyExists
            | Self::ResourceCacheDisappeared
            | Self::SafeRetry(_) => ErrorKind::Retryable,

            Self::BaseResourceTypeNotFound(_)
            | Self::WorkerBaseResourceTypeDisappeared { .. }
            | Self::CustomTypeVersionMissing(_)
            | Self::WorkerNotFound(_) => ErrorKind::DependencyMissing,

            Self::Missing { .. } | Self::ContainerOwnerDisappeared(_) => ErrorKind::NotFound,

            Self::InvalidTransition { .. } => ErrorKind::InvalidTransition,

            Self::VolumeHasChildren(_)
            | Self::ParentVolumeNotCreated { .. }
            | Self::VolumeNotInitializable { .. } => ErrorKind::Structural,

            Self::Corrupt { .. } => ErrorKind::Invariant,

            Self::RetriesExhausted { last, .. } => last.kind(),

            Self::ConfigInvalid { .. }
            | Self::ConfigDirCreate { .. }
            | Self::Io { .. }
            | Self::Sqlite(_)
            | Self::Json(_)
            | Self::TomlParse(_)
            | Self::TomlSerialize(_)
            | Self::Internal(_)
            | Self::User(_) => ErrorKind::Internal,
        }
    }

    /// Check if the enclosing transaction may be restarted from scratch
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RetriesExhausted { .. } => false,
            other => other.kind() == ErrorKind::Retryable,
        }
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::BaseResourceTypeNotFound(_) => {
                Some("No registered worker provides this type. Run: resgraph workers list")
            }
            Self::WorkerBaseResourceTypeDisappeared { .. } => {
                Some("The worker re-registered or went away; choose another worker")
            }
            Self::VolumeHasChildren(_) => Some("Destroy the child volumes first"),
            Self::ConfigInvalid { .. } => Some("Run: resgraph config show"),
            Self::RetriesExhausted { .. } => {
                Some("Raise database.max_retries if contention is expected")
            }
            _ => None,
        }
    }
}
