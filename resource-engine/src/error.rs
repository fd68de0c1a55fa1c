//! Error types
//!
//! Two layers of errors live here:
//!
//! - [`Error`]: infrastructure faults (configuration, I/O, cache backend,
//!   event transport, database driver). These never describe an expected
//!   outcome of a resource operation.
//! - [`ResourceError`]: the typed failure returned by every engine operation.
//!   Expected conditions (`NotFound`, `ValidationFailed`, `Conflict`) are
//!   returned as values; infrastructure faults are wrapped as `Internal`.
//!
//! # Example
//!
//! ```rust
//! use resource_engine::error::{ResourceError, ResourceErrorKind};
//!
//! let error = ResourceError::not_found("Widget", "42");
//! assert!(matches!(error.kind, ResourceErrorKind::NotFound));
//! assert!(!error.is_fatal());
//! ```

use std::fmt;
use thiserror::Error;

/// Result type alias using the infrastructure error
pub type Result<T> = std::result::Result<T, Error>;

/// Result type returned by filter parsing, repository and service operations
pub type ResourceResult<T> = std::result::Result<T, ResourceError>;

/// Infrastructure error type
///
/// Large error variants are boxed to reduce stack size
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(Box<figment::Error>),

    /// Database driver error
    #[cfg(feature = "database")]
    #[error("Database error: {0}")]
    Database(Box<sqlx::Error>),

    /// Redis error
    #[cfg(feature = "cache")]
    #[error("Redis error: {0}")]
    Redis(Box<redis::RedisError>),

    /// NATS error
    #[cfg(feature = "events")]
    #[error("NATS error: {0}")]
    Nats(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration values
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

// Manual From implementations for boxed errors
impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Error::Config(Box::new(err))
    }
}

#[cfg(feature = "database")]
impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Error::Database(Box::new(err))
    }
}

#[cfg(feature = "cache")]
impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        Error::Redis(Box::new(err))
    }
}

// ============================================================================
// Structured resource errors
// ============================================================================

/// Operation being performed when the resource error occurred
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceOperation {
    /// Parsing a filter expression
    ParseFilter,
    /// Building a specification from filter criteria
    BuildSpecification,
    /// Finding a single entity by ID
    FindById,
    /// Finding multiple entities with a specification
    FindAll,
    /// Counting entities matching a specification
    Count,
    /// Checking if an entity exists
    Exists,
    /// Creating a new entity
    Create,
    /// Updating an existing entity
    Update,
    /// Merging non-null fields onto an existing entity
    PartialUpdate,
    /// Soft deleting an entity
    SoftDelete,
    /// Restoring a soft-deleted entity
    Restore,
    /// Physically removing an entity
    HardDelete,
    /// Saving a batch of entities
    SaveAll,
    /// Soft deleting a batch of entities
    SoftDeleteAll,
    /// Beginning or committing a transaction
    Transaction,
}

impl fmt::Display for ResourceOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ParseFilter => write!(f, "parse_filter"),
            Self::BuildSpecification => write!(f, "build_specification"),
            Self::FindById => write!(f, "find_by_id"),
            Self::FindAll => write!(f, "find_all"),
            Self::Count => write!(f, "count"),
            Self::Exists => write!(f, "exists"),
            Self::Create => write!(f, "create"),
            Self::Update => write!(f, "update"),
            Self::PartialUpdate => write!(f, "partial_update"),
            Self::SoftDelete => write!(f, "soft_delete"),
            Self::Restore => write!(f, "restore"),
            Self::HardDelete => write!(f, "hard_delete"),
            Self::SaveAll => write!(f, "save_all"),
            Self::SoftDeleteAll => write!(f, "soft_delete_all"),
            Self::Transaction => write!(f, "transaction"),
        }
    }
}

/// Category of resource error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceErrorKind {
    /// Entity id absent, or inactive on a read-biased path
    NotFound,
    /// Malformed input, batch size exceeded or unresolvable field path
    ValidationFailed,
    /// Version mismatch or duplicate unique key
    Conflict,
    /// Operation exceeded its time budget
    Timeout,
    /// Backing store or cache could not be reached
    ConnectionFailed,
    /// Unexpected store, cache or serialization fault
    Internal,
}

impl fmt::Display for ResourceErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "not_found"),
            Self::ValidationFailed => write!(f, "validation_failed"),
            Self::Conflict => write!(f, "conflict"),
            Self::Timeout => write!(f, "timeout"),
            Self::ConnectionFailed => write!(f, "connection_failed"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

/// Structured resource error with operation context
///
/// Provides detailed information about what operation failed, why it failed,
/// and which entity was involved.
///
/// # Example
///
/// ```rust
/// use resource_engine::error::{ResourceError, ResourceOperation};
///
/// let error = ResourceError::conflict("Widget", "1", 0, 1)
///     .with_operation(ResourceOperation::Update);
/// println!("{}", error); // "Resource conflict error during update: ... [Widget: 1]"
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceError {
    /// The operation being performed when the error occurred
    pub operation: ResourceOperation,
    /// The category of error
    pub kind: ResourceErrorKind,
    /// Human-readable error message
    pub message: String,
    /// The type of entity involved (e.g., "Widget", "User")
    pub entity_type: Option<String>,
    /// The ID of the entity involved
    pub entity_id: Option<String>,
}

impl ResourceError {
    /// Create a new resource error
    pub fn new(
        operation: ResourceOperation,
        kind: ResourceErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            operation,
            kind,
            message: message.into(),
            entity_type: None,
            entity_id: None,
        }
    }

    /// Create a "not found" error with entity context
    pub fn not_found(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            operation: ResourceOperation::FindById,
            kind: ResourceErrorKind::NotFound,
            message: "Entity not found".to_string(),
            entity_type: Some(entity_type.into()),
            entity_id: Some(entity_id.into()),
        }
    }

    /// Create a validation failed error
    pub fn validation_failed(message: impl Into<String>) -> Self {
        Self::new(
            ResourceOperation::BuildSpecification,
            ResourceErrorKind::ValidationFailed,
            message,
        )
    }

    /// Create a validation error for a field path that does not resolve
    /// against the entity schema
    pub fn invalid_field(entity_type: impl Into<String>, path: &str) -> Self {
        let entity_type = entity_type.into();
        Self {
            operation: ResourceOperation::BuildSpecification,
            kind: ResourceErrorKind::ValidationFailed,
            message: format!("Unresolvable field '{}' on {}", path, entity_type),
            entity_type: Some(entity_type),
            entity_id: None,
        }
    }

    /// Create an optimistic-lock conflict error
    pub fn conflict(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        expected_version: i64,
        actual_version: i64,
    ) -> Self {
        Self {
            operation: ResourceOperation::Update,
            kind: ResourceErrorKind::Conflict,
            message: format!(
                "Version mismatch: expected {}, found {}",
                expected_version, actual_version
            ),
            entity_type: Some(entity_type.into()),
            entity_id: Some(entity_id.into()),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: ResourceOperation, message: impl Into<String>) -> Self {
        Self::new(operation, ResourceErrorKind::Timeout, message)
    }

    /// Create a connection failed error
    pub fn connection_failed(message: impl Into<String>) -> Self {
        Self::new(
            ResourceOperation::Transaction,
            ResourceErrorKind::ConnectionFailed,
            message,
        )
    }

    /// Create an internal error
    pub fn internal(operation: ResourceOperation, message: impl Into<String>) -> Self {
        Self::new(operation, ResourceErrorKind::Internal, message)
    }

    /// Add entity context to an existing error
    #[must_use]
    pub fn with_entity(
        mut self,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
    ) -> Self {
        self.entity_type = Some(entity_type.into());
        self.entity_id = Some(entity_id.into());
        self
    }

    /// Add only the entity type to an existing error
    #[must_use]
    pub fn with_entity_type(mut self, entity_type: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self
    }

    /// Set the operation that caused the error
    #[must_use]
    pub fn with_operation(mut self, operation: ResourceOperation) -> Self {
        self.operation = operation;
        self
    }

    /// Check if this error is retriable (transient errors that may succeed on retry)
    pub fn is_retriable(&self) -> bool {
        matches!(
            self.kind,
            ResourceErrorKind::ConnectionFailed | ResourceErrorKind::Timeout
        )
    }

    /// Check if this error is an unexpected fault rather than an expected outcome
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind,
            ResourceErrorKind::Internal | ResourceErrorKind::ConnectionFailed
        )
    }

    /// Whether this is a `NotFound` outcome
    pub fn is_not_found(&self) -> bool {
        self.kind == ResourceErrorKind::NotFound
    }

    /// Whether this is a `Conflict` outcome
    pub fn is_conflict(&self) -> bool {
        self.kind == ResourceErrorKind::Conflict
    }

    /// Whether the operation ran out of time
    pub fn is_timeout(&self) -> bool {
        self.kind == ResourceErrorKind::Timeout
    }

    /// Whether this is a `ValidationFailed` outcome
    pub fn is_validation(&self) -> bool {
        self.kind == ResourceErrorKind::ValidationFailed
    }
}

impl fmt::Display for ResourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Resource {} error during {}: {}",
            self.kind, self.operation, self.message
        )?;
        match (&self.entity_type, &self.entity_id) {
            (Some(entity_type), Some(entity_id)) => write!(f, " [{}: {}]", entity_type, entity_id)?,
            (Some(entity_type), None) => write!(f, " [{}]", entity_type)?,
            _ => {}
        }
        Ok(())
    }
}

impl std::error::Error for ResourceError {}

// Infrastructure faults surface as Internal (or ConnectionFailed) outcomes
impl From<Error> for ResourceError {
    fn from(err: Error) -> Self {
        match err {
            #[cfg(feature = "database")]
            Error::Database(db) => ResourceError::from(*db),
            #[cfg(feature = "cache")]
            Error::Redis(e) if e.is_connection_refusal() || e.is_timeout() => {
                ResourceError::connection_failed(e.to_string())
            }
            other => ResourceError::internal(ResourceOperation::Transaction, other.to_string()),
        }
    }
}

impl From<serde_json::Error> for ResourceError {
    fn from(err: serde_json::Error) -> Self {
        ResourceError::internal(
            ResourceOperation::Transaction,
            format!("Serialization failed: {}", err),
        )
    }
}

// Conversion from sqlx::Error, categorized by cause
#[cfg(feature = "database")]
impl From<sqlx::Error> for ResourceError {
    fn from(err: sqlx::Error) -> Self {
        use sqlx::Error as E;
        match err {
            E::RowNotFound => Self::new(
                ResourceOperation::FindById,
                ResourceErrorKind::NotFound,
                "Row not found",
            ),
            E::PoolTimedOut => Self::timeout(
                ResourceOperation::Transaction,
                "Connection pool timed out",
            ),
            E::PoolClosed => Self::connection_failed("Connection pool is closed"),
            E::Io(e) => Self::connection_failed(e.to_string()),
            E::Tls(e) => Self::connection_failed(format!("TLS error: {}", e)),
            E::WorkerCrashed => Self::connection_failed("Database worker crashed"),
            E::Database(db_err) => {
                let kind = if db_err.is_unique_violation() {
                    ResourceErrorKind::Conflict
                } else if db_err.is_foreign_key_violation() || db_err.is_check_violation() {
                    ResourceErrorKind::ValidationFailed
                } else {
                    ResourceErrorKind::Internal
                };
                Self::new(ResourceOperation::Transaction, kind, db_err.to_string())
            }
            other => Self::internal(ResourceOperation::Transaction, other.to_string()),
        }
    }
}
