//! Error types for entity manager operations.

use crate::lifecycle::LifecycleEvent;
use std::fmt;

/// The primary error type for all entity manager operations.
#[derive(Debug)]
pub enum Error {
    /// Mapping and configuration errors (never retried)
    Mapping(MappingError),
    /// Tracking state violated by the caller or the adapter
    State(StateError),
    /// Value conversion errors
    Type(TypeError),
    /// Errors raised by a data adapter
    Adapter(AdapterError),
    /// Errors raised by the transactional connection
    Connection(ConnectionError),
    /// A lifecycle hook or event listener failed
    Hook(HookError),
    /// A unit-of-work commit failed; carries the original cause
    CommitFailed(Box<Error>),
    /// Serialization/deserialization errors
    Serde(String),
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct MappingError {
    pub kind: MappingErrorKind,
    pub entity: String,
    pub field: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingErrorKind {
    /// Entity type has no property with the mapped name
    MissingProperty,
    /// A required column is absent from a row
    MissingColumn,
    /// Metadata type disagrees with the entity's declared type
    TypeMismatch,
    /// Metadata declares no identifier, or an identifier is unmapped
    MissingIdentifier,
    /// Association mapping is malformed
    InvalidAssociation,
    /// No metadata registered for the entity type
    UnknownEntity,
    /// Identifier value does not fit the identifier shape
    InvalidIdentifier,
}

#[derive(Debug)]
pub struct StateError {
    pub kind: StateErrorKind,
    pub entity: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateErrorKind {
    /// Entity is not in the tracked (update) set
    NotTracked,
    /// Tracked entity has no snapshot
    MissingSnapshot,
    /// Adapter returned no row after insert
    RowNotFound,
    /// Adapter returned no row on refresh
    RefreshFailed,
    /// A lazy proxy or collection failed to load earlier
    ProxyFailed,
    /// The owning entity manager has been dropped
    ManagerClosed,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
    pub rust_type: Option<&'static str>,
}

#[derive(Debug)]
pub struct AdapterError {
    pub entity: String,
    pub operation: &'static str,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug)]
pub struct ConnectionError {
    pub operation: &'static str,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug)]
pub struct HookError {
    pub event: LifecycleEvent,
    pub entity: String,
    pub message: String,
}

impl MappingError {
    pub fn new(kind: MappingErrorKind, entity: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            entity: entity.into(),
            field: None,
            message: message.into(),
        }
    }

    /// Attach the offending field name.
    #[must_use]
    pub fn field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }
}

impl StateError {
    pub fn new(kind: StateErrorKind, entity: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            entity: entity.into(),
            message: message.into(),
        }
    }
}

impl AdapterError {
    pub fn new(entity: impl Into<String>, operation: &'static str, message: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            operation,
            message: message.into(),
            source: None,
        }
    }
}

impl Error {
    /// Shorthand for a [`MappingError`].
    pub fn mapping(kind: MappingErrorKind, entity: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Mapping(MappingError::new(kind, entity, message))
    }

    /// Shorthand for a [`StateError`].
    pub fn state(kind: StateErrorKind, entity: impl Into<String>, message: impl Into<String>) -> Self {
        Error::State(StateError::new(kind, entity, message))
    }

    /// Is this a configuration or mapping error?
    pub fn is_mapping_error(&self) -> bool {
        matches!(self, Error::Mapping(_) | Error::Type(_))
    }

    /// Is this a tracking state error?
    pub fn is_state_error(&self) -> bool {
        matches!(self, Error::State(_))
    }

    /// Did a unit-of-work commit fail?
    pub fn is_commit_failure(&self) -> bool {
        matches!(self, Error::CommitFailed(_))
    }

    /// The error wrapped by a commit failure, if any.
    pub fn cause(&self) -> Option<&Error> {
        match self {
            Error::CommitFailed(inner) => Some(inner),
            _ => None,
        }
    }

    /// Mapping error kind, if this is a mapping error.
    pub fn mapping_kind(&self) -> Option<MappingErrorKind> {
        match self {
            Error::Mapping(e) => Some(e.kind),
            _ => None,
        }
    }

    /// State error kind, if this is a state error.
    pub fn state_kind(&self) -> Option<StateErrorKind> {
        match self {
            Error::State(e) => Some(e.kind),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Mapping(e) => write!(f, "Mapping error: {}", e),
            Error::State(e) => write!(f, "State error: {}", e),
            Error::Type(e) => {
                if let Some(col) = &e.column {
                    write!(
                        f,
                        "Type error in column '{}': expected {}, found {}",
                        col, e.expected, e.actual
                    )
                } else {
                    write!(f, "Type error: expected {}, found {}", e.expected, e.actual)
                }
            }
            Error::Adapter(e) => write!(f, "Adapter error: {}", e),
            Error::Connection(e) => write!(f, "Connection error: {}", e),
            Error::Hook(e) => write!(f, "Hook error: {}", e),
            Error::CommitFailed(cause) => write!(f, "Commit failed!: {}", cause),
            Error::Serde(msg) => write!(f, "Serialization error: {}", msg),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Adapter(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Connection(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::CommitFailed(cause) => Some(cause.as_ref()),
            _ => None,
        }
    }
}

impl fmt::Display for MappingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for StateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.entity)
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(col) = &self.column {
            write!(
                f,
                "expected {} for column '{}', found {}",
                self.expected, col, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl fmt::Display for AdapterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}: {}", self.entity, self.operation, self.message)
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.operation, self.message)
    }
}

impl fmt::Display for HookError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on {}: {}", self.event, self.entity, self.message)
    }
}

impl From<MappingError> for Error {
    fn from(err: MappingError) -> Self {
        Error::Mapping(err)
    }
}

impl From<StateError> for Error {
    fn from(err: StateError) -> Self {
        Error::State(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<AdapterError> for Error {
    fn from(err: AdapterError) -> Self {
        Error::Adapter(err)
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Error::Connection(err)
    }
}

impl From<HookError> for Error {
    fn from(err: HookError) -> Self {
        Error::Hook(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serde(err.to_string())
    }
}

/// Result type alias for entity manager operations.
pub type Result<T> = std::result::Result<T, Error>;
