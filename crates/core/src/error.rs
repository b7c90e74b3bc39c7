use std::fmt;

/// Result alias that carries the custom [`KineticError`] type.
pub type Result<T> = std::result::Result<T, KineticError>;

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum KineticError {
    /// An attribute descriptor failed a specification rule while a stream
    /// graph was being composed.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// A composition referenced a malformed dependency.
    #[error(transparent)]
    Wiring(#[from] WiringError),
    /// The driver-facing API was misused.
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    /// A live execution failed while propagating events.
    #[error(transparent)]
    Propagation(#[from] PropagationError),
    /// Configuration could not be loaded or is inconsistent.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// Free-form message used by collaborators (observers, expressions).
    #[error("{0}")]
    Message(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// Wrapper around JSON decoding errors.
    #[error("{0}")]
    Json(#[from] serde_json::Error),
}

impl KineticError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }
}

impl From<&str> for KineticError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for KineticError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}

/// Raised when a descriptor does not satisfy a [`crate::Specification`].
///
/// Always names exactly one offending property.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{label}: attribute `{property}` {reason}")]
pub struct ValidationError {
    pub label: String,
    pub property: String,
    pub reason: String,
}

impl ValidationError {
    pub fn new(
        label: impl Into<String>,
        property: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            label: label.into(),
            property: property.into(),
            reason: reason.into(),
        }
    }
}

/// Raised when an operator argument is not the kind of stream it expects.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{label}: {reason}")]
pub struct WiringError {
    pub label: String,
    pub reason: String,
}

impl WiringError {
    pub fn new(label: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            reason: reason.into(),
        }
    }
}

/// Misuse of the start/stop API.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LifecycleError {
    #[error("invalid binding name `{0}`")]
    InvalidName(String),
    #[error("binding `{0}` already has a live instance")]
    AlreadyActive(String),
}

/// Error value travelling through [`crate::Sink::error`].
///
/// Cheap to clone so that fan-out combinators can hand the same failure to
/// every attached consumer.
#[derive(Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct PropagationError {
    message: std::rc::Rc<str>,
}

impl PropagationError {
    pub fn new(message: impl AsRef<str>) -> Self {
        Self {
            message: message.as_ref().into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Debug for PropagationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PropagationError")
            .field(&&*self.message)
            .finish()
    }
}

impl From<KineticError> for PropagationError {
    fn from(value: KineticError) -> Self {
        match value {
            KineticError::Propagation(err) => err,
            other => Self::new(other.to_string()),
        }
    }
}
