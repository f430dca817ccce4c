/// Convenience alias used across the crate.
pub type LivecompResult<T> = Result<T, LivecompError>;

/// Errors surfaced by the composition engine.
///
/// Fatal conditions (duplicate registration, unknown parents, unresolvable
/// transforms) are returned eagerly from the operation that detected them.
/// Persistence failures are carried opaquely and never rolled back against
/// the in-memory tree.
#[derive(thiserror::Error, Debug)]
pub enum LivecompError {
    /// Invalid or duplicate registry declaration.
    #[error("registration error: {0}")]
    Registration(String),

    /// A node's declared component type is not registered.
    #[error("component not found: {0}")]
    ComponentNotFound(String),

    /// No transform implementation resolves for a node.
    #[error("transform not found: {0}")]
    TransformNotFound(String),

    /// A structural operation referenced a nonexistent parent node.
    #[error("parent not found: {0}")]
    ParentNotFound(String),

    /// Input failed validation.
    #[error("validation error: {0}")]
    Validation(String),

    /// Failure reported by the external persistence adapter. The in-memory
    /// tree has already been mutated and is not rolled back.
    #[error("persistence error: {0}")]
    Persistence(#[source] anyhow::Error),

    /// Anything else.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl LivecompError {
    /// Build a [`LivecompError::Registration`].
    pub fn registration(msg: impl Into<String>) -> Self {
        Self::Registration(msg.into())
    }

    /// Build a [`LivecompError::Validation`].
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}
