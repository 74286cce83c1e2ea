use std::error::Error as StdError;

/// Crate-wide result type for endpoint and platform operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Typed errors shared by the endpoint and platform traits.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Input payload or parameter is invalid.
    #[error("invalid input: {message}")]
    InvalidInput { message: String },

    /// No endpoint is registered for the instance id.
    #[error("unknown instance: {instance_id}")]
    UnknownInstance { instance_id: String },

    /// The instance rejected the request (non-zero response code).
    #[error("instance {instance_id} rejected {operation}: {message}")]
    Rejected {
        instance_id: String,
        operation: String,
        message: String,
    },

    /// Operation is currently unavailable (not initialised, offline).
    #[error("unavailable: {message}")]
    Unavailable { message: String },

    /// Wrapped source error from an external dependency.
    #[error("{context}: {source}")]
    External {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },

    /// JSON (de)serialization failed.
    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
}

impl Error {
    #[must_use]
    pub fn invalid_input(message: impl std::fmt::Display) -> Self {
        Self::InvalidInput {
            message: message.to_string(),
        }
    }

    #[must_use]
    pub fn unavailable(message: impl std::fmt::Display) -> Self {
        Self::Unavailable {
            message: message.to_string(),
        }
    }

    #[must_use]
    pub fn unknown_instance(instance_id: impl std::fmt::Display) -> Self {
        Self::UnknownInstance {
            instance_id: instance_id.to_string(),
        }
    }

    #[must_use]
    pub fn rejected(
        instance_id: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Rejected {
            instance_id: instance_id.into(),
            operation: operation.into(),
            message: message.into(),
        }
    }

    #[must_use]
    pub fn external(
        context: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::External {
            context: context.into(),
            source: Box::new(source),
        }
    }
}
