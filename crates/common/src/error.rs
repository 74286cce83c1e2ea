use std::time::Duration;

use thiserror::Error;

/// Errors shared by every wxrelay crate that has no richer local type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Message(String),

    /// A remote call did not finish within its bound.
    #[error("{operation} timed out after {}ms", after.as_millis())]
    Timeout {
        operation: String,
        after: Duration,
    },
}

impl Error {
    #[must_use]
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }

    #[must_use]
    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            after,
        }
    }

    /// Timeouts are always recoverable; the caller retries on its next cycle.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Run `fut` with an upper bound, turning an elapsed deadline into
/// [`Error::Timeout`].
pub async fn bounded<T, E, F>(operation: &str, after: Duration, fut: F) -> Result<T>
where
    F: Future<Output = std::result::Result<T, E>>,
    E: std::fmt::Display,
{
    match tokio::time::timeout(after, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(Error::message(format!("{operation}: {e}"))),
        Err(_) => Err(Error::timeout(operation, after)),
    }
}
