#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unknown instance: {instance_id}")]
    UnknownInstance { instance_id: String },

    #[error(transparent)]
    Endpoint(#[from] wxrelay_common::Error),

    #[error(transparent)]
    Store(#[from] anyhow::Error),

    #[error("{0}")]
    Message(String),
}

impl Error {
    #[must_use]
    pub fn unknown_instance(instance_id: impl Into<String>) -> Self {
        Self::UnknownInstance {
            instance_id: instance_id.into(),
        }
    }

    /// Whether the failure came from an endpoint call that ran out of time.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Endpoint(e) if e.is_timeout())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
