#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Store(#[from] anyhow::Error),

    #[error(transparent)]
    Routing(#[from] wxrelay_routing::Error),

    #[error("delivery pipeline is shutting down")]
    Closed,
}

impl From<tokio::sync::AcquireError> for Error {
    fn from(_: tokio::sync::AcquireError) -> Self {
        Self::Closed
    }
}

pub type Result<T> = std::result::Result<T, Error>;
