#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("rule not found: {rule_id}")]
    NotFound { rule_id: String },

    #[error("rule already exists: {rule_id}")]
    Duplicate { rule_id: String },

    #[error("invalid rule: {message}")]
    Invalid { message: String },

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl Error {
    #[must_use]
    pub fn not_found(rule_id: impl Into<String>) -> Self {
        Self::NotFound {
            rule_id: rule_id.into(),
        }
    }

    #[must_use]
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
