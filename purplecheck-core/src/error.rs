//! Error types for purplecheck-core

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using purplecheck Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for the checking engine
#[derive(Debug, Error, Diagnostic)]
pub enum Error {
    #[error("Configuration error: {0}")]
    #[diagnostic(code(purplecheck::config))]
    Config(String),

    #[error("Database error: {0}")]
    #[diagnostic(code(purplecheck::database))]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    #[diagnostic(code(purplecheck::io))]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    #[diagnostic(code(purplecheck::serde))]
    Serde(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    #[diagnostic(code(purplecheck::toml))]
    Toml(#[from] toml::de::Error),

    /// Payload failed the codec. Never retried; the message is dead-lettered.
    #[error("Malformed message: {0}")]
    #[diagnostic(code(purplecheck::malformed))]
    Malformed(String),

    #[error("Broker error: {0}")]
    #[diagnostic(code(purplecheck::broker))]
    Broker(String),

    #[error("{entity} not found: {id}")]
    #[diagnostic(code(purplecheck::not_found))]
    NotFound { entity: &'static str, id: String },

    /// Compare-and-set failure on a state transition.
    #[error("state conflict for detection execution {id}: status is '{actual}'")]
    #[diagnostic(code(purplecheck::conflict))]
    Conflict { id: String, actual: String },

    /// A domain invariant was violated.
    #[error("Constraint violated: {0}")]
    #[diagnostic(code(purplecheck::constraint))]
    Constraint(String),

    /// Connectivity or capacity failure that may succeed on retry.
    #[error("Transient failure: {0}")]
    #[diagnostic(code(purplecheck::transient))]
    Transient(String),
}

impl Error {
    /// Whether nacking and letting the broker redeliver can help.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Transient(_) | Error::Broker(_) => true,
            Error::Database(e) => matches!(
                e,
                sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::Io(_)
                    | sqlx::Error::Tls(_)
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::Transient("connection reset".into()).is_transient());
        assert!(Error::Broker("publish channel closed".into()).is_transient());
        assert!(!Error::Malformed("missing field".into()).is_transient());
        assert!(!Error::Conflict {
            id: "x".into(),
            actual: "completed".into()
        }
        .is_transient());
    }
}
