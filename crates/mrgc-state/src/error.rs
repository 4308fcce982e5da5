//! Error types for the global state store.

use thiserror::Error;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during state store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("store unavailable: {op} failed after {attempts} attempts: {last}")]
    Unavailable {
        op: String,
        attempts: usize,
        last: String,
    },
}

impl StateError {
    /// Whether retrying the same operation may succeed.
    ///
    /// Storage and transaction failures are transient. Bad data, missing
    /// keys and conditional-write conflicts are not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StateError::Transaction(_)
                | StateError::Table(_)
                | StateError::Read(_)
                | StateError::Write(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(StateError::Transaction("busy".into()).is_transient());
        assert!(StateError::Write("io".into()).is_transient());
        assert!(!StateError::NotFound("n1".into()).is_transient());
        assert!(!StateError::AlreadyExists("n1".into()).is_transient());
        assert!(!StateError::Deserialize("bad".into()).is_transient());
        let exhausted = StateError::Unavailable {
            op: "put".into(),
            attempts: 3,
            last: "busy".into(),
        };
        assert!(!exhausted.is_transient());
        assert_eq!(
            exhausted.to_string(),
            "store unavailable: put failed after 3 attempts: busy"
        );
    }
}
