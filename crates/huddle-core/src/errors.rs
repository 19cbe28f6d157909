//! Collaborator error types.

use thiserror::Error;

/// Failure reported by an external storage collaborator.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing store rejected or failed the write.
    #[error("store write failed: {0}")]
    Write(String),
    /// The backing store could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_error_display() {
        let err = StoreError::Write("constraint violated".into());
        assert_eq!(err.to_string(), "store write failed: constraint violated");
    }

    #[test]
    fn unavailable_error_display() {
        let err = StoreError::Unavailable("connection refused".into());
        assert!(err.to_string().contains("connection refused"));
    }
}
