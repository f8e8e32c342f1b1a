use thiserror::Error;

/// Errors that can occur in the ShareGuard detection engine library
#[derive(Error, Debug)]
pub enum DetectError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Secret management error
    #[error("Secret error: {0}")]
    Secret(String),

    /// Network I/O error
    #[error("Network I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Panel roster fetch error
    #[error("Roster fetch error: {0}")]
    Roster(String),

    /// Persist sink error
    #[error("Persist sink error: {0}")]
    Persist(String),

    /// Notify sink error
    #[error("Notify sink error: {0}")]
    Notify(String),

    /// Invalid state error
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Timeout error
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

/// Result type alias using DetectError
pub type Result<T> = std::result::Result<T, DetectError>;

impl From<String> for DetectError {
    fn from(s: String) -> Self {
        DetectError::Other(s)
    }
}

impl From<&str> for DetectError {
    fn from(s: &str) -> Self {
        DetectError::Other(s.to_string())
    }
}

impl From<serde_json::Error> for DetectError {
    fn from(err: serde_json::Error) -> Self {
        DetectError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DetectError::Config("missing panel url".to_string());
        assert_eq!(err.to_string(), "Configuration error: missing panel url");
    }

    #[test]
    fn test_error_from_string() {
        let err: DetectError = "test error".into();
        assert!(matches!(err, DetectError::Other(_)));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: DetectError = io_err.into();
        assert!(matches!(err, DetectError::Io(_)));
    }
}
