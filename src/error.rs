//! Error taxonomy shared by every driver and the daemon

use thiserror::Error;

/// Volume daemon errors
#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("busy: {0}")]
    Busy(String),

    #[error("has children: {0}")]
    HasChildren(String),

    #[error("driver {driver} does not support {capability} operations")]
    NotSupported { driver: String, capability: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("transient error: {0}")]
    Transient(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("corrupt: {0}")]
    Corrupt(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type used across the crate
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn not_supported(driver: &str, capability: &str) -> Self {
        Error::NotSupported {
            driver: driver.to_string(),
            capability: capability.to_string(),
        }
    }

    /// Network and backend hiccups a caller may retry
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_))
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) => true,
            Error::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_covers_io() {
        let err: Error = std::io::Error::from(std::io::ErrorKind::NotFound).into();
        assert!(err.is_not_found());
        assert!(Error::NotFound("x".into()).is_not_found());
        assert!(!Error::Busy("x".into()).is_not_found());
    }

    #[test]
    fn test_not_supported_message() {
        let err = Error::not_supported("longhorn", "snapshot");
        assert_eq!(
            err.to_string(),
            "driver longhorn does not support snapshot operations"
        );
        assert!(!err.is_transient());
    }
}
