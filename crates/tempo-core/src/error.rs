use serde::Serialize;

/// The error taxonomy from the system spec: admission errors are
/// user-visible and recoverable, transport errors never reach here (they
/// are captured as `success=false` samples), durable-store errors are
/// logged and swallowed except for the initial descriptor write, and
/// fatal process errors abort startup before this type is ever
/// constructed.
#[derive(Debug, thiserror::Error)]
pub enum TempoError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Target rejected: {0}")]
    Admission(String),

    #[error("Rate limited: retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Run not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Serialize for TempoError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl From<rusqlite::Error> for TempoError {
    fn from(err: rusqlite::Error) -> Self {
        TempoError::Storage(err.to_string())
    }
}

impl From<tokio_rusqlite::Error> for TempoError {
    fn from(err: tokio_rusqlite::Error) -> Self {
        TempoError::Storage(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_display() {
        let err = TempoError::Validation("users must be >= 1".to_string());
        assert_eq!(err.to_string(), "Validation error: users must be >= 1");
    }

    #[test]
    fn admission_error_display() {
        let err = TempoError::Admission("target resolves to a private address".to_string());
        assert_eq!(
            err.to_string(),
            "Target rejected: target resolves to a private address"
        );
    }

    #[test]
    fn rate_limited_display() {
        let err = TempoError::RateLimited {
            retry_after_secs: 5,
        };
        assert_eq!(err.to_string(), "Rate limited: retry after 5s");
    }

    #[test]
    fn not_found_display() {
        let err = TempoError::NotFound("abc-123".to_string());
        assert_eq!(err.to_string(), "Run not found: abc-123");
    }

    #[test]
    fn serialize_produces_string() {
        let err = TempoError::Validation("test error".to_string());
        let json = serde_json::to_string(&err).expect("serialize should succeed");
        assert_eq!(json, "\"Validation error: test error\"");
    }

    #[test]
    fn io_error_from_std() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: TempoError = io_err.into();
        let msg = err.to_string();
        assert!(msg.contains("IO error"));
        assert!(msg.contains("file not found"));
    }

    #[test]
    fn error_is_debug() {
        let err = TempoError::Engine("deadline timer panicked".to_string());
        let debug = format!("{:?}", err);
        assert!(debug.contains("Engine"));
    }
}
