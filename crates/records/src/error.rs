//! Error types for the records crate.

use thiserror::Error;

/// Record error type covering every way a persisted record can be rejected.
#[derive(Debug, Error)]
pub enum RecordError {
    /// Failed to serialize a record.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize a record.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    /// A persisted instance status integer is outside the known range.
    #[error("unknown instance status: {0}")]
    UnknownInstanceStatus(u8),

    /// A persisted dev server status integer is outside the known range.
    #[error("unknown dev server status: {0}")]
    UnknownDevServerStatus(u8),
}

/// Result type alias for record operations.
pub type Result<T> = std::result::Result<T, RecordError>;

impl From<serde_json::Error> for RecordError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_eof() || err.is_syntax() {
            RecordError::Deserialization(err.to_string())
        } else {
            RecordError::Serialization(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_syntax_error_maps_to_deserialization() {
        let err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: RecordError = err.into();
        assert!(matches!(err, RecordError::Deserialization(_)));
    }

    #[test]
    fn test_status_error_display() {
        assert_eq!(
            RecordError::UnknownInstanceStatus(9).to_string(),
            "unknown instance status: 9"
        );
        assert_eq!(
            RecordError::UnknownDevServerStatus(7).to_string(),
            "unknown dev server status: 7"
        );
    }
}
