//! Error types for the Chairlift core crate.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while validating or decoding ride events.
#[derive(Error, Debug)]
pub enum Error {
    /// A field failed to parse or fell outside its accepted range.
    #[error("invalid field '{field}': {reason}")]
    InvalidField {
        /// The name of the invalid field.
        field: &'static str,
        /// Description of what's wrong.
        reason: String,
    },

    /// The request body was absent or empty.
    #[error("missing request body")]
    MissingBody,

    /// JSON parsing error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Shorthand for an [`Error::InvalidField`].
    pub fn invalid_field(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================================================
    // Error Display formatting tests
    // =========================================================================

    #[test]
    fn test_invalid_field_display() {
        let err = Error::invalid_field("liftID", "must be between 1 and 40");
        let msg = err.to_string();
        assert!(msg.contains("liftID"));
        assert!(msg.contains("must be between 1 and 40"));
    }

    #[test]
    fn test_missing_body_display() {
        assert_eq!(Error::MissingBody.to_string(), "missing request body");
    }

    // =========================================================================
    // Error From conversions
    // =========================================================================

    #[test]
    fn test_from_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("not valid json").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Json(_)));
        assert!(err.to_string().contains("JSON error"));
    }

    #[test]
    fn test_error_debug_format() {
        let err = Error::invalid_field("dayID", "out of range");
        let debug = format!("{:?}", err);
        assert!(debug.contains("InvalidField"));
        assert!(debug.contains("dayID"));
    }
}
