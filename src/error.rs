use thiserror::Error;

/// Library-surface error taxonomy.
///
/// Only `InvalidInput` and `VersionNotFound` surface as request failures;
/// missing evidence, degraded extraction, and timeouts are carried in-band on
/// the analysis result so callers can render partial output.
#[derive(Debug, Error)]
pub enum PeriopError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Evidence version not found: {version}. Available: {available}")]
    VersionNotFound { version: String, available: String },

    #[error("{entity} not found: {id}. {suggestion}")]
    NotFound {
        entity: String,
        id: String,
        suggestion: String,
    },

    #[error("Request cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PeriopError {
    pub fn invalid<S: Into<String>>(message: S) -> Self {
        Self::InvalidInput(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_input_message_names_the_field() {
        let err = PeriopError::invalid("hpi_text must not be empty");
        assert_eq!(err.to_string(), "Invalid input: hpi_text must not be empty");
    }

    #[test]
    fn version_not_found_lists_available_versions() {
        let err = PeriopError::VersionNotFound {
            version: "v2019.01".into(),
            available: "v2025.06, current".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("v2019.01"));
        assert!(msg.contains("v2025.06"));
    }
}
