//! Authoritative store errors.

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("Row not found: {table}/{key}")]
    NotFound { table: String, key: String },

    /// Compare-and-put lost against a concurrent writer.
    #[error("Version conflict on {table}/{key}: expected {expected:?}, found {actual:?}")]
    VersionConflict {
        table: String,
        key: String,
        expected: Option<u64>,
        actual: Option<u64>,
    },

    #[error("Row already exists: {table}/{key}")]
    AlreadyExists { table: String, key: String },

    #[error("Store unavailable: {message}")]
    Unavailable { message: String },

    #[error("Store call timed out after {millis}ms")]
    Timeout { millis: u64 },

    #[error("Serialization error: {message}")]
    Serialization { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl StoreError {
    #[must_use]
    pub fn not_found(table: impl Into<String>, key: impl Into<String>) -> Self {
        Self::NotFound {
            table: table.into(),
            key: key.into(),
        }
    }

    #[must_use]
    pub fn version_conflict(
        table: impl Into<String>,
        key: impl Into<String>,
        expected: Option<u64>,
        actual: Option<u64>,
    ) -> Self {
        Self::VersionConflict {
            table: table.into(),
            key: key.into(),
            expected,
            actual,
        }
    }

    #[must_use]
    pub fn already_exists(table: impl Into<String>, key: impl Into<String>) -> Self {
        Self::AlreadyExists {
            table: table.into(),
            key: key.into(),
        }
    }

    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn timeout(millis: u64) -> Self {
        Self::Timeout { millis }
    }

    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    #[must_use]
    pub fn is_version_conflict(&self) -> bool {
        matches!(self, Self::VersionConflict { .. })
    }

    /// Infrastructure faults that an idempotent caller may retry.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable { .. } | Self::Timeout { .. })
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(StoreError::unavailable("down").is_transient());
        assert!(StoreError::timeout(250).is_transient());
        assert!(!StoreError::not_found("users", "1").is_transient());
        assert!(StoreError::version_conflict("t", "k", Some(1), Some(2)).is_version_conflict());
    }

    #[test]
    fn test_display() {
        let err = StoreError::not_found("token_families", "fam-1");
        assert_eq!(err.to_string(), "Row not found: token_families/fam-1");
    }
}
