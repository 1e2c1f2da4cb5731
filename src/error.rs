use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AspectDbErrorCode {
    Io,
    Encode,
    Decode,
    Corruption,
    Validation,
    InvalidConfig,
    PreconditionFailed,
    Commit,
    Publish,
    Retention,
    LockTimeout,
    TransactionClosed,
    AspectNotFound,
    EntityNotFound,
    QueueFull,
}

impl AspectDbErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            AspectDbErrorCode::Io => "io",
            AspectDbErrorCode::Encode => "encode",
            AspectDbErrorCode::Decode => "decode",
            AspectDbErrorCode::Corruption => "corruption",
            AspectDbErrorCode::Validation => "validation",
            AspectDbErrorCode::InvalidConfig => "invalid_config",
            AspectDbErrorCode::PreconditionFailed => "precondition_failed",
            AspectDbErrorCode::Commit => "commit",
            AspectDbErrorCode::Publish => "publish",
            AspectDbErrorCode::Retention => "retention",
            AspectDbErrorCode::LockTimeout => "lock_timeout",
            AspectDbErrorCode::TransactionClosed => "transaction_closed",
            AspectDbErrorCode::AspectNotFound => "aspect_not_found",
            AspectDbErrorCode::EntityNotFound => "entity_not_found",
            AspectDbErrorCode::QueueFull => "queue_full",
        }
    }
}

#[derive(Debug, Error)]
pub enum AspectDbError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode error: {0}")]
    Encode(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("corruption: {message}")]
    Corruption { message: String },
    #[error("validation error: {0}")]
    Validation(String),
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },
    #[error(
        "precondition failed for {entity_id} '{aspect_name}': expected version {expected}, found {found}"
    )]
    PreconditionFailed {
        entity_id: String,
        aspect_name: String,
        expected: String,
        found: String,
    },
    #[error("commit failed: {0}")]
    Commit(String),
    #[error("publish failed for {entity_id} '{aspect_name}' version {version}: {message}")]
    Publish {
        entity_id: String,
        aspect_name: String,
        version: u64,
        message: String,
    },
    #[error("retention failed for {entity_id} '{aspect_name}': {message}")]
    Retention {
        entity_id: String,
        aspect_name: String,
        message: String,
    },
    #[error("write lock timeout for {entity_id} '{aspect_name}' after {waited_ms}ms")]
    LockTimeout {
        entity_id: String,
        aspect_name: String,
        waited_ms: u64,
    },
    #[error("transaction already closed")]
    TransactionClosed,
    #[error("aspect '{aspect_name}' version {version} not found for {entity_id}")]
    AspectNotFound {
        entity_id: String,
        aspect_name: String,
        version: u64,
    },
    #[error("entity not found: {0}")]
    EntityNotFound(String),
    #[error("retention queue full")]
    QueueFull,
}

impl AspectDbError {
    pub fn code(&self) -> AspectDbErrorCode {
        match self {
            AspectDbError::Io(_) => AspectDbErrorCode::Io,
            AspectDbError::Encode(_) => AspectDbErrorCode::Encode,
            AspectDbError::Decode(_) => AspectDbErrorCode::Decode,
            AspectDbError::Corruption { .. } => AspectDbErrorCode::Corruption,
            AspectDbError::Validation(_) => AspectDbErrorCode::Validation,
            AspectDbError::InvalidConfig { .. } => AspectDbErrorCode::InvalidConfig,
            AspectDbError::PreconditionFailed { .. } => AspectDbErrorCode::PreconditionFailed,
            AspectDbError::Commit(_) => AspectDbErrorCode::Commit,
            AspectDbError::Publish { .. } => AspectDbErrorCode::Publish,
            AspectDbError::Retention { .. } => AspectDbErrorCode::Retention,
            AspectDbError::LockTimeout { .. } => AspectDbErrorCode::LockTimeout,
            AspectDbError::TransactionClosed => AspectDbErrorCode::TransactionClosed,
            AspectDbError::AspectNotFound { .. } => AspectDbErrorCode::AspectNotFound,
            AspectDbError::EntityNotFound(_) => AspectDbErrorCode::EntityNotFound,
            AspectDbError::QueueFull => AspectDbErrorCode::QueueFull,
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code().as_str()
    }

    /// True when retrying the same call may succeed without caller-side changes.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AspectDbError::Commit(_)
                | AspectDbError::LockTimeout { .. }
                | AspectDbError::Retention { .. }
                | AspectDbError::QueueFull
        )
    }
}

#[cfg(test)]
mod tests {
    use super::{AspectDbError, AspectDbErrorCode};

    #[test]
    fn error_code_strings_are_stable() {
        assert_eq!(
            AspectDbErrorCode::PreconditionFailed.as_str(),
            "precondition_failed"
        );
        assert_eq!(AspectDbErrorCode::LockTimeout.as_str(), "lock_timeout");
        assert_eq!(AspectDbErrorCode::Retention.as_str(), "retention");
        assert_eq!(AspectDbErrorCode::EntityNotFound.as_str(), "entity_not_found");
    }

    #[test]
    fn error_code_str_matches_variant_mapping() {
        let err = AspectDbError::PreconditionFailed {
            entity_id: "dataset:logs".into(),
            aspect_name: "ownership".into(),
            expected: "3".into(),
            found: "absent".into(),
        };
        assert_eq!(err.code(), AspectDbErrorCode::PreconditionFailed);
        assert_eq!(err.code_str(), "precondition_failed");
    }

    #[test]
    fn retryable_classification() {
        assert!(AspectDbError::Commit("journal append failed".into()).is_retryable());
        assert!(AspectDbError::LockTimeout {
            entity_id: "dataset:logs".into(),
            aspect_name: "ownership".into(),
            waited_ms: 250,
        }
        .is_retryable());
        assert!(!AspectDbError::Validation("empty batch".into()).is_retryable());
        assert!(!AspectDbError::TransactionClosed.is_retryable());
    }
}
