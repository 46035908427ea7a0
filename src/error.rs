use crate::providers::error::PersistenceError;
use crate::snowflake::Snowflake;

/// Engine-internal failures.
///
/// None of these are workflow business errors; those travel inside
/// [`crate::WorkflowResult::Error`]. A caller receiving an `EngineError` from
/// the engine has no safe fallback and should treat it as fatal for the
/// current invocation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    #[error("persistence: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("defect: {message}")]
    Defect { message: String },

    #[error("entity type not registered: {entity_type}")]
    EntityNotRegistered { entity_type: String },

    #[error("handler for request {request_id} failed: {message}")]
    HandlerFailed { request_id: Snowflake, message: String },

    #[error("sharding is shut down")]
    Shutdown,
}

impl EngineError {
    pub fn defect(message: impl Into<String>) -> Self {
        EngineError::Defect {
            message: message.into(),
        }
    }

    /// True for storage hiccups that are worth retrying locally.
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::Persistence(e) if e.is_retryable())
    }

    pub fn is_defect(&self) -> bool {
        matches!(self, EngineError::Defect { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_retryable_persistence_is_transient() {
        let busy: EngineError = PersistenceError::retryable("save_request", "database is busy").into();
        assert!(busy.is_transient());

        let corrupt: EngineError = PersistenceError::permanent("save_reply", "unknown request").into();
        assert!(!corrupt.is_transient());

        assert!(!EngineError::defect("already registered").is_transient());
        assert!(EngineError::defect("already registered").is_defect());
        assert!(!EngineError::Shutdown.is_transient());
    }
}
