//! Failures reported by a [`MessageStorage`](super::MessageStorage) implementation.

/// How a message-log call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The log could not serve the call right now: busy, unreachable or timed
    /// out. The same call may succeed later.
    Unavailable,
    /// The log refused the call, e.g. a reply for a request it never filed or
    /// a primary key pointing at a missing request.
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{operation}: {message}")]
pub struct PersistenceError {
    /// Storage call that failed, e.g. `save_reply`.
    pub operation: String,
    pub message: String,
    pub kind: FailureKind,
}

impl PersistenceError {
    pub fn retryable(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            kind: FailureKind::Unavailable,
        }
    }

    pub fn permanent(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            kind: FailureKind::Rejected,
        }
    }

    /// Only an unavailable log is worth asking again.
    pub fn is_retryable(&self) -> bool {
        self.kind == FailureKind::Unavailable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_log_is_retryable_rejection_is_not() {
        let busy = PersistenceError::retryable("request_id_for_primary_key", "log is busy");
        assert_eq!(busy.kind, FailureKind::Unavailable);
        assert!(busy.is_retryable());

        let unknown = PersistenceError::permanent("save_reply", "unknown request 7");
        assert_eq!(unknown.kind, FailureKind::Rejected);
        assert!(!unknown.is_retryable());
        assert_eq!(unknown.to_string(), "save_reply: unknown request 7");
        assert_ne!(busy, PersistenceError::permanent("request_id_for_primary_key", "log is busy"));
    }
}
