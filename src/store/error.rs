//! Error types for store operations.
//!
//! Every error carries a structured context naming the operation, the
//! entity involved and whether a retry could help; the scheduler uses the
//! retryable flag to decide between a single retry and backpressure.

use std::fmt;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Structured context attached to store errors.
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    /// Operation being performed, e.g. "insert_positions".
    pub operation: Option<String>,
    /// Entity type involved, e.g. "anomaly".
    pub entity: Option<String>,
    /// Entity or batch id if applicable.
    pub entity_id: Option<String>,
    /// Whether this error is retryable.
    pub retryable: bool,
}

impl ErrorContext {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: Some(operation.into()),
            ..Default::default()
        }
    }

    pub fn with_entity(mut self, entity: impl Into<String>) -> Self {
        self.entity = Some(entity.into());
        self
    }

    pub fn with_entity_id(mut self, id: impl ToString) -> Self {
        self.entity_id = Some(id.to_string());
        self
    }

    pub fn retryable(mut self) -> Self {
        self.retryable = true;
        self
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(ref op) = self.operation {
            parts.push(format!("operation={op}"));
        }
        if let Some(ref entity) = self.entity {
            parts.push(format!("entity={entity}"));
        }
        if let Some(ref id) = self.entity_id {
            parts.push(format!("id={id}"));
        }
        if self.retryable {
            parts.push("retryable=true".to_string());
        }
        write!(f, "[{}]", parts.join(", "))
    }
}

/// Error type for store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Connection or pool failure; typically transient.
    #[error("connection error: {message} {context}")]
    Connection { message: String, context: ErrorContext },

    /// Statement execution failure.
    #[error("query error: {message} {context}")]
    Query { message: String, context: ErrorContext },

    /// Requested entity was not found.
    #[error("not found: {message} {context}")]
    NotFound { message: String, context: ErrorContext },

    /// Uniqueness violated, e.g. duplicate anomaly id.
    #[error("conflict: {message} {context}")]
    Conflict { message: String, context: ErrorContext },

    /// Timed out waiting for a connection or statement.
    #[error("timeout: {message} {context}")]
    Timeout { message: String, context: ErrorContext },

    /// Unexpected internal failure.
    #[error("internal error: {message} {context}")]
    Internal { message: String, context: ErrorContext },
}

impl StoreError {
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            context: ErrorContext::default().retryable(),
        }
    }

    pub fn query(message: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            context: ErrorContext::default(),
        }
    }

    pub fn query_with_context(message: impl Into<String>, context: ErrorContext) -> Self {
        Self::Query {
            message: message.into(),
            context,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
            context: ErrorContext::default(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
            context: ErrorContext::default(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
            context: ErrorContext::default().retryable(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
            context: ErrorContext::default(),
        }
    }

    /// Whether retrying the operation could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Connection { context, .. }
            | StoreError::Query { context, .. }
            | StoreError::NotFound { context, .. }
            | StoreError::Conflict { context, .. }
            | StoreError::Timeout { context, .. }
            | StoreError::Internal { context, .. } => context.retryable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_renders_in_message() {
        let err = StoreError::query_with_context(
            "syntax error",
            ErrorContext::new("insert_positions")
                .with_entity("position")
                .with_entity_id("batch-42"),
        );
        let rendered = err.to_string();
        assert!(rendered.contains("operation=insert_positions"));
        assert!(rendered.contains("id=batch-42"));
    }

    #[test]
    fn connection_and_timeout_are_retryable() {
        assert!(StoreError::connection("pool exhausted").is_retryable());
        assert!(StoreError::timeout("busy").is_retryable());
        assert!(!StoreError::conflict("duplicate").is_retryable());
    }
}
