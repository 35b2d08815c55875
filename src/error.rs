use crate::batch::{OperationId, StateKind};
use crate::transport::TransportError;
use thiserror::Error;

/// Structured error context for better error handling and debugging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorContext {
    /// Field path or configuration key that caused the error (e.g., "batch.concurrency_limit")
    pub field_path: Option<String>,
    /// Additional context about the error (e.g., expected type, actual value)
    pub details: Option<String>,
    /// Source of the error (e.g., "batch_config", "http_transport")
    pub source: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self {
            field_path: None,
            details: None,
            source: None,
        }
    }

    pub fn with_field_path(mut self, path: impl Into<String>) -> Self {
        self.field_path = Some(path.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

impl Default for ErrorContext {
    fn default() -> Self {
        Self::new()
    }
}

/// A broken structural invariant of a batch.
///
/// Defects are never recovered locally: they are kept on the batch and handed
/// to the caller from [`crate::batch::BatchHandle::wait`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Defect {
    #[error("operation {id} completed more than once")]
    DuplicateCompletion { id: OperationId },

    #[error("operation {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: OperationId,
        from: StateKind,
        to: StateKind,
    },

    #[error("operation {id} is not part of this batch")]
    UnknownOperation { id: OperationId },

    #[error("permit accounting mismatch: available {available} + in flight {in_flight} != limit {limit}")]
    PermitLeak {
        limit: usize,
        available: usize,
        in_flight: usize,
    },
}

/// Unified error type for upload batches.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Batch defect: {0}")]
    Defect(#[from] Defect),

    #[error("Configuration error: {message}{}", format_context(.context))]
    Configuration {
        message: String,
        context: ErrorContext,
    },

    #[error("Runtime error: {message}{}", format_context(.context))]
    Runtime {
        message: String,
        context: ErrorContext,
    },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

// Helper function to format error context for display
fn format_context(ctx: &ErrorContext) -> String {
    let mut parts = Vec::new();
    if let Some(ref field) = ctx.field_path {
        parts.push(format!("field: {}", field));
    }
    if let Some(ref details) = ctx.details {
        parts.push(format!("details: {}", details));
    }
    if let Some(ref source) = ctx.source {
        parts.push(format!("source: {}", source));
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!(" ({})", parts.join(", "))
    }
}

impl Error {
    /// Create a new runtime error with structured context
    pub fn runtime_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Runtime {
            message: msg.into(),
            context,
        }
    }

    /// Create a new configuration error with structured context
    pub fn configuration_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Configuration {
            message: msg.into(),
            context,
        }
    }

    /// Extract error context if available
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Error::Configuration { context, .. } | Error::Runtime { context, .. } => Some(context),
            _ => None,
        }
    }

    /// The structural defect behind this error, if any.
    pub fn defect(&self) -> Option<&Defect> {
        match self {
            Error::Defect(d) => Some(d),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_formatting() {
        let err = Error::configuration_with_context(
            "concurrency limit must be positive",
            ErrorContext::new()
                .with_field_path("batch.concurrency_limit")
                .with_source("batch_config"),
        );
        let msg = err.to_string();
        assert!(msg.starts_with("Configuration error: concurrency limit must be positive"));
        assert!(msg.contains("field: batch.concurrency_limit"));
        assert!(msg.contains("source: batch_config"));
        assert!(err.context().is_some());
    }

    #[test]
    fn test_defect_conversion() {
        let err: Error = Defect::DuplicateCompletion { id: OperationId(3) }.into();
        assert_eq!(
            err.defect(),
            Some(&Defect::DuplicateCompletion { id: OperationId(3) })
        );
        assert_eq!(
            err.to_string(),
            "Batch defect: operation #3 completed more than once"
        );
    }

    #[test]
    fn test_permit_leak_message() {
        let d = Defect::PermitLeak {
            limit: 5,
            available: 4,
            in_flight: 0,
        };
        assert!(d.to_string().contains("available 4 + in flight 0 != limit 5"));
    }
}
