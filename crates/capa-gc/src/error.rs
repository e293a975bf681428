//! Error types for the external-resource garbage collector
//!
//! Errors carry the cluster, resource kind or operation they relate to so
//! that a blocked teardown can be diagnosed from the logs alone. Cloud API
//! failures keep their [`CloudError`] classification intact so callers can
//! decide between retrying and giving up.

use thiserror::Error;

use crate::cloud::CloudError;
use crate::tasks::GcTaskKind;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for garbage collection operations
#[derive(Debug, Error)]
pub enum Error {
    /// Cluster configuration (annotations, config) was rejected
    #[error("validation error for {cluster}: {message}")]
    Validation {
        /// Name of the cluster with invalid configuration
        cluster: String,
        /// Description of what's invalid
        message: String,
        /// The offending field or annotation key, if known
        field: Option<String>,
    },

    /// A cloud API call failed
    #[error("cloud error during {operation}: {source}")]
    Cloud {
        /// Operation that was being performed (e.g. "list load-balancer")
        operation: String,
        /// The classified cloud failure
        #[source]
        source: CloudError,
    },

    /// Discovery of one resource kind failed
    #[error("discovery of {kind} failed: {message}")]
    Discovery {
        /// Kind whose discovery failed
        kind: GcTaskKind,
        /// Description of what failed
        message: String,
    },

    /// A lifecycle event could not be decoded or applied
    #[error("event error{}: {message}", event_suffix(.event_id))]
    Event {
        /// Description of what failed
        message: String,
        /// Event identifier, when the envelope could be read
        event_id: Option<String>,
    },

    /// The run was cancelled before it finished
    #[error("cancelled during {stage}")]
    Cancelled {
        /// Stage of the run that observed the cancellation
        stage: String,
    },
}

fn event_suffix(event_id: &Option<String>) -> String {
    event_id
        .as_deref()
        .map(|id| format!(" [{id}]"))
        .unwrap_or_default()
}

impl Error {
    /// Create a validation error without cluster context
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            cluster: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with cluster context
    pub fn validation_for(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            cluster: cluster.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with cluster context and field path
    pub fn validation_for_field(
        cluster: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            cluster: cluster.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Wrap a cloud failure with the operation it interrupted
    pub fn cloud(operation: impl Into<String>, source: CloudError) -> Self {
        Self::Cloud {
            operation: operation.into(),
            source,
        }
    }

    /// Create a discovery error for one kind
    pub fn discovery(kind: GcTaskKind, msg: impl Into<String>) -> Self {
        Self::Discovery {
            kind,
            message: msg.into(),
        }
    }

    /// Create an event error without an event id
    pub fn event(msg: impl Into<String>) -> Self {
        Self::Event {
            message: msg.into(),
            event_id: None,
        }
    }

    /// Create an event error for a specific event
    pub fn event_for(event_id: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Event {
            message: msg.into(),
            event_id: Some(event_id.into()),
        }
    }

    /// Create a cancellation error for the given stage
    pub fn cancelled(stage: impl Into<String>) -> Self {
        Self::Cancelled {
            stage: stage.into(),
        }
    }

    /// Whether retrying the same operation later could succeed
    ///
    /// Validation errors need a human to fix the cluster annotations, so they
    /// are never retryable. Cloud errors defer to their classification.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Validation { .. } => false,
            Self::Cloud { source, .. } => !source.kind.is_fatal(),
            Self::Discovery { .. } | Self::Event { .. } | Self::Cancelled { .. } => true,
        }
    }
}
