//! Error types for the CLI

/// CLI Result type
pub type Result<T> = std::result::Result<T, Error>;

/// CLI errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    #[error(transparent)]
    Gc(#[from] capa_gc::Error),

    #[error("cluster not found: {namespace}/{name}")]
    ClusterNotFound { namespace: String, name: String },

    #[error("infrastructure object not found: {kind} {namespace}/{name}")]
    InfrastructureNotFound {
        kind: String,
        namespace: String,
        name: String,
    },

    #[error("validation error: {message}")]
    Validation { message: String },

    #[error("command failed: {message}")]
    CommandFailed { message: String },
}

impl Error {
    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation {
            message: message.into(),
        }
    }

    pub fn command_failed(message: impl Into<String>) -> Self {
        Error::CommandFailed {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gc_errors_pass_through_unchanged() {
        let inner = capa_gc::Error::validation("unknown GC task \"INVALID\"");
        let message = inner.to_string();
        let err: Error = inner.into();
        assert!(matches!(err, Error::Gc(_)));
        assert_eq!(err.to_string(), message);
    }

    #[test]
    fn missing_cluster_names_namespace_and_name() {
        let err = Error::ClusterNotFound {
            namespace: "capi".into(),
            name: "prod".into(),
        };
        assert_eq!(err.to_string(), "cluster not found: capi/prod");
    }
}
