use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid instance spec: {0}")]
    InvalidSpec(String),

    #[error("no VM resource found in instance spec")]
    NoVmResource,

    #[error("only one VM resource is allowed, found: {}", .0.join(", "))]
    MultipleVmResources(Vec<String>),

    #[error("instance not found: {0}")]
    InstanceNotFound(String),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed resource file {}: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("terraform {command} failed: {message}")]
    Terraform { command: String, message: String },
}

impl EngineError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        EngineError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn json(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        EngineError::Json {
            path: path.into(),
            source,
        }
    }

    /// Input errors are returned synchronously and never retried.
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            EngineError::InvalidSpec(_)
                | EngineError::NoVmResource
                | EngineError::MultipleVmResources(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
