//! Error types for the transformation server.
//!
//! Every failure is a typed value. The request path never panics; the one
//! place a panic can originate (user transformation bodies) is contained by
//! the execution pool and converted into [`ExecutionError::Panicked`].

use arrow::datatypes::DataType;
use arrow::error::ArrowError;
use thiserror::Error;
use tonic::Status;

/// Client-visible failure class of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidArgument,
    ResourceExhausted,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::ResourceExhausted => "resource_exhausted",
            ErrorKind::Internal => "internal",
        }
    }
}

// ─── Codec ───

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("input batch is empty")]
    Empty,

    #[error("malformed Arrow IPC input: {0}")]
    Decode(#[source] ArrowError),

    #[error("failed to encode Arrow IPC output: {0}")]
    Encode(#[source] ArrowError),
}

// ─── Registry ───

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("on-demand transformation not found: {name} (project: {project})")]
    NotFound { name: String, project: String },

    #[error("transformation name must not be empty")]
    EmptyName,

    #[error("transformation registered twice: {0}")]
    Duplicate(String),
}

// ─── Transformation bodies ───

/// Error returned by a transformation body.
#[derive(Debug, Error)]
pub enum TransformError {
    #[error("input column not found: {0}")]
    MissingColumn(String),

    #[error("column {column} has type {actual}, expected {expected}")]
    TypeMismatch {
        column: String,
        expected: DataType,
        actual: DataType,
    },

    #[error("Arrow error: {0}")]
    Arrow(#[from] ArrowError),

    #[error("{0}")]
    Failed(String),
}

// ─── Execution ───

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("transformation '{name}' failed: {source}")]
    Transform {
        name: String,
        #[source]
        source: TransformError,
    },

    #[error("transformation '{name}' panicked: {message}")]
    Panicked { name: String, message: String },

    #[error("transformation '{name}' broke its output contract: {reason}")]
    ContractViolation { name: String, reason: String },

    #[error("execution pool overloaded: {queued} requests already queued")]
    Overloaded { queued: usize },

    #[error("execution pool is closed")]
    PoolClosed,
}

// ─── Configuration ───

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),
}

// ─── Server lifecycle ───

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("invalid listen address: {0}")]
    Address(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("reflection setup failed: {0}")]
    Reflection(#[from] tonic_reflection::server::Error),

    #[error("metrics registration failed: {0}")]
    Metrics(#[from] prometheus::Error),
}

// ─── Request path ───

/// Failure of one `TransformFeatures` call.
#[derive(Debug, Error)]
pub enum TransformationServiceError {
    #[error("request carries no transformation input")]
    MissingInput,

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),
}

impl TransformationServiceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransformationServiceError::MissingInput => ErrorKind::InvalidArgument,
            TransformationServiceError::Codec(CodecError::Encode(_)) => ErrorKind::Internal,
            TransformationServiceError::Codec(_) => ErrorKind::InvalidArgument,
            TransformationServiceError::Registry(_) => ErrorKind::InvalidArgument,
            TransformationServiceError::Execution(ExecutionError::Overloaded { .. }) => {
                ErrorKind::ResourceExhausted
            }
            TransformationServiceError::Execution(_) => ErrorKind::Internal,
        }
    }
}

impl From<TransformationServiceError> for Status {
    fn from(err: TransformationServiceError) -> Self {
        match err {
            TransformationServiceError::MissingInput => Status::invalid_argument(err.to_string()),
            TransformationServiceError::Codec(CodecError::Encode(_)) => {
                Status::internal("failed to encode transformation output")
            }
            TransformationServiceError::Codec(e) => Status::invalid_argument(e.to_string()),
            TransformationServiceError::Registry(e) => Status::invalid_argument(e.to_string()),
            TransformationServiceError::Execution(e @ ExecutionError::Overloaded { .. }) => {
                Status::resource_exhausted(e.to_string())
            }
            TransformationServiceError::Execution(ExecutionError::PoolClosed) => {
                Status::internal("transformation service is shutting down")
            }
            // Opaque to the caller; the cause is logged server-side
            TransformationServiceError::Execution(
                ExecutionError::Transform { name, .. }
                | ExecutionError::Panicked { name, .. }
                | ExecutionError::ContractViolation { name, .. },
            ) => Status::internal(format!("transformation '{name}' failed")),
        }
    }
}

pub type Result<T> = std::result::Result<T, TransformationServiceError>;

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::Code;

    #[test]
    fn test_not_found_maps_to_invalid_argument() {
        let err = TransformationServiceError::from(RegistryError::NotFound {
            name: "does_not_exist".into(),
            project: "default".into(),
        });
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        let status = Status::from(err);
        assert_eq!(status.code(), Code::InvalidArgument);
        assert!(status.message().contains("does_not_exist"));
    }

    #[test]
    fn test_decode_maps_to_invalid_argument() {
        let err = TransformationServiceError::from(CodecError::Decode(ArrowError::ParseError(
            "bad magic".into(),
        )));
        assert_eq!(Status::from(err).code(), Code::InvalidArgument);
    }

    #[test]
    fn test_execution_failure_is_opaque_internal() {
        let err = TransformationServiceError::from(ExecutionError::Transform {
            name: "conv_rate_transform".into(),
            source: TransformError::Failed("secret connection string leaked".into()),
        });
        assert_eq!(err.kind(), ErrorKind::Internal);
        let status = Status::from(err);
        assert_eq!(status.code(), Code::Internal);
        assert_eq!(status.message(), "transformation 'conv_rate_transform' failed");
    }

    #[test]
    fn test_overload_maps_to_resource_exhausted() {
        let err = TransformationServiceError::from(ExecutionError::Overloaded { queued: 8 });
        assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
        assert_eq!(Status::from(err).code(), Code::ResourceExhausted);
    }
}
