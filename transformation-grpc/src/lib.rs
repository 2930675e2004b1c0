//! # Transformation gRPC
//!
//! Serves registered on-demand feature transformations over gRPC. A client
//! names a transformation and sends a batch of rows as Arrow IPC; the server
//! runs the transformation on a bounded worker pool and answers with the
//! derived columns, in the same format.
//!
//! ```text
//! TransformFeatures ─► codec::decode ─► registry.lookup ─► pool.run ─► codec::encode
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use transformation_grpc::{builtin_registry, server, ServerConfig, TransformationServer};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig::from_env()?;
//!     let registry = builtin_registry(config.project.clone())?;
//!
//!     TransformationServer::new(config, registry)?
//!         .serve_with_shutdown(server::shutdown_signal())
//!         .await?;
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod config;
pub mod error;
pub mod info;
pub mod metrics;
pub mod pool;
pub mod registry;
pub mod server;
pub mod service;
pub mod telemetry;
pub mod transformation;

// Generated proto code
pub mod proto {
    tonic::include_proto!("transformation.v1");
}

/// Encoded descriptor set for gRPC reflection.
pub const FILE_DESCRIPTOR_SET: &[u8] = tonic::include_file_descriptor_set!("transformation_descriptor");

pub use config::{LogConfig, LogFormat, ServerConfig};
pub use error::{
    CodecError, ErrorKind, ExecutionError, RegistryError, Result, ServerError, TransformError,
    TransformationServiceError,
};
pub use info::ServiceInfo;
pub use pool::{ExecutionOptions, ExecutionPool, PoolConfig};
pub use registry::{builtin_registry, SharedRegistry, TransformationRegistry};
pub use server::TransformationServer;
pub use service::TransformationGrpcService;
pub use transformation::{conv_rate_transform, FnTransformation, Transformation};
