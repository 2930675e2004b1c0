//! Server lifecycle: wiring, binding and serving until shutdown.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::server::Router;
use tonic::transport::Server;
use tracing::info;

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::info::ServiceInfo;
use crate::metrics::Metrics;
use crate::pool::ExecutionPool;
use crate::proto::transformation_service_server::TransformationServiceServer;
use crate::registry::{SharedRegistry, TransformationRegistry};
use crate::service::TransformationGrpcService;
use crate::FILE_DESCRIPTOR_SET;

pub struct TransformationServer {
    config: ServerConfig,
    service: TransformationGrpcService,
}

impl TransformationServer {
    /// Wire registry, pool, metrics and service info for `config`.
    pub fn new(config: ServerConfig, registry: TransformationRegistry) -> Result<Self, ServerError> {
        Self::with_service_info(config, registry, ServiceInfo::detect())
    }

    pub fn with_service_info(
        config: ServerConfig,
        registry: TransformationRegistry,
        info: ServiceInfo,
    ) -> Result<Self, ServerError> {
        config.validate()?;

        let pool = ExecutionPool::new(config.pool_config());
        let metrics = Arc::new(Metrics::new()?);
        let service = TransformationGrpcService::new(
            SharedRegistry::new(registry),
            pool,
            Arc::new(info),
            metrics,
        );

        Ok(Self { config, service })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> SharedRegistry {
        self.service.registry().clone()
    }

    pub fn pool(&self) -> ExecutionPool {
        self.service.pool().clone()
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(self.service.metrics())
    }

    pub fn service(&self) -> &TransformationGrpcService {
        &self.service
    }

    fn router(&self) -> Result<Router, ServerError> {
        let transformation = TransformationServiceServer::new(self.service.clone())
            .max_decoding_message_size(self.config.max_message_bytes)
            .max_encoding_message_size(self.config.max_message_bytes);

        let reflection = if self.config.reflection {
            Some(
                tonic_reflection::server::Builder::configure()
                    .register_encoded_file_descriptor_set(FILE_DESCRIPTOR_SET)
                    .build_v1()?,
            )
        } else {
            None
        };

        Ok(Server::builder()
            .add_service(transformation)
            .add_optional_service(reflection))
    }

    /// Bind the configured address and serve until `signal` resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()> + Send,
    {
        let addr = self.config.listen_addr()?;
        let listener = TcpListener::bind(addr).await?;
        self.serve_with_listener(listener, signal).await
    }

    /// Serve on an already bound listener until `signal` resolves.
    pub async fn serve_with_listener<F>(self, listener: TcpListener, signal: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()> + Send,
    {
        let local: SocketAddr = listener.local_addr()?;
        let router = self.router()?;
        let registry = self.service.registry().snapshot();

        info!(
            addr = %local,
            project = registry.project(),
            transformations = ?registry.names(),
            max_workers = self.config.max_workers,
            reflection = self.config.reflection,
            "Transformation server listening"
        );

        let result = router
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), signal)
            .await;

        self.service.pool().close();
        info!(addr = %local, "Transformation server stopped");
        result.map_err(ServerError::from)
    }
}

/// Resolves on Ctrl-C, or SIGTERM on Unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
