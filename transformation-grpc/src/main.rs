use anyhow::Context;
use tracing::info;

use transformation_grpc::{
    builtin_registry, server, telemetry, ServerConfig, TransformationServer,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // TRANSFORMATION_SERVER_CONFIG points at a JSON file; env vars overlay it
    let config = match std::env::var("TRANSFORMATION_SERVER_CONFIG") {
        Ok(path) => ServerConfig::from_json_file(&path)
            .with_context(|| format!("loading config from {path}"))?
            .with_overrides(|key| std::env::var(key).ok())?,
        Err(_) => ServerConfig::from_env()?,
    };

    telemetry::init_tracing(&config.log).context("installing tracing subscriber")?;

    let registry = builtin_registry(config.project.clone())?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        transformations = registry.len(),
        "Starting transformation server"
    );

    TransformationServer::new(config, registry)?
        .serve_with_shutdown(server::shutdown_signal())
        .await?;
    Ok(())
}
