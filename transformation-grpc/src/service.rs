//! gRPC request router for the transformation service.
//!
//! `TransformFeatures` runs a strict per-request pipeline:
//! decode → resolve → execute → encode. Any step can short-circuit to a
//! typed [`TransformationServiceError`], which maps to exactly one status
//! class (see [`ErrorKind`]).

use std::sync::Arc;
use std::time::Instant;

use tonic::{Request, Response, Status};
use tracing::{debug, error, info_span, warn, Instrument};
use uuid::Uuid;

use crate::codec;
use crate::error::{ErrorKind, Result, TransformationServiceError};
use crate::info::ServiceInfo;
use crate::metrics::{Metrics, UNREGISTERED};
use crate::pool::{ExecutionOptions, ExecutionPool};
use crate::proto::transformation_service_server::TransformationService;
use crate::proto::value_type::Value;
use crate::proto::{
    GetTransformationServiceInfoRequest, GetTransformationServiceInfoResponse,
    TransformFeaturesRequest, TransformFeaturesResponse, ValueType,
};
use crate::registry::{SharedRegistry, TransformationRegistry};

/// Stateless per request; shared state is the registry snapshot, the pool
/// and the immutable service info.
#[derive(Clone)]
pub struct TransformationGrpcService {
    registry: SharedRegistry,
    pool: ExecutionPool,
    info: Arc<ServiceInfo>,
    metrics: Arc<Metrics>,
}

impl TransformationGrpcService {
    pub fn new(
        registry: SharedRegistry,
        pool: ExecutionPool,
        info: Arc<ServiceInfo>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            registry,
            pool,
            info,
            metrics,
        }
    }

    pub fn registry(&self) -> &SharedRegistry {
        &self.registry
    }

    pub fn pool(&self) -> &ExecutionPool {
        &self.pool
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn service_info(&self) -> &ServiceInfo {
        &self.info
    }

    /// Run one transformation request end to end.
    pub async fn transform(&self, request: TransformFeaturesRequest) -> Result<TransformFeaturesResponse> {
        let registry = self.registry.snapshot();
        self.transform_with(&registry, request).await
    }

    /// Run a request against one registry snapshot, held for its whole life.
    async fn transform_with(
        &self,
        registry: &TransformationRegistry,
        request: TransformFeaturesRequest,
    ) -> Result<TransformFeaturesResponse> {
        let TransformFeaturesRequest {
            on_demand_feature_view_name: name,
            project,
            transformation_input,
            full_output,
            full_feature_names,
        } = request;

        // Decoded
        let Value::ArrowValue(bytes) = transformation_input
            .and_then(|input| input.value)
            .ok_or(TransformationServiceError::MissingInput)?;
        let input = codec::decode(&bytes)?;
        drop(bytes);
        debug!(
            rows = input.num_rows(),
            columns = input.num_columns(),
            "Input decoded"
        );

        // Resolved
        let transformation = registry.lookup(&project, &name)?;

        // Executed
        let options = ExecutionOptions {
            full_output,
            full_feature_names,
        };
        let output = self.pool.run(transformation, input, options).await?;

        // Encoded
        let arrow_value = codec::encode(&output)?;
        debug!(
            rows = output.num_rows(),
            columns = output.num_columns(),
            bytes = arrow_value.len(),
            "Output encoded"
        );

        Ok(TransformFeaturesResponse {
            transformation_output: Some(ValueType {
                value: Some(Value::ArrowValue(arrow_value)),
            }),
        })
    }
}

#[tonic::async_trait]
impl TransformationService for TransformationGrpcService {
    async fn get_transformation_service_info(
        &self,
        _request: Request<GetTransformationServiceInfoRequest>,
    ) -> std::result::Result<Response<GetTransformationServiceInfoResponse>, Status> {
        Ok(Response::new(self.info.to_response()))
    }

    async fn transform_features(
        &self,
        request: Request<TransformFeaturesRequest>,
    ) -> std::result::Result<Response<TransformFeaturesResponse>, Status> {
        let request = request.into_inner();
        let request_id = Uuid::new_v4();
        let name = request.on_demand_feature_view_name.clone();
        let span = info_span!(
            "transform_features",
            %request_id,
            transformation = %name,
            project = %request.project,
        );

        async move {
            let started = Instant::now();
            let registry = self.registry.snapshot();
            let result = self.transform_with(&registry, request).await;
            let elapsed = started.elapsed();
            let label = if registry.lookup("", &name).is_ok() {
                name.as_str()
            } else {
                UNREGISTERED
            };

            match result {
                Ok(response) => {
                    self.metrics.observe(label, "ok", elapsed);
                    debug!(elapsed_ms = elapsed.as_millis() as u64, "Request served");
                    Ok(Response::new(response))
                }
                Err(err) => {
                    let kind = err.kind();
                    self.metrics.observe(label, kind.as_str(), elapsed);

                    match kind {
                        ErrorKind::Internal => error!(error = %err, "Request failed"),
                        ErrorKind::InvalidArgument | ErrorKind::ResourceExhausted => {
                            warn!(error = %err, "Request rejected")
                        }
                    }
                    Err(Status::from(err))
                }
            }
        }
        .instrument(span)
        .await
    }
}
