//! Service self-description for capability negotiation.

use crate::proto::{GetTransformationServiceInfoResponse, TransformationServiceType};

/// Immutable description of this server, computed once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    kind: TransformationServiceType,
    version: String,
    detail: String,
}

impl ServiceInfo {
    pub fn new(
        kind: TransformationServiceType,
        version: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            version: version.into(),
            detail: detail.into(),
        }
    }

    /// Describe the running binary: compiler and crate version.
    pub fn detect() -> Self {
        let version = env!("CARGO_PKG_VERSION");
        let rustc = option_env!("TRANSFORMATION_GRPC_RUSTC_VERSION").unwrap_or("rustc unknown");
        Self::new(
            TransformationServiceType::Rust,
            version,
            format!("Rust: {rustc}, {}: {version}", env!("CARGO_PKG_NAME")),
        )
    }

    pub fn kind(&self) -> TransformationServiceType {
        self.kind
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn detail(&self) -> &str {
        &self.detail
    }

    pub fn to_response(&self) -> GetTransformationServiceInfoResponse {
        GetTransformationServiceInfoResponse {
            version: self.version.clone(),
            r#type: self.kind as i32,
            transformation_service_type_details: self.detail.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect() {
        let info = ServiceInfo::detect();
        assert_eq!(info.kind(), TransformationServiceType::Rust);
        assert_eq!(info.version(), env!("CARGO_PKG_VERSION"));
        assert!(info.detail().starts_with("Rust: "));
        assert!(info.detail().contains("transformation-grpc"));
    }

    #[test]
    fn test_response_fields() {
        let info = ServiceInfo::new(TransformationServiceType::Custom, "1.2.3", "custom build");
        let response = info.to_response();
        assert_eq!(response.version, "1.2.3");
        assert_eq!(response.r#type, TransformationServiceType::Custom as i32);
        assert_eq!(response.transformation_service_type_details, "custom build");
    }
}
