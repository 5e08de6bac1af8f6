//! Engine errors. Layer timeouts and layer failures are recovered inside
//! the orchestrator (empty result + counter); only validation failures and
//! invariant violations reach the adapter.

use serde::Serialize;
use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Structurally invalid request: both identifier and URI empty, empty
    /// `newName`, non-positive budgets.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A request arrived before `initialize()` completed.
    #[error("engine is not initialized")]
    NotInitialized,

    /// A layer exceeded its wall-clock budget. Recovered locally — the
    /// orchestrator treats it as an empty result.
    #[error("{layer} exceeded its {budget_ms} ms budget")]
    LayerTimeout { layer: &'static str, budget_ms: u64 },

    /// The underlying engine failed (binary missing, spawn refused, parse
    /// error). Recovered when another strategy can cover.
    #[error("{layer} failed: {message}")]
    LayerError { layer: &'static str, message: String },

    /// Invariant violation. Always surfaced.
    #[error("internal invariant violated: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn layer_error(layer: &'static str, message: impl Into<String>) -> Self {
        EngineError::LayerError { layer, message: message.into() }
    }

    /// Stable machine-readable code for the wire body.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::InvalidRequest(_) => "InvalidRequest",
            EngineError::NotInitialized => "NotInitialized",
            EngineError::LayerTimeout { .. } => "LayerTimeout",
            EngineError::LayerError { .. } => "LayerError",
            EngineError::Internal(_) => "Internal",
        }
    }

    /// Which layer produced the error, when one did.
    pub fn layer(&self) -> Option<&'static str> {
        match self {
            EngineError::LayerTimeout { layer, .. } | EngineError::LayerError { layer, .. } => {
                Some(layer)
            }
            _ => None,
        }
    }

    /// True for errors the orchestrator absorbs into an empty result.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, EngineError::LayerTimeout { .. } | EngineError::LayerError { .. })
    }

    /// Structured error body for adapters.
    pub fn to_body(&self, request_id: &str) -> ErrorBody {
        ErrorBody {
            code: self.code(),
            message: self.to_string(),
            request_id: request_id.to_string(),
            layer: self.layer(),
        }
    }
}

/// Wire shape of a surfaced failure: `{code, message, requestId, layer?}`.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
    #[serde(rename = "requestId")]
    pub request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub layer: Option<&'static str>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_and_layers() {
        let e = EngineError::LayerTimeout { layer: "layer1", budget_ms: 1200 };
        assert_eq!(e.code(), "LayerTimeout");
        assert_eq!(e.layer(), Some("layer1"));
        assert!(e.is_recoverable());

        let e = EngineError::InvalidRequest("x".into());
        assert_eq!(e.code(), "InvalidRequest");
        assert_eq!(e.layer(), None);
        assert!(!e.is_recoverable());
    }

    #[test]
    fn test_body_shape() {
        let e = EngineError::layer_error("layer2", "parser crashed");
        let body = e.to_body("req-1");
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["code"], "LayerError");
        assert_eq!(json["requestId"], "req-1");
        assert_eq!(json["layer"], "layer2");
    }
}
