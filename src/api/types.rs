//! API request and response types

use crate::catalog::FlowSummary;
use crate::controller::{InputSurface, Submission};
use crate::runtime::SessionSnapshot;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Start a session from a catalog flow or an inline document
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    #[serde(default)]
    pub flow_id: Option<String>,
    #[serde(default)]
    pub flow: Option<Value>,
    /// Merged over the document's own metadata
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Serialize)]
pub struct FlowListResponse {
    pub flows: Vec<FlowSummary>,
}

/// Snapshot plus what to draw for the current step
#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub snapshot: SessionSnapshot,
    pub surface: InputSurface,
}

#[derive(Debug, Serialize)]
pub struct EventResponse {
    pub submission: Submission,
    pub snapshot: SessionSnapshot,
}

/// Generic success response
#[derive(Debug, Serialize)]
pub struct SuccessResponse {
    pub success: bool,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self { error: error.into() }
    }
}
