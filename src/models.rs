use serde::Serialize;
use uuid::Uuid;

/// Top-1 classification of one uploaded image.
#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct ClassificationResult {
    pub class_name: String,
    pub confidence: f64,
}

#[derive(Debug, Serialize)]
pub struct PredictionResponse {
    pub prediction: ClassificationResult,
    pub filename: Option<String>,
    pub content_type: String,
    pub size_bytes: usize,
    pub request_id: Uuid,
}

#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
    Starting,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub model_loaded: bool,
    pub message: &'static str,
}

#[derive(Debug, Serialize)]
pub struct ServiceDescriptor {
    pub name: &'static str,
    pub version: &'static str,
    pub model_loaded: bool,
    pub message: &'static str,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub detail: String,
}
