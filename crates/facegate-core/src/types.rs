use chrono::{DateTime, Utc};
use facegate_hw::EncodedImage;
use serde::{Deserialize, Serialize};

/// An enrolled user. Immutable once created; only deletable.
///
/// Field names serialize in camelCase (`employeeId`, `imageData`,
/// `registeredAt`) to keep the stored layout stable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    pub id: String,
    pub name: String,
    pub employee_id: String,
    /// Enrollment photo as a JPEG data URI.
    pub image_data: EncodedImage,
    pub registered_at: DateTime<Utc>,
}

/// Outcome of one simulated recognition pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    pub success: bool,
    /// In [0.7, 1.0) on success, [0.2, 0.7) otherwise.
    pub confidence: f64,
    /// Matched user; only set on success against a non-empty registry.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub user: Option<UserRecord>,
}

impl DetectionResult {
    /// Confidence as a percentage with one decimal, e.g. `"87.5%"`.
    pub fn confidence_percent(&self) -> String {
        format!("{:.1}%", self.confidence * 100.0)
    }
}
