//! Wire shapes exchanged between the capture side and the application.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::CapturedRecord;

/// Storage key carrying relay payloads into an application context.
pub const SENTINEL_KEY: &str = "extensionJobData";
pub const RESUMES_KEY: &str = "resumes";
pub const APPLICATIONS_KEY: &str = "jobApplications";

pub const APPLICATIONS_ROUTE: &str = "/api/applications";
pub const RESUMES_ROUTE: &str = "/api/resumes";

/// Message posted to an application tab.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Envelope {
    #[serde(rename = "JOB_APPLICATION_DATA", rename_all = "camelCase")]
    JobApplicationData { job_data: CapturedRecord },
}

impl Envelope {
    pub fn job_application(record: CapturedRecord) -> Self {
        Envelope::JobApplicationData { job_data: record }
    }

    pub fn into_record(self) -> CapturedRecord {
        match self {
            Envelope::JobApplicationData { job_data } => job_data,
        }
    }
}

/// Request sent by the popup or extractor to the capture agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum CaptureRequest {
    #[serde(rename = "saveJobData", rename_all = "camelCase")]
    SaveJobData { job_data: CapturedRecord },
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CaptureResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Set when the record was rejected because it already exists.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub duplicate: bool,
}

impl CaptureResponse {
    pub fn delivered(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            ..Default::default()
        }
    }

    pub fn delivered_via_app() -> Self {
        Self {
            success: true,
            message: Some("delivered via app".to_string()),
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn duplicate(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            duplicate: true,
            ..Default::default()
        }
    }
}

/// Generic `{success, data|resumes, error}` body returned by the backend.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiResponse {
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub resumes: Option<Vec<Value>>,
    #[serde(default)]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_wire_format() {
        let envelope = Envelope::job_application(CapturedRecord::new("Acme", "Engineer"));
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["type"], "JOB_APPLICATION_DATA");
        assert_eq!(json["jobData"]["company"], "Acme");

        let back: Envelope = serde_json::from_value(json).unwrap();
        assert_eq!(back.into_record().position, "Engineer");
    }

    #[test]
    fn test_capture_request_parse() {
        let request: CaptureRequest = serde_json::from_value(json!({
            "action": "saveJobData",
            "jobData": {"company": "Acme", "position": "Engineer", "jobUrl": "https://x/1"}
        }))
        .unwrap();
        let CaptureRequest::SaveJobData { job_data } = request;
        assert_eq!(job_data.job_url.as_deref(), Some("https://x/1"));
    }

    #[test]
    fn test_unknown_action_rejected() {
        let result: Result<CaptureRequest, _> =
            serde_json::from_value(json!({"action": "deleteEverything", "jobData": {}}));
        assert!(result.is_err());
    }

    #[test]
    fn test_response_omits_empty_fields() {
        let json = serde_json::to_value(CaptureResponse::delivered_via_app()).unwrap();
        assert_eq!(json, json!({"success": true, "message": "delivered via app"}));

        let json = serde_json::to_value(CaptureResponse::duplicate("exists")).unwrap();
        assert_eq!(json["duplicate"], true);
        assert_eq!(json["success"], false);
    }
}
