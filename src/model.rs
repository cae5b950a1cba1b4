use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of an upload task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Queued,
    Uploading,
    Completed,
    Failed,
    Cancelled,
}

impl UploadStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            UploadStatus::Completed | UploadStatus::Failed | UploadStatus::Cancelled
        )
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            UploadStatus::Queued => "queued",
            UploadStatus::Uploading => "uploading",
            UploadStatus::Completed => "completed",
            UploadStatus::Failed => "failed",
            UploadStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of a task's progress, also used as the progress event payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadProgress {
    pub upload_id: String,
    pub bytes_uploaded: u64,
    pub total_bytes: u64,
    pub status: UploadStatus,
}

impl UploadProgress {
    /// Whole percent complete, clamped to 0..=100. An empty file counts as done.
    #[must_use]
    pub fn percent(&self) -> u8 {
        if self.total_bytes == 0 {
            return 100;
        }
        let percent = self.bytes_uploaded.min(self.total_bytes) * 100 / self.total_bytes;
        u8::try_from(percent).unwrap_or(100)
    }

    /// Converts into the untyped map handed to hosts.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_value(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Terminal outcome of a task. Exactly one is delivered per submitted upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResult {
    pub upload_id: String,
    pub status: UploadStatus,
    pub status_code: Option<u16>,
    pub response: Option<String>,
    pub error: Option<String>,
}

impl UploadResult {
    #[must_use]
    pub fn completed(upload_id: &str, status_code: u16, response: String) -> Self {
        Self {
            upload_id: upload_id.to_string(),
            status: UploadStatus::Completed,
            status_code: Some(status_code),
            response: Some(response),
            error: None,
        }
    }

    #[must_use]
    pub fn failed(upload_id: &str, error: &Error) -> Self {
        let response = match error {
            Error::HttpError { response, .. } => response.clone(),
            _ => None,
        };
        Self {
            upload_id: upload_id.to_string(),
            status: UploadStatus::Failed,
            status_code: error.status_code(),
            response,
            error: Some(error.to_string()),
        }
    }

    #[must_use]
    pub fn cancelled(upload_id: &str) -> Self {
        Self {
            upload_id: upload_id.to_string(),
            status: UploadStatus::Cancelled,
            status_code: None,
            response: None,
            error: None,
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == UploadStatus::Completed
    }

    /// Converts into the untyped map handed to hosts.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_value(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_terminal_statuses() {
        assert!(!UploadStatus::Queued.is_terminal());
        assert!(!UploadStatus::Uploading.is_terminal());
        assert!(UploadStatus::Completed.is_terminal());
        assert!(UploadStatus::Failed.is_terminal());
        assert!(UploadStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_progress_value_uses_host_keys() {
        let progress = UploadProgress {
            upload_id: "photo-1".to_string(),
            bytes_uploaded: 512,
            total_bytes: 1024,
            status: UploadStatus::Uploading,
        };

        let value = progress.to_value().unwrap();
        assert_eq!(
            value,
            json!({
                "uploadId": "photo-1",
                "bytesUploaded": 512,
                "totalBytes": 1024,
                "status": "uploading"
            })
        );
        assert_eq!(progress.percent(), 50);
    }

    #[test]
    fn test_percent_of_empty_file() {
        let progress = UploadProgress {
            upload_id: "empty".to_string(),
            bytes_uploaded: 0,
            total_bytes: 0,
            status: UploadStatus::Uploading,
        };
        assert_eq!(progress.percent(), 100);
    }

    #[test]
    fn test_failed_result_from_http_error() {
        let err = Error::HttpError {
            status: 500,
            message: "Internal Server Error".to_string(),
            response: Some("boom".to_string()),
        };
        let result = UploadResult::failed("doc-7", &err);

        assert_eq!(result.status, UploadStatus::Failed);
        assert_eq!(result.status_code, Some(500));
        assert_eq!(result.response.as_deref(), Some("boom"));
        assert!(result.error.unwrap().starts_with("HTTP 500"));
    }

    #[test]
    fn test_cancelled_result_value() {
        let value = UploadResult::cancelled("doc-8").to_value().unwrap();
        assert_eq!(value["status"], "cancelled");
        assert!(value["statusCode"].is_null());
        assert!(value["error"].is_null());
    }
}
