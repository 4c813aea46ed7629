//! Google Drive API v3 wire types.

use serde::{Deserialize, Serialize};

/// Drive file resource. Every field but the id is optional because partial
/// field masks are requested.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveFile {
    pub id: String,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub mime_type: String,

    /// Byte size as a decimal string (absent for folders)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_time: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_time: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub md5_checksum: Option<String>,

    #[serde(default)]
    pub parents: Vec<String>,

    #[serde(default)]
    pub shared: bool,

    #[serde(default)]
    pub trashed: bool,
}

impl DriveFile {
    pub fn size_bytes(&self) -> u64 {
        self.size
            .as_deref()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0)
    }
}

/// files.list response
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilesListResponse {
    #[serde(default)]
    pub files: Vec<DriveFile>,

    #[serde(default)]
    pub next_page_token: Option<String>,
}

/// about.get response
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AboutResponse {
    pub user: AboutUser,

    #[serde(default)]
    pub storage_quota: Option<DriveQuota>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AboutUser {
    #[serde(default)]
    pub permission_id: Option<String>,

    #[serde(default)]
    pub email_address: Option<String>,

    #[serde(default)]
    pub display_name: Option<String>,
}

/// Quota figures arrive as decimal strings; `limit` is absent for
/// unlimited accounts.
#[derive(Debug, Deserialize)]
pub struct DriveQuota {
    #[serde(default)]
    pub limit: Option<String>,

    #[serde(default)]
    pub usage: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ApiErrorEnvelope {
    pub error: ApiError,
}

#[derive(Debug, Deserialize)]
pub struct ApiError {
    #[serde(default)]
    pub message: String,

    #[serde(default)]
    pub errors: Vec<ApiErrorDetail>,
}

#[derive(Debug, Deserialize)]
pub struct ApiErrorDetail {
    #[serde(default)]
    pub reason: String,
}

impl ApiErrorEnvelope {
    pub fn is_rate_limited(&self) -> bool {
        self.error
            .errors
            .iter()
            .any(|e| e.reason == "rateLimitExceeded" || e.reason == "userRateLimitExceeded")
    }
}
