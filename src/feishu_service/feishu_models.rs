//! Wire models for the Drive API
//!
//! The listing endpoint is defensive about types: the API has returned both
//! string and integer sizes and timestamps in the wild, so raw items coerce
//! those fields instead of trusting one shape.

use serde::{Deserialize, Serialize};

/// Item kind string used when the API omits one.
pub const KIND_FILE: &str = "file";

/// Item kind string for folders.
pub const KIND_FOLDER: &str = "folder";

/// A single child returned by a folder listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteItem {
    pub token: String,
    pub name: String,
    /// Drive item type: "file", "folder", or a document kind like "docx".
    pub kind: String,
    pub size: u64,
    /// Modification timestamp as the API renders it (epoch-ms or ISO-8601).
    pub modified_time: String,
    pub parent_token: String,
}

impl RemoteItem {
    pub fn is_folder(&self) -> bool {
        self.kind == KIND_FOLDER
    }
}

/// Result of a full-file upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadResult {
    pub file_token: String,
    pub revision_id: Option<String>,
}

/// Standard Drive API envelope: `{code, msg, data}`.
#[derive(Debug, Deserialize)]
pub struct ApiResponse<T> {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub msg: String,
    pub data: Option<T>,
}

/// Raw listing item before field coercion.
#[derive(Debug, Clone, Deserialize)]
pub struct RawFileItem {
    pub token: Option<String>,
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub size: Option<serde_json::Value>,
    pub modified_time: Option<serde_json::Value>,
    pub modified_at: Option<serde_json::Value>,
}

impl RawFileItem {
    /// Convert into a [`RemoteItem`], dropping entries without a token.
    pub fn into_remote_item(self, parent_token: &str) -> Option<RemoteItem> {
        let token = self.token.filter(|t| !t.is_empty())?;
        let name = self.name.unwrap_or_else(|| token.clone());
        let kind = self.kind.unwrap_or_else(|| KIND_FILE.to_string());
        let size = self.size.as_ref().map(coerce_u64).unwrap_or(0);
        let modified_time = self
            .modified_time
            .as_ref()
            .or(self.modified_at.as_ref())
            .map(coerce_string)
            .unwrap_or_default();
        Some(RemoteItem {
            token,
            name,
            kind,
            size,
            modified_time,
            parent_token: parent_token.to_string(),
        })
    }
}

fn coerce_u64(value: &serde_json::Value) -> u64 {
    match value {
        serde_json::Value::Number(n) => n.as_u64().unwrap_or(0),
        serde_json::Value::String(s) => s.parse().unwrap_or(0),
        _ => 0,
    }
}

fn coerce_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Number(n) => n.to_string(),
        _ => String::new(),
    }
}

/// `data` of the paginated file listing.
#[derive(Debug, Deserialize)]
pub struct ListFilesData {
    #[serde(default)]
    pub files: Vec<RawFileItem>,
    pub next_page_token: Option<String>,
    #[serde(default)]
    pub has_more: bool,
}

/// `data` of the root-folder meta endpoint.
#[derive(Debug, Deserialize)]
pub struct RootMetaData {
    pub token: String,
}

/// `data` of the create-folder endpoint.
#[derive(Debug, Deserialize)]
pub struct CreateFolderData {
    pub token: Option<String>,
}

/// `data` of the upload_all endpoint.
#[derive(Debug, Deserialize)]
pub struct UploadAllData {
    pub file_token: Option<String>,
    pub token: Option<String>,
    pub revision_id: Option<serde_json::Value>,
}
