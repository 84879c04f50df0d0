//! Drive API client
//!
//! [`RemoteDrive`] is the capability the reconciliation engine works
//! against; [`FeishuClient`] is the concrete implementation. Integration
//! tests substitute an in-memory drive behind the same trait.

use async_trait::async_trait;
use log::{debug, info};
use reqwest::Method;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

use crate::auth::{FeishuAuth, TokenKind};
use crate::feishu_service::error::RemoteError;
use crate::feishu_service::feishu_models::{
    ApiResponse, CreateFolderData, ListFilesData, RemoteItem, RootMetaData, UploadAllData,
    UploadResult,
};
use crate::feishu_service::http_client::HttpClient;

/// Page size for folder listings.
const LIST_PAGE_SIZE: u32 = 200;

/// Drive operations the engine depends on.
#[async_trait]
pub trait RemoteDrive: Send + Sync {
    /// Resolve the managed root folder ("my files" when none is configured).
    async fn resolve_root(&self) -> Result<String, RemoteError>;

    /// All children of a folder, pagination handled internally.
    async fn list_children(&self, folder_token: &str) -> Result<Vec<RemoteItem>, RemoteError>;

    async fn create_folder(&self, parent_token: &str, name: &str) -> Result<String, RemoteError>;

    /// Full-file upload of a local path into a folder.
    async fn upload(
        &self,
        parent_token: &str,
        name: &str,
        local_path: &Path,
    ) -> Result<UploadResult, RemoteError>;

    /// Stream a file's bytes into `dest_path`. The caller owns atomicity:
    /// it passes a temp path and renames into place itself.
    async fn download(&self, file_token: &str, dest_path: &Path) -> Result<(), RemoteError>;

    async fn rename(&self, file_token: &str, new_name: &str) -> Result<(), RemoteError>;

    async fn move_item(
        &self,
        file_token: &str,
        kind: &str,
        new_parent_token: &str,
    ) -> Result<(), RemoteError>;

    async fn hard_delete(&self, file_token: &str, kind: &str) -> Result<(), RemoteError>;
}

/// Feishu Drive API client
pub struct FeishuClient {
    http_client: HttpClient,
    auth: Arc<FeishuAuth>,
    explicit_root: String,
}

impl FeishuClient {
    pub fn new(auth: Arc<FeishuAuth>, timeout_sec: u64, explicit_root: String) -> Self {
        let timeout = if timeout_sec == 0 { 30 } else { timeout_sec };
        Self {
            http_client: HttpClient::new(Duration::from_secs(timeout)),
            auth,
            explicit_root,
        }
    }

    /// Authorization header with a valid token, user credential first.
    async fn auth_header(&self) -> Result<String, RemoteError> {
        let (token, _kind) = self
            .auth
            .get_access_token(&[TokenKind::User, TokenKind::Tenant])
            .await?;
        Ok(format!("Bearer {}", token))
    }

    /// Unwrap the `{code, msg, data}` envelope.
    fn check_data<T>(response: ApiResponse<T>) -> Result<T, RemoteError> {
        if response.code != 0 {
            return Err(RemoteError::from_api_code(response.code, &response.msg));
        }
        response
            .data
            .ok_or_else(|| RemoteError::Permanent("response carried no data".to_string()))
    }

    /// Check only the envelope code, for endpoints that return empty data.
    fn check_code<T>(response: &ApiResponse<T>) -> Result<(), RemoteError> {
        if response.code != 0 {
            return Err(RemoteError::from_api_code(response.code, &response.msg));
        }
        Ok(())
    }

    async fn list_page(
        &self,
        folder_token: &str,
        page_token: Option<&str>,
    ) -> Result<ListFilesData, RemoteError> {
        let auth_header = self.auth_header().await?;
        let page_size = LIST_PAGE_SIZE.to_string();
        let mut query: Vec<(&str, &str)> = vec![("page_size", page_size.as_str())];
        if !folder_token.is_empty() {
            query.push(("folder_token", folder_token));
        }
        if let Some(token) = page_token {
            query.push(("page_token", token));
        }

        let response: ApiResponse<ListFilesData> = self
            .http_client
            .get("/drive/v1/files", &query, &auth_header)
            .await?;
        Self::check_data(response)
    }
}

#[async_trait]
impl RemoteDrive for FeishuClient {
    async fn resolve_root(&self) -> Result<String, RemoteError> {
        if !self.explicit_root.is_empty() {
            return Ok(self.explicit_root.clone());
        }
        let auth_header = self.auth_header().await?;
        let response: ApiResponse<RootMetaData> = self
            .http_client
            .get("/drive/explorer/v2/root_folder/meta", &[], &auth_header)
            .await?;
        let data = Self::check_data(response)?;
        if data.token.is_empty() {
            return Err(RemoteError::Permanent("root folder token missing".to_string()));
        }
        Ok(data.token)
    }

    async fn list_children(&self, folder_token: &str) -> Result<Vec<RemoteItem>, RemoteError> {
        let mut items = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let page = self.list_page(folder_token, page_token.as_deref()).await?;
            items.extend(
                page.files
                    .into_iter()
                    .filter_map(|raw| raw.into_remote_item(folder_token)),
            );
            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }

        debug!("listed {} children of {}", items.len(), folder_token);
        Ok(items)
    }

    async fn create_folder(&self, parent_token: &str, name: &str) -> Result<String, RemoteError> {
        let auth_header = self.auth_header().await?;
        let body = serde_json::json!({
            "name": name,
            "folder_token": parent_token,
        });
        let response: ApiResponse<CreateFolderData> = self
            .http_client
            .post("/drive/v1/files/create_folder", &body, &auth_header)
            .await?;
        let data = Self::check_data(response)?;
        let token = data
            .token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| RemoteError::Permanent("create_folder returned no token".to_string()))?;
        info!("created remote folder {} ({})", name, token);
        Ok(token)
    }

    async fn upload(
        &self,
        parent_token: &str,
        name: &str,
        local_path: &Path,
    ) -> Result<UploadResult, RemoteError> {
        let auth_header = self.auth_header().await?;
        let bytes = tokio::fs::read(local_path).await.map_err(|e| {
            RemoteError::Permanent(format!("cannot read {}: {}", local_path.display(), e))
        })?;
        let size = bytes.len();

        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(name.to_string())
            .mime_str("application/octet-stream")
            .map_err(|e| RemoteError::Permanent(e.to_string()))?;
        let form = reqwest::multipart::Form::new()
            .text("file_name", name.to_string())
            .text("parent_type", "explorer")
            .text("parent_node", parent_token.to_string())
            .text("size", size.to_string())
            .part("file", part);

        let response = self
            .http_client
            .request_builder(Method::POST, "/drive/v1/files/upload_all")
            .header("Authorization", &auth_header)
            .multipart(form)
            .send()
            .await
            .map_err(RemoteError::from_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(RemoteError::from_status(status, &text));
        }
        let envelope: ApiResponse<UploadAllData> = response
            .json()
            .await
            .map_err(|e| RemoteError::Permanent(format!("invalid upload response: {}", e)))?;
        let data = Self::check_data(envelope)?;

        let file_token = data
            .file_token
            .or(data.token)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| RemoteError::Permanent("upload returned no file token".to_string()))?;
        let revision_id = data.revision_id.map(|v| match v {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        });

        info!("uploaded {} -> {}", name, file_token);
        Ok(UploadResult {
            file_token,
            revision_id,
        })
    }

    async fn download(&self, file_token: &str, dest_path: &Path) -> Result<(), RemoteError> {
        let auth_header = self.auth_header().await?;
        let url = format!("/drive/v1/files/{}/download", file_token);

        let mut response = self
            .http_client
            .request_builder(Method::GET, &url)
            .header("Authorization", &auth_header)
            .send()
            .await
            .map_err(RemoteError::from_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            return Err(RemoteError::from_status(status, "download"));
        }

        if let Some(parent) = dest_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| RemoteError::Permanent(format!("mkdir failed: {}", e)))?;
        }
        let mut file = tokio::fs::File::create(dest_path)
            .await
            .map_err(|e| RemoteError::Permanent(format!("create failed: {}", e)))?;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(RemoteError::from_reqwest)?
        {
            file.write_all(&chunk)
                .await
                .map_err(|e| RemoteError::Permanent(format!("write failed: {}", e)))?;
        }
        file.flush()
            .await
            .map_err(|e| RemoteError::Permanent(format!("flush failed: {}", e)))?;

        debug!("downloaded {} -> {}", file_token, dest_path.display());
        Ok(())
    }

    async fn rename(&self, file_token: &str, new_name: &str) -> Result<(), RemoteError> {
        let auth_header = self.auth_header().await?;
        let url = format!("/drive/v1/files/{}", file_token);
        let body = serde_json::json!({ "name": new_name });

        let response = self
            .http_client
            .request_builder(Method::PATCH, &url)
            .header("Authorization", &auth_header)
            .json(&body)
            .send()
            .await
            .map_err(RemoteError::from_reqwest)?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(RemoteError::from_status(status, &text));
        }
        // Some gateways answer an empty or boolean body on success.
        let trimmed = text.trim();
        if trimmed.is_empty() || trimmed == "true" || trimmed == "null" {
            return Ok(());
        }
        let envelope: ApiResponse<serde_json::Value> = serde_json::from_str(trimmed)
            .map_err(|e| RemoteError::Permanent(format!("invalid rename response: {}", e)))?;
        if envelope.code != 0 {
            return Err(RemoteError::from_api_code(envelope.code, &envelope.msg));
        }
        Ok(())
    }

    async fn move_item(
        &self,
        file_token: &str,
        kind: &str,
        new_parent_token: &str,
    ) -> Result<(), RemoteError> {
        let auth_header = self.auth_header().await?;
        let url = format!("/drive/v1/files/{}/move", file_token);
        let kind = if kind.is_empty() { "file" } else { kind };
        let body = serde_json::json!({
            "type": kind,
            "folder_token": new_parent_token,
        });

        let response: ApiResponse<serde_json::Value> =
            self.http_client.post(&url, &body, &auth_header).await?;
        Self::check_code(&response)
    }

    async fn hard_delete(&self, file_token: &str, kind: &str) -> Result<(), RemoteError> {
        let auth_header = self.auth_header().await?;
        let url = format!("/drive/v1/files/{}", file_token);
        let kind = if kind.is_empty() { "file" } else { kind };

        let response: ApiResponse<serde_json::Value> = self
            .http_client
            .delete(&url, &[("type", kind)], &auth_header)
            .await?;
        // A delete answering "already gone" surfaces unchanged; callers
        // that treat it as benign match on the Gone variant.
        Self::check_code(&response)
    }
}
