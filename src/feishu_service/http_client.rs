use log::debug;
use reqwest::{Client, Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;

use crate::feishu_service::error::RemoteError;

const FEISHU_API_BASE: &str = "https://open.feishu.cn/open-apis";

/// Shared HTTP client for Drive API operations
#[derive(Clone)]
pub struct HttpClient {
    client: Client,
}

impl HttpClient {
    /// Build the shared client with a per-request timeout.
    pub fn new(timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { client }
    }

    /// Get full URL by prepending the API base if needed
    pub fn get_full_url(&self, url: &str) -> String {
        if url.starts_with("http") {
            url.to_string()
        } else {
            format!("{}{}", FEISHU_API_BASE, url)
        }
    }

    /// Make a GET request with authorization header
    pub async fn get<T>(
        &self,
        url: &str,
        query: &[(&str, &str)],
        auth_header: &str,
    ) -> Result<T, RemoteError>
    where
        T: DeserializeOwned,
    {
        let url = self.get_full_url(url);
        debug!("GET {}", url);

        let response = self
            .client
            .get(&url)
            .query(query)
            .header("Authorization", auth_header)
            .send()
            .await
            .map_err(RemoteError::from_reqwest)?;

        Self::json_body(response).await
    }

    /// Make a POST request with a JSON body and authorization header
    pub async fn post<T, B>(&self, url: &str, body: &B, auth_header: &str) -> Result<T, RemoteError>
    where
        T: DeserializeOwned,
        B: Serialize,
    {
        let url = self.get_full_url(url);
        debug!("POST {}", url);

        let response = self
            .client
            .post(&url)
            .header("Authorization", auth_header)
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(RemoteError::from_reqwest)?;

        Self::json_body(response).await
    }

    /// Make a DELETE request with authorization header
    pub async fn delete<T>(
        &self,
        url: &str,
        query: &[(&str, &str)],
        auth_header: &str,
    ) -> Result<T, RemoteError>
    where
        T: DeserializeOwned,
    {
        let url = self.get_full_url(url);
        debug!("DELETE {}", url);

        let response = self
            .client
            .delete(&url)
            .query(query)
            .header("Authorization", auth_header)
            .send()
            .await
            .map_err(RemoteError::from_reqwest)?;

        Self::json_body(response).await
    }

    /// Get a request builder for requests that need custom handling
    /// (streaming downloads, multipart uploads, non-JSON responses).
    pub fn request_builder(&self, method: Method, url: &str) -> RequestBuilder {
        self.client.request(method, self.get_full_url(url))
    }

    /// Map a non-success status, then deserialize the body.
    async fn json_body<T>(response: reqwest::Response) -> Result<T, RemoteError>
    where
        T: DeserializeOwned,
    {
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(RemoteError::from_status(status, &text));
        }
        response
            .json::<T>()
            .await
            .map_err(|e| RemoteError::Permanent(format!("invalid response body: {}", e)))
    }
}
