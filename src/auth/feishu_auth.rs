//! Feishu authentication manager
//!
//! Acquires bearer credentials with a configurable priority: the persisted
//! user token first, the tenant token as fallback. User tokens are refreshed
//! in place when they near expiry and the refresh result is written back to
//! the token file. Also carries the OAuth plumbing (authorize URL, code
//! exchange, one-shot state value) used by the external console.

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use log::{info, warn};
use rand::Rng;
use reqwest::Client;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use url::Url;

use crate::auth::token_store::{TokenFile, TokenStore};
use crate::config::AuthConfig;
use crate::feishu_service::error::RemoteError;

const FEISHU_API_BASE: &str = "https://open.feishu.cn/open-apis";

/// OAuth authorize page.
const OAUTH_AUTHORIZE_URL: &str = "https://open.feishu.cn/open-apis/authen/v1/index";

/// Refresh user tokens this many seconds before they expire.
const TOKEN_REFRESH_BUFFER_SECS: u64 = 300;

/// Length of the random OAuth state value before encoding.
const OAUTH_STATE_BYTES: usize = 32;

/// Which credential a token came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    User,
    Tenant,
}

impl TokenKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenKind::User => "user_access_token",
            TokenKind::Tenant => "tenant_access_token",
        }
    }
}

#[derive(Debug, Deserialize)]
struct UserTokenEnvelope {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    msg: String,
    data: Option<UserTokenData>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct UserTokenData {
    access_token: String,
    refresh_token: String,
    token_type: String,
    expires_in: u64,
    refresh_expires_in: u64,
}

#[derive(Debug, Deserialize)]
struct TenantTokenEnvelope {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    msg: String,
    tenant_access_token: Option<String>,
}

/// Feishu authentication manager
pub struct FeishuAuth {
    app_id: String,
    app_secret: String,
    token_store: TokenStore,
    auth_state_path: PathBuf,
    client: Client,
}

impl FeishuAuth {
    pub fn new(auth: &AuthConfig, auth_state_path: PathBuf) -> Self {
        let timeout = if auth.timeout_sec == 0 { 30 } else { auth.timeout_sec };
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            app_id: auth.app_id.clone(),
            app_secret: auth.app_secret.clone(),
            token_store: TokenStore::new(auth.user_token_file.clone()),
            auth_state_path,
            client,
        }
    }

    pub fn token_store(&self) -> &TokenStore {
        &self.token_store
    }

    /// Acquire a bearer token, trying each mode in priority order.
    pub async fn get_access_token(
        &self,
        priority: &[TokenKind],
    ) -> Result<(String, TokenKind), RemoteError> {
        for mode in priority {
            match mode {
                TokenKind::User => {
                    if let Some(token) = self.user_access_token().await {
                        return Ok((token, TokenKind::User));
                    }
                }
                TokenKind::Tenant => {
                    if let Some(token) = self.tenant_access_token().await {
                        return Ok((token, TokenKind::Tenant));
                    }
                }
            }
        }
        Err(RemoteError::AuthUnavailable)
    }

    /// Valid user access token, refreshing in place when near expiry.
    async fn user_access_token(&self) -> Option<String> {
        let tokens = self.token_store.load().ok().flatten()?;
        if tokens.access_token.is_empty() {
            return None;
        }

        if tokens.created_at > 0 && now_ms() < token_expire_at_ms(&tokens) {
            return Some(tokens.access_token);
        }

        match self.refresh_user_tokens(&tokens.refresh_token).await {
            Ok(refreshed) => Some(refreshed.access_token),
            Err(e) => {
                warn!("user token refresh failed: {}", e);
                None
            }
        }
    }

    async fn tenant_access_token(&self) -> Option<String> {
        if self.app_id.is_empty() || self.app_secret.is_empty() {
            return None;
        }
        let body = serde_json::json!({
            "app_id": self.app_id,
            "app_secret": self.app_secret,
        });
        let response = self
            .client
            .post(format!("{}/auth/v3/tenant_access_token/internal", FEISHU_API_BASE))
            .json(&body)
            .send()
            .await
            .ok()?;
        let envelope: TenantTokenEnvelope = response.json().await.ok()?;
        if envelope.code != 0 {
            warn!("tenant token request failed: {}", envelope.msg);
            return None;
        }
        envelope.tenant_access_token.filter(|t| !t.is_empty())
    }

    /// Exchange the refresh token for a new pair and persist it.
    async fn refresh_user_tokens(&self, refresh_token: &str) -> Result<TokenFile> {
        let refresh = refresh_token.trim();
        if refresh.is_empty() || self.app_id.is_empty() || self.app_secret.is_empty() {
            return Err(anyhow!("refresh token missing or auth incomplete"));
        }

        let body = serde_json::json!({
            "grant_type": "refresh_token",
            "refresh_token": refresh,
            "app_id": self.app_id,
            "app_secret": self.app_secret,
        });
        let response = self
            .client
            .post(format!("{}/authen/v1/refresh_access_token", FEISHU_API_BASE))
            .json(&body)
            .send()
            .await
            .context("refresh token request failed")?;
        let envelope: UserTokenEnvelope = response
            .json()
            .await
            .context("invalid refresh token response")?;
        if envelope.code != 0 {
            return Err(anyhow!("refresh token rejected: {}", envelope.msg));
        }

        let data = envelope.data.unwrap_or_default();
        if data.access_token.is_empty() {
            return Err(anyhow!("refresh response carried no access token"));
        }
        let tokens = token_file_from(data);
        self.token_store.save(&tokens)?;
        info!("user access token refreshed");
        Ok(tokens)
    }

    /// Force or conditionally refresh, for operational tooling.
    pub async fn refresh_user_access_token(&self, force: bool) -> Result<TokenFile> {
        let tokens = self
            .token_store
            .load()?
            .ok_or_else(|| anyhow!("no user token file or file empty"))?;
        if !force
            && !tokens.access_token.is_empty()
            && tokens.created_at > 0
            && now_ms() < token_expire_at_ms(&tokens)
        {
            return Ok(tokens);
        }
        self.refresh_user_tokens(&tokens.refresh_token).await
    }

    /// Build the OAuth authorize URL and persist the one-shot state value.
    pub fn create_oauth_authorize_url(&self, redirect_uri: &str) -> Result<String> {
        if self.app_id.is_empty() {
            return Err(anyhow!("app_id missing"));
        }
        if redirect_uri.is_empty() {
            return Err(anyhow!("redirect_uri missing"));
        }

        let state = Self::generate_state();
        self.save_auth_state(&state)?;

        let mut url = Url::parse(OAUTH_AUTHORIZE_URL)?;
        url.query_pairs_mut()
            .append_pair("app_id", &self.app_id)
            .append_pair("redirect_uri", redirect_uri)
            .append_pair("state", &state);
        Ok(url.to_string())
    }

    /// Exchange an OAuth code for a user token pair and persist it.
    pub async fn exchange_code_for_user_token(&self, code: &str) -> Result<TokenFile> {
        if self.app_id.is_empty() || self.app_secret.is_empty() {
            return Err(anyhow!("auth configuration incomplete"));
        }
        let code = code.trim();
        if code.is_empty() {
            return Err(anyhow!("oauth code missing"));
        }

        let body = serde_json::json!({
            "grant_type": "authorization_code",
            "code": code,
            "app_id": self.app_id,
            "app_secret": self.app_secret,
        });
        let response = self
            .client
            .post(format!("{}/authen/v1/access_token", FEISHU_API_BASE))
            .json(&body)
            .send()
            .await
            .context("code exchange request failed")?;
        let envelope: UserTokenEnvelope =
            response.json().await.context("invalid code exchange response")?;
        if envelope.code != 0 {
            return Err(anyhow!("code exchange rejected: {}", envelope.msg));
        }

        let data = envelope.data.unwrap_or_default();
        let tokens = token_file_from(data);
        self.token_store.save(&tokens)?;
        Ok(tokens)
    }

    /// Consume the stored one-shot OAuth state, verifying it matches.
    pub fn take_auth_state(&self, presented: &str) -> Result<()> {
        let stored = fs::read_to_string(&self.auth_state_path)
            .context("no pending oauth state")?
            .trim()
            .to_string();
        let _ = fs::remove_file(&self.auth_state_path);
        if stored.is_empty() || stored != presented {
            return Err(anyhow!("oauth state mismatch"));
        }
        Ok(())
    }

    fn save_auth_state(&self, state: &str) -> Result<()> {
        if let Some(parent) = self.auth_state_path.parent() {
            fs::create_dir_all(parent).context("Failed to create runtime directory")?;
        }
        fs::write(&self.auth_state_path, state).context("Failed to write auth state file")?;
        Ok(())
    }

    fn generate_state() -> String {
        let mut bytes = [0u8; OAUTH_STATE_BYTES];
        rand::rng().fill(&mut bytes);
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        URL_SAFE_NO_PAD.encode(hasher.finalize())
    }
}

fn token_file_from(data: UserTokenData) -> TokenFile {
    TokenFile {
        access_token: data.access_token,
        refresh_token: data.refresh_token,
        token_type: data.token_type,
        expires_in: data.expires_in,
        refresh_expires_in: data.refresh_expires_in,
        created_at: now_ms(),
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Point at which the stored access token should be considered expired,
/// keeping at least the refresh buffer of safety margin.
fn token_expire_at_ms(tokens: &TokenFile) -> u64 {
    let effective = tokens
        .expires_in
        .saturating_sub(TOKEN_REFRESH_BUFFER_SECS)
        .max(TOKEN_REFRESH_BUFFER_SECS);
    tokens.created_at + effective * 1000
}
