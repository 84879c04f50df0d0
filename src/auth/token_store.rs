//! Persisted user-token file
//!
//! The token file is a single JSON object owned by the auth layer. Writes
//! are full-rewrite through a sibling temp file and rename, so a crashed
//! refresh never leaves a half-written file behind.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Contents of the persisted user-token JSON.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TokenFile {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    /// Access-token lifetime in seconds.
    pub expires_in: u64,
    /// Refresh-token lifetime in seconds.
    pub refresh_expires_in: u64,
    /// Epoch milliseconds at which the token pair was issued.
    pub created_at: u64,
}

/// Load/save access to the token file.
pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the stored tokens. Absent or empty path yields `None`.
    pub fn load(&self) -> Result<Option<TokenFile>> {
        if self.path.as_os_str().is_empty() || !self.path.exists() {
            return Ok(None);
        }
        let data = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read token file {}", self.path.display()))?;
        let tokens: TokenFile = serde_json::from_str(&data)
            .with_context(|| format!("Invalid token file {}", self.path.display()))?;
        Ok(Some(tokens))
    }

    /// Persist tokens with write-temp-then-rename.
    pub fn save(&self, tokens: &TokenFile) -> Result<()> {
        if self.path.as_os_str().is_empty() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).context("Failed to create token directory")?;
        }
        let data = serde_json::to_string_pretty(tokens)?;
        let parent = self.path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(parent)
            .context("Failed to create temp token file")?;
        tmp.write_all(data.as_bytes())?;
        tmp.persist(&self.path)
            .map_err(|e| anyhow!("Failed to persist token file: {}", e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_loads_as_none() {
        let dir = TempDir::new().unwrap();
        let store = TokenStore::new(dir.path().join("tokens.json"));
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = TempDir::new().unwrap();
        let store = TokenStore::new(dir.path().join("tokens.json"));
        let tokens = TokenFile {
            access_token: "u-abc".to_string(),
            refresh_token: "ur-def".to_string(),
            token_type: "Bearer".to_string(),
            expires_in: 7200,
            refresh_expires_in: 2_592_000,
            created_at: 1_700_000_000_000,
        };
        store.save(&tokens).unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.access_token, "u-abc");
        assert_eq!(loaded.created_at, 1_700_000_000_000);
    }

    #[test]
    fn empty_path_is_a_noop() {
        let store = TokenStore::new("");
        assert!(store.load().unwrap().is_none());
        assert!(store.save(&TokenFile::default()).is_ok());
    }
}
