use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::{Error, Result};

/// gcloud tokens live for an hour; refresh well before that.
const GCLOUD_TOKEN_TTL: Duration = Duration::from_secs(45 * 60);

/// Supplies OAuth2 bearer tokens for the Compute API.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn access_token(&self) -> Result<String>;
}

/// A token handed in from outside (flag or environment).
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

#[async_trait]
impl TokenSource for StaticToken {
    async fn access_token(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}

/// Borrows the credentials of the local `gcloud` installation.
#[derive(Default)]
pub struct GcloudToken {
    cached: tokio::sync::Mutex<Option<(String, Instant)>>,
}

impl GcloudToken {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TokenSource for GcloudToken {
    async fn access_token(&self) -> Result<String> {
        let mut cached = self.cached.lock().await;
        if let Some((token, fetched_at)) = cached.as_ref() {
            if fetched_at.elapsed() < GCLOUD_TOKEN_TTL {
                return Ok(token.clone());
            }
        }

        tracing::debug!("fetching access token from gcloud");
        let output = tokio::process::Command::new("gcloud")
            .args(["auth", "print-access-token"])
            .output()
            .await
            .map_err(|e| Error::Auth(format!("failed to run gcloud: {e}")))?;

        if !output.status.success() {
            return Err(Error::Auth(format!(
                "gcloud auth print-access-token failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if token.is_empty() {
            return Err(Error::Auth("gcloud returned an empty access token".into()));
        }

        *cached = Some((token.clone(), Instant::now()));
        Ok(token)
    }
}
