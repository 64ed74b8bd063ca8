//! Access tokens for the Compute Engine API.
//!
//! Tokens printed by `gcloud` expire after about an hour, while
//! acquisition can wait out capacity outages far longer than that. The
//! client asks its [`TokenSource`] for a token on every request and
//! invalidates it when the API answers 401.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::providers::traits::ProviderError;

/// How long a `gcloud` token is reused before it is printed again.
const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(45 * 60);

/// Supplies bearer tokens to the client.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Current token, fetched or refreshed as needed.
    async fn token(&self) -> Result<String, ProviderError>;

    /// Drop the current token; the next [`token`](Self::token) call
    /// fetches a new one.
    fn invalidate(&self);
}

/// A fixed token, for callers that manage refresh themselves.
pub struct StaticToken(String);

impl StaticToken {
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

#[async_trait]
impl TokenSource for StaticToken {
    async fn token(&self) -> Result<String, ProviderError> {
        Ok(self.0.clone())
    }

    fn invalidate(&self) {}
}

/// Tokens from `gcloud auth print-access-token`, cached for
/// [`DEFAULT_TOKEN_LIFETIME`] and refreshed on expiry or invalidation.
pub struct GcloudToken {
    program: String,
    args: Vec<String>,
    lifetime: Duration,
    cached: Mutex<Option<(String, Instant)>>,
}

impl Default for GcloudToken {
    fn default() -> Self {
        Self::new()
    }
}

impl GcloudToken {
    /// Use the `gcloud` CLI on `PATH`.
    #[must_use]
    pub fn new() -> Self {
        Self::with_command("gcloud", ["auth", "print-access-token"])
    }

    /// Use a different command that prints a token on stdout.
    #[must_use]
    pub fn with_command<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            lifetime: DEFAULT_TOKEN_LIFETIME,
            cached: Mutex::new(None),
        }
    }

    /// Reuse each token for `lifetime`.
    #[must_use]
    pub fn lifetime(mut self, lifetime: Duration) -> Self {
        self.lifetime = lifetime;
        self
    }

    fn cached(&self) -> Option<String> {
        let guard = self.cached.lock().ok()?;
        let (token, fetched) = guard.as_ref()?;
        (fetched.elapsed() < self.lifetime).then(|| token.clone())
    }

    async fn fetch(&self) -> Result<String, ProviderError> {
        debug!(program = %self.program, "Fetching access token");
        let output = Command::new(&self.program)
            .args(&self.args)
            .output()
            .await
            .map_err(|e| {
                ProviderError::Auth(format!(
                    "Failed to run `{}`: {e}. Install the Google Cloud SDK or pass --access-token",
                    self.program
                ))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProviderError::Auth(format!(
                "{} error: {}. Run: `gcloud auth login`",
                self.program,
                stderr.trim()
            )));
        }

        let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if token.is_empty() {
            return Err(ProviderError::Auth(format!(
                "{} returned an empty access token",
                self.program
            )));
        }
        Ok(token)
    }
}

#[async_trait]
impl TokenSource for GcloudToken {
    async fn token(&self) -> Result<String, ProviderError> {
        if let Some(token) = self.cached() {
            return Ok(token);
        }

        let token = self.fetch().await?;
        if let Ok(mut guard) = self.cached.lock() {
            *guard = Some((token.clone(), Instant::now()));
        }
        info!("Access token refreshed");
        Ok(token)
    }

    fn invalidate(&self) {
        if let Ok(mut guard) = self.cached.lock() {
            *guard = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Prints one more `x` on every run so refreshes are visible.
    fn counting_token(dir: &std::path::Path) -> GcloudToken {
        let counter = dir.join("count");
        let script = format!(
            "printf x >> {path}; printf 'tok-'; cat {path}",
            path = counter.display()
        );
        GcloudToken::with_command("sh", ["-c".to_string(), script])
    }

    #[tokio::test]
    async fn test_gcloud_token_is_cached() {
        let dir = tempfile::tempdir().unwrap();
        let source = counting_token(dir.path());

        assert_eq!(source.token().await.unwrap(), "tok-x");
        assert_eq!(source.token().await.unwrap(), "tok-x");
    }

    #[tokio::test]
    async fn test_gcloud_token_refreshes_after_invalidate() {
        let dir = tempfile::tempdir().unwrap();
        let source = counting_token(dir.path());

        assert_eq!(source.token().await.unwrap(), "tok-x");
        source.invalidate();
        assert_eq!(source.token().await.unwrap(), "tok-xx");
    }

    #[tokio::test]
    async fn test_gcloud_token_refreshes_after_lifetime() {
        let dir = tempfile::tempdir().unwrap();
        let source = counting_token(dir.path()).lifetime(Duration::ZERO);

        assert_eq!(source.token().await.unwrap(), "tok-x");
        assert_eq!(source.token().await.unwrap(), "tok-xx");
    }

    #[tokio::test]
    async fn test_failing_command_is_auth_error() {
        let source = GcloudToken::with_command("sh", ["-c", "echo denied >&2; exit 1"]);
        let err = source.token().await.unwrap_err();
        assert!(matches!(err, ProviderError::Auth(ref m) if m.contains("denied")));
    }

    #[tokio::test]
    async fn test_missing_program_is_auth_error() {
        let source = GcloudToken::with_command("gpu-keeper-no-such-program", Vec::<String>::new());
        assert!(matches!(source.token().await, Err(ProviderError::Auth(_))));
    }
}
