//! Credential providers for the cloud API client.
//!
//! The client asks its provider for the current token before every request.
//! Providers cache the token and refresh it lazily once it expires, so the
//! reconciliation code never touches credential files directly.

use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::Deserialize;

use crate::error::{CloudError, Result};

/// How long before expiry a cached token is considered stale.
const EXPIRY_SKEW_SECONDS: i64 = 60;

/// An API token with its optional expiry.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Token {
    /// The bearer token.
    pub token: String,
    /// When the token stops being accepted; `None` never expires.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Token {
    /// Create a token that never expires.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            expires_at: None,
        }
    }

    /// Whether the token is expired (or about to expire) at `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at
            .is_some_and(|at| at <= now + Duration::seconds(EXPIRY_SKEW_SECONDS))
    }
}

impl std::fmt::Debug for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Token")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Source of API tokens.
pub trait CredentialProvider: Send + Sync {
    /// Return a token that is valid now.
    ///
    /// # Errors
    ///
    /// Returns `CloudError::Credentials` if no valid token can be obtained.
    fn current_token(&self) -> Result<Token>;
}

/// A provider holding one fixed token.
#[derive(Debug, Clone)]
pub struct StaticCredentialProvider {
    token: Token,
}

impl StaticCredentialProvider {
    /// Create a provider for a token that never expires.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: Token::new(token),
        }
    }
}

impl CredentialProvider for StaticCredentialProvider {
    fn current_token(&self) -> Result<Token> {
        Ok(self.token.clone())
    }
}

/// A provider reading a JSON token file (`{"token": "...", "expiresAt": "..."}`).
///
/// The file is re-read only when the cached token has expired; an external
/// agent is expected to rotate the file.
pub struct FileCredentialProvider {
    path: PathBuf,
    cached: Mutex<Option<Token>>,
}

impl FileCredentialProvider {
    /// Create a provider for the given token file.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cached: Mutex::new(None),
        }
    }

    fn load(&self) -> Result<Token> {
        let raw = std::fs::read_to_string(&self.path).map_err(|e| {
            CloudError::Credentials(format!("cannot read {}: {e}", self.path.display()))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            CloudError::Credentials(format!("malformed token file {}: {e}", self.path.display()))
        })
    }
}

impl CredentialProvider for FileCredentialProvider {
    fn current_token(&self) -> Result<Token> {
        let now = Utc::now();
        let mut cached = self.cached.lock();

        if let Some(token) = cached.as_ref() {
            if !token.is_expired_at(now) {
                return Ok(token.clone());
            }
        }

        tracing::debug!(path = %self.path.display(), "Reloading API token");
        let token = self.load()?;
        if token.is_expired_at(now) {
            return Err(CloudError::Credentials(format!(
                "token in {} is expired",
                self.path.display()
            )));
        }

        *cached = Some(token.clone());
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_token(file: &mut tempfile::NamedTempFile, token: &str, expires_at: DateTime<Utc>) {
        let body = serde_json::json!({ "token": token, "expiresAt": expires_at });
        file.as_file_mut().set_len(0).unwrap();
        std::io::Seek::rewind(file.as_file_mut()).unwrap();
        write!(file, "{body}").unwrap();
        file.flush().unwrap();
    }

    #[test]
    fn static_provider_never_expires() {
        let provider = StaticCredentialProvider::new("abc");
        let token = provider.current_token().unwrap();
        assert_eq!(token.token, "abc");
        assert!(!token.is_expired_at(Utc::now()));
    }

    #[test]
    fn token_debug_redacts_secret() {
        let token = Token::new("super-secret");
        assert!(!format!("{token:?}").contains("super-secret"));
    }

    #[test]
    fn expiry_includes_skew() {
        let now = Utc::now();
        let token = Token {
            token: "t".into(),
            expires_at: Some(now + Duration::seconds(30)),
        };
        assert!(token.is_expired_at(now));

        let token = Token {
            token: "t".into(),
            expires_at: Some(now + Duration::hours(1)),
        };
        assert!(!token.is_expired_at(now));
    }

    #[test]
    fn file_provider_caches_until_expiry() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write_token(&mut file, "first", Utc::now() + Duration::hours(1));

        let provider = FileCredentialProvider::new(file.path());
        assert_eq!(provider.current_token().unwrap().token, "first");

        // Rotated on disk but the cached token is still valid
        write_token(&mut file, "second", Utc::now() + Duration::hours(2));
        assert_eq!(provider.current_token().unwrap().token, "first");
    }

    #[test]
    fn file_provider_reloads_expired_token() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write_token(&mut file, "first", Utc::now() + Duration::hours(1));
        let provider = FileCredentialProvider::new(file.path());
        provider.current_token().unwrap();

        *provider.cached.lock() = Some(Token {
            token: "first".into(),
            expires_at: Some(Utc::now() - Duration::minutes(1)),
        });
        write_token(&mut file, "second", Utc::now() + Duration::hours(1));

        assert_eq!(provider.current_token().unwrap().token, "second");
    }

    #[test]
    fn file_provider_rejects_expired_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write_token(&mut file, "old", Utc::now() - Duration::hours(1));

        let provider = FileCredentialProvider::new(file.path());
        assert!(matches!(
            provider.current_token(),
            Err(CloudError::Credentials(_))
        ));
    }

    #[test]
    fn file_provider_missing_file() {
        let provider = FileCredentialProvider::new("/nonexistent/token.json");
        assert!(matches!(
            provider.current_token(),
            Err(CloudError::Credentials(_))
        ));
    }
}
