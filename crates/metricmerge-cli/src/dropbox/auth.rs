//! OAuth token handling for Dropbox.
//!
//! Access tokens are short-lived. A refresh token, obtained once with
//! `metricmerge authorize`, is exchanged for a new access token whenever the
//! cached one is close to expiry. The cache is a small JSON file:
//!
//! ```json
//! {"access_token": "sl.B...", "expires_at": "2024-05-01T14:03:00Z"}
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use metricmerge_core::MergeError;
use metricmerge_core::config::RemoteConfig;
use metricmerge_core::staging::TokenProvider;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

const TOKEN_URL: &str = "https://api.dropboxapi.com/oauth2/token";
const AUTHORIZE_URL: &str = "https://www.dropbox.com/oauth2/authorize";

/// Lifetime assumed when the token endpoint does not report one.
const DEFAULT_LIFETIME_SECS: i64 = 4 * 60 * 60;
/// A cached token must stay valid at least this long to be reused.
const MIN_REMAINING_SECS: i64 = 60 * 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenCache {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
}

impl TokenCache {
    /// Whether the token is still usable at `now` with the reuse margin.
    pub fn is_fresh_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at - now >= Duration::seconds(MIN_REMAINING_SECS)
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    refresh_token: Option<String>,
}

/// Issues access tokens from a cached token or the refresh grant.
pub struct CredentialManager {
    app_key: String,
    app_secret: String,
    refresh_token: String,
    cache_path: PathBuf,
}

impl CredentialManager {
    pub fn new(remote: &RemoteConfig, cache_path: &Path) -> Self {
        info!(
            app_key = !remote.app_key.is_empty(),
            app_secret = !remote.app_secret.is_empty(),
            refresh_token = !remote.refresh_token.is_empty(),
            "dropbox credentials present"
        );
        Self {
            app_key: remote.app_key.clone(),
            app_secret: remote.app_secret.clone(),
            refresh_token: remote.refresh_token.clone(),
            cache_path: cache_path.to_path_buf(),
        }
    }

    fn load_cache(&self) -> Option<TokenCache> {
        let text = fs::read_to_string(&self.cache_path).ok()?;
        match serde_json::from_str(&text) {
            Ok(cache) => Some(cache),
            Err(err) => {
                warn!(path = %self.cache_path.display(), "ignoring unreadable token cache: {err}");
                None
            }
        }
    }

    /// Cached token if it remains valid for the reuse margin after `now`.
    pub fn cached_token_at(&self, now: DateTime<Utc>) -> Option<String> {
        self.load_cache()
            .filter(|cache| cache.is_fresh_at(now))
            .map(|cache| cache.access_token)
    }

    fn store_cache(&self, cache: &TokenCache) -> Result<(), MergeError> {
        if let Some(parent) = self.cache_path.parent() {
            fs::create_dir_all(parent).map_err(|err| MergeError::io(parent, err))?;
        }
        let json = serde_json::to_string(cache)
            .map_err(|err| MergeError::Credential(format!("encoding token cache: {err}")))?;
        let tmp = self.cache_path.with_extension("tmp");
        fs::write(&tmp, json).map_err(|err| MergeError::io(&tmp, err))?;
        fs::rename(&tmp, &self.cache_path).map_err(|err| MergeError::io(&self.cache_path, err))
    }

    fn require_credentials(&self) -> Result<(), MergeError> {
        let missing: Vec<&str> = [
            ("DROPBOX_APP_KEY", &self.app_key),
            ("DROPBOX_APP_SECRET", &self.app_secret),
            ("DROPBOX_REFRESH_TOKEN", &self.refresh_token),
        ]
        .iter()
        .filter(|(_, value)| value.is_empty())
        .map(|(name, _)| *name)
        .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(MergeError::Credential(format!(
                "missing {}",
                missing.join(", ")
            )))
        }
    }

    /// Exchange the refresh token for a new access token and cache it.
    pub fn refresh(&self) -> Result<String, MergeError> {
        self.require_credentials()?;
        info!("refreshing dropbox access token");
        let response = request_token(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", &self.refresh_token),
            ("client_id", &self.app_key),
            ("client_secret", &self.app_secret),
        ])?;

        let lifetime = response.expires_in.unwrap_or(DEFAULT_LIFETIME_SECS);
        let cache = TokenCache {
            access_token: response.access_token,
            expires_at: Utc::now() + Duration::seconds(lifetime),
        };
        if let Err(err) = self.store_cache(&cache) {
            warn!(code = err.code().code(), "token cache not written: {err}");
        }
        Ok(cache.access_token)
    }
}

impl TokenProvider for CredentialManager {
    fn get_valid_token(&self) -> Result<String, MergeError> {
        if let Some(token) = self.cached_token_at(Utc::now()) {
            debug!(path = %self.cache_path.display(), "using cached access token");
            return Ok(token);
        }
        info!("access token expired or not cached");
        self.refresh()
    }
}

fn request_token(form: &[(&str, &str)]) -> Result<TokenResponse, MergeError> {
    let response = ureq::post(TOKEN_URL).send_form(form).map_err(|err| match err {
        ureq::Error::Status(code, response) => MergeError::Credential(format!(
            "token endpoint returned HTTP {code}: {}",
            response.into_string().unwrap_or_default().trim()
        )),
        ureq::Error::Transport(transport) => MergeError::Credential(transport.to_string()),
    })?;
    response
        .into_json::<TokenResponse>()
        .map_err(|err| MergeError::Credential(format!("decoding token response: {err}")))
}

/// URL the operator opens to grant offline access.
pub fn authorize_url(app_key: &str) -> String {
    format!("{AUTHORIZE_URL}?client_id={app_key}&response_type=code&token_access_type=offline")
}

/// Tokens returned by the authorization-code exchange.
#[derive(Debug, Serialize)]
pub struct AuthorizedTokens {
    pub refresh_token: String,
    pub access_token: String,
}

/// Exchange an authorization code for a refresh token.
pub fn exchange_code(
    app_key: &str,
    app_secret: &str,
    code: &str,
) -> Result<AuthorizedTokens, MergeError> {
    let response = request_token(&[
        ("grant_type", "authorization_code"),
        ("code", code),
        ("client_id", app_key),
        ("client_secret", app_secret),
    ])?;
    let refresh_token = response.refresh_token.ok_or_else(|| {
        MergeError::Credential("token response carried no refresh token".to_string())
    })?;
    Ok(AuthorizedTokens {
        refresh_token,
        access_token: response.access_token,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, hour, minute, 0)
            .single()
            .expect("valid instant")
    }

    fn manager(dir: &TempDir, remote: &RemoteConfig) -> CredentialManager {
        CredentialManager::new(remote, &dir.path().join("auth").join("token.json"))
    }

    #[test]
    fn cached_token_is_reused_with_an_hour_left() {
        let dir = TempDir::new().expect("tempdir");
        let creds = manager(&dir, &RemoteConfig::default());
        creds
            .store_cache(&TokenCache {
                access_token: "sl.cached".into(),
                expires_at: at(14, 0),
            })
            .expect("write cache");

        assert_eq!(creds.cached_token_at(at(12, 30)).as_deref(), Some("sl.cached"));
        assert_eq!(creds.cached_token_at(at(13, 0)).as_deref(), Some("sl.cached"));
        assert_eq!(creds.cached_token_at(at(13, 1)), None);
    }

    #[test]
    fn corrupt_cache_is_ignored() {
        let dir = TempDir::new().expect("tempdir");
        let creds = manager(&dir, &RemoteConfig::default());
        fs::create_dir_all(dir.path().join("auth")).expect("mkdir");
        fs::write(dir.path().join("auth").join("token.json"), "{not json").expect("write");
        assert_eq!(creds.cached_token_at(at(0, 0)), None);
    }

    #[test]
    fn cache_file_round_trips_through_json() {
        let cache: TokenCache = serde_json::from_str(
            r#"{"access_token": "sl.abc", "expires_at": "2024-05-01T14:00:00Z"}"#,
        )
        .expect("valid cache");
        assert_eq!(cache.expires_at, at(14, 0));
        assert!(cache.is_fresh_at(at(12, 0)));
        assert!(!cache.is_fresh_at(at(13, 30)));
    }

    #[test]
    fn missing_credentials_fail_before_any_request() {
        let dir = TempDir::new().expect("tempdir");
        let remote = RemoteConfig {
            app_key: "key".into(),
            ..RemoteConfig::default()
        };
        let err = manager(&dir, &remote)
            .get_valid_token()
            .expect_err("no secret or refresh token");
        let message = err.to_string();
        assert!(message.contains("DROPBOX_APP_SECRET"));
        assert!(message.contains("DROPBOX_REFRESH_TOKEN"));
        assert!(!message.contains("DROPBOX_APP_KEY"));
    }

    #[test]
    fn token_response_lifetime_is_optional() {
        let response: TokenResponse =
            serde_json::from_str(r#"{"access_token": "sl.x", "token_type": "bearer"}"#)
                .expect("valid response");
        assert_eq!(response.expires_in, None);
        assert_eq!(response.refresh_token, None);
    }

    #[test]
    fn authorize_url_requests_offline_access() {
        let url = authorize_url("abc123");
        assert!(url.starts_with("https://www.dropbox.com/oauth2/authorize?client_id=abc123"));
        assert!(url.contains("token_access_type=offline"));
    }
}
