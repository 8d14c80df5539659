//! # Firebase Credential Source
//!
//! Anonymous identities through the Firebase Authentication REST API.
//!
//! | Operation | Request |
//! |-----------|---------|
//! | sign in   | `POST {identity}/v1/accounts:signUp?key=…` `{"returnSecureToken":true}` |
//! | refresh   | `POST {secure_token}/v1/token?key=…` form `grant_type=refresh_token` |
//!
//! Error bodies look like `{"error":{"code":400,"message":"USER_DISABLED"}}`.
//! The leading word of `message` decides the [`AuthError`] kind.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

use geotrack_core::Credential;

use crate::auth::{CredentialSource, IssuedCredential};
use crate::config::AuthSettings;
use crate::error::{AuthError, SyncError, SyncResult};

/// Codes meaning the identity is gone for good.
const REVOKED_CODES: &[&str] = &[
    "USER_DISABLED",
    "USER_NOT_FOUND",
    "OPERATION_NOT_ALLOWED",
    "ADMIN_ONLY_OPERATION",
];

/// Codes meaning the refresh token is dead but a new sign-in may work.
const EXPIRED_CODES: &[&str] = &[
    "TOKEN_EXPIRED",
    "INVALID_REFRESH_TOKEN",
    "INVALID_GRANT_TYPE",
    "MISSING_REFRESH_TOKEN",
];

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignUpResponse {
    id_token: String,
    refresh_token: Option<String>,
    expires_in: String,
    local_id: String,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    id_token: String,
    refresh_token: Option<String>,
    expires_in: String,
    user_id: String,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
}

/// [`CredentialSource`] backed by Firebase Authentication.
#[derive(Debug, Clone)]
pub struct FirebaseAuthSource {
    client: Client,
    api_key: String,
    sign_up_url: Url,
    token_url: Url,
}

impl FirebaseAuthSource {
    /// Fails when no API key is configured.
    pub fn new(settings: &AuthSettings, timeout: Duration) -> SyncResult<Self> {
        let api_key = settings
            .api_key
            .clone()
            .filter(|key| !key.is_empty())
            .ok_or_else(|| SyncError::InvalidConfig("auth.api_key is required".into()))?;

        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("geotrack/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(FirebaseAuthSource {
            client,
            api_key,
            sign_up_url: join(&settings.identity_url, "v1/accounts:signUp")?,
            token_url: join(&settings.secure_token_url, "v1/token")?,
        })
    }

    async fn post_error(response: reqwest::Response) -> AuthError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorEnvelope>(&body)
            .map(|e| e.error.message)
            .unwrap_or(body);
        classify(status, &message)
    }
}

fn join(base: &str, path: &str) -> SyncResult<Url> {
    let mut base = Url::parse(base)?;
    if !base.path().ends_with('/') {
        let with_slash = format!("{}/", base.path());
        base.set_path(&with_slash);
    }
    Ok(base.join(path)?)
}

/// Maps an error response to an [`AuthError`].
pub(crate) fn classify(status: StatusCode, message: &str) -> AuthError {
    let code = message
        .split(|c: char| c == ' ' || c == ':')
        .next()
        .unwrap_or_default();

    if REVOKED_CODES.contains(&code) {
        AuthError::Revoked(code.to_string())
    } else if EXPIRED_CODES.contains(&code) {
        AuthError::SessionExpired(code.to_string())
    } else {
        AuthError::Unavailable(format!("{status}: {message}"))
    }
}

fn expires_at(expires_in: &str) -> Result<chrono::DateTime<Utc>, AuthError> {
    let secs: i64 = expires_in
        .trim()
        .parse()
        .map_err(|_| AuthError::Unavailable(format!("invalid expiresIn: {expires_in}")))?;
    Ok(Utc::now() + chrono::Duration::seconds(secs))
}

fn network_error(err: reqwest::Error) -> AuthError {
    AuthError::Unavailable(err.to_string())
}

#[async_trait]
impl CredentialSource for FirebaseAuthSource {
    async fn sign_in(&self) -> Result<IssuedCredential, AuthError> {
        debug!("Anonymous sign-in");

        let response = self
            .client
            .post(self.sign_up_url.clone())
            .query(&[("key", self.api_key.as_str())])
            .json(&serde_json::json!({ "returnSecureToken": true }))
            .send()
            .await
            .map_err(network_error)?;

        if !response.status().is_success() {
            let err = Self::post_error(response).await;
            warn!(?err, "Sign-in refused");
            return Err(err);
        }

        let body: SignUpResponse = response.json().await.map_err(network_error)?;
        Ok(IssuedCredential {
            credential: Credential::new(body.id_token, expires_at(&body.expires_in)?, body.local_id),
            refresh_token: body.refresh_token,
        })
    }

    async fn refresh(&self, refresh_token: &str) -> Result<IssuedCredential, AuthError> {
        debug!("Refreshing id token");

        let response = self
            .client
            .post(self.token_url.clone())
            .query(&[("key", self.api_key.as_str())])
            .form(&[("grant_type", "refresh_token"), ("refresh_token", refresh_token)])
            .send()
            .await
            .map_err(network_error)?;

        if !response.status().is_success() {
            let err = Self::post_error(response).await;
            warn!(?err, "Token refresh refused");
            return Err(err);
        }

        let body: RefreshResponse = response.json().await.map_err(network_error)?;
        Ok(IssuedCredential {
            credential: Credential::new(body.id_token, expires_at(&body.expires_in)?, body.user_id),
            refresh_token: body.refresh_token,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_codes() {
        assert_eq!(
            classify(StatusCode::BAD_REQUEST, "USER_DISABLED"),
            AuthError::Revoked("USER_DISABLED".into())
        );
        assert_eq!(
            classify(StatusCode::BAD_REQUEST, "INVALID_REFRESH_TOKEN"),
            AuthError::SessionExpired("INVALID_REFRESH_TOKEN".into())
        );
        assert_eq!(
            classify(StatusCode::BAD_REQUEST, "OPERATION_NOT_ALLOWED : anonymous sign-in disabled"),
            AuthError::Revoked("OPERATION_NOT_ALLOWED".into())
        );
        assert!(matches!(
            classify(StatusCode::SERVICE_UNAVAILABLE, "backend busy"),
            AuthError::Unavailable(_)
        ));
        assert!(matches!(
            classify(StatusCode::TOO_MANY_REQUESTS, "TOO_MANY_ATTEMPTS_TRY_LATER"),
            AuthError::Unavailable(_)
        ));
    }

    #[test]
    fn test_requires_api_key() {
        let settings = AuthSettings::default();
        let err = FirebaseAuthSource::new(&settings, Duration::from_secs(5)).unwrap_err();
        assert!(err.is_config_error());
    }

    #[test]
    fn test_endpoint_urls() {
        let settings = AuthSettings {
            api_key: Some("k".into()),
            identity_url: "http://127.0.0.1:9099/identitytoolkit.googleapis.com".into(),
            ..Default::default()
        };
        let source = FirebaseAuthSource::new(&settings, Duration::from_secs(5)).unwrap();
        assert_eq!(
            source.sign_up_url.as_str(),
            "http://127.0.0.1:9099/identitytoolkit.googleapis.com/v1/accounts:signUp"
        );
        assert_eq!(source.token_url.as_str(), "https://securetoken.googleapis.com/v1/token");
    }

    #[test]
    fn test_expires_in_parsing() {
        let at = expires_at("3600").unwrap();
        let remaining = (at - Utc::now()).num_seconds();
        assert!((3590..=3600).contains(&remaining));
        assert!(expires_at("soon").is_err());
    }
}
