//! Credential verification adapters.
//!
//! The session machine only sees [`IdentityVerifier`]; which implementation
//! backs it is decided once at startup from `auth.mode`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use shared::config::server::{AuthConfig, AuthMode};
use shared::models::{Credential, Principal};

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("{0} credentials are not accepted in this auth mode")]
    UnsupportedCredential(&'static str),
    #[error("credential is not a valid email address")]
    InvalidEmail,
    #[error("verifier rejected the credential with status {0}")]
    Rejected(u16),
    #[error("verifier response carried no identity claim")]
    MissingClaim,
    #[error("verifier request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("auth mode {0:?} requires auth.verify_url")]
    MissingVerifyUrl(AuthMode),
    #[error("email pattern failed to compile: {0}")]
    Pattern(#[from] regex::Error),
}

#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    /// Resolves a credential to a verified principal.
    async fn verify(&self, credential: &Credential) -> Result<Principal, IdentityError>;

    /// How raw credential strings should be interpreted for this verifier.
    fn mode(&self) -> AuthMode;

    /// Wraps a raw credential string as this verifier expects it.
    fn credential_from_raw(&self, raw: String) -> Credential {
        match self.mode() {
            AuthMode::Email => Credential::Email(raw),
            AuthMode::Token => Credential::Token(raw),
        }
    }
}

/// Accepts any syntactically valid email as the principal id.
#[derive(Debug, Clone)]
pub struct EmailIdentityVerifier {
    pattern: Regex,
}

impl EmailIdentityVerifier {
    /// # Errors
    /// Fails only if the built-in address pattern does not compile.
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$")?,
        })
    }
}

#[async_trait]
impl IdentityVerifier for EmailIdentityVerifier {
    async fn verify(&self, credential: &Credential) -> Result<Principal, IdentityError> {
        let Credential::Email(raw) = credential else {
            return Err(IdentityError::UnsupportedCredential(credential.kind()));
        };

        let email = raw.trim().to_lowercase();
        if !self.pattern.is_match(&email) {
            return Err(IdentityError::InvalidEmail);
        }

        Ok(Principal::verified(email))
    }

    fn mode(&self) -> AuthMode {
        AuthMode::Email
    }
}

#[derive(Debug, Deserialize)]
struct VerifyResponse {
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    sub: Option<String>,
}

impl VerifyResponse {
    fn into_id(self) -> Option<String> {
        self.email
            .or(self.sub)
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
    }
}

/// Delegates token verification to an external HTTP endpoint.
#[derive(Debug, Clone)]
pub struct HttpTokenVerifier {
    client: reqwest::Client,
    verify_url: String,
}

impl HttpTokenVerifier {
    /// # Errors
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(verify_url: impl Into<String>, timeout: Duration) -> Result<Self, IdentityError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            verify_url: verify_url.into(),
        })
    }
}

#[async_trait]
impl IdentityVerifier for HttpTokenVerifier {
    #[instrument(skip_all, fields(kind = credential.kind()))]
    async fn verify(&self, credential: &Credential) -> Result<Principal, IdentityError> {
        let Credential::Token(token) = credential else {
            return Err(IdentityError::UnsupportedCredential(credential.kind()));
        };

        let response = self
            .client
            .post(&self.verify_url)
            .json(&serde_json::json!({ "token": token }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            debug!(status = status.as_u16(), "token verification rejected");
            return Err(IdentityError::Rejected(status.as_u16()));
        }

        let body: VerifyResponse = response.json().await.map_err(|err| {
            warn!(error = %err, "token verifier returned an unreadable body");
            IdentityError::MissingClaim
        })?;

        body.into_id()
            .map(Principal::verified)
            .ok_or(IdentityError::MissingClaim)
    }

    fn mode(&self) -> AuthMode {
        AuthMode::Token
    }
}

/// Builds the verifier selected by configuration.
///
/// # Errors
/// Returns an error when token mode lacks a verify URL or the HTTP client
/// cannot be built.
pub fn verifier_from_config(
    config: &AuthConfig,
    timeout: Duration,
) -> Result<Arc<dyn IdentityVerifier>, IdentityError> {
    match config.mode {
        AuthMode::Email => {
            Ok(Arc::new(EmailIdentityVerifier::new()?))
        }
        AuthMode::Token => {
            let url = config
                .verify_url
                .clone()
                .ok_or(IdentityError::MissingVerifyUrl(AuthMode::Token))?;
            Ok(Arc::new(HttpTokenVerifier::new(url, timeout)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("a@b.com", "a@b.com" ; "plain")]
    #[test_case("  Ada@Example.COM ", "ada@example.com" ; "trimmed and lowercased")]
    #[tokio::test]
    async fn email_verifier_normalizes(raw: &str, expected: &str) {
        let verifier = EmailIdentityVerifier::new().unwrap();
        let principal = verifier
            .verify(&Credential::Email(raw.to_string()))
            .await
            .unwrap();
        assert_eq!(principal, Principal::verified(expected));
    }

    #[test_case("not-an-email" ; "no at sign")]
    #[test_case("a@b" ; "no domain dot")]
    #[test_case("" ; "empty")]
    #[test_case("a b@c.com" ; "inner space")]
    #[tokio::test]
    async fn email_verifier_rejects_invalid(raw: &str) {
        let verifier = EmailIdentityVerifier::new().unwrap();
        let err = verifier
            .verify(&Credential::Email(raw.to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, IdentityError::InvalidEmail));
    }

    #[tokio::test]
    async fn email_verifier_rejects_tokens() {
        let verifier = EmailIdentityVerifier::new().unwrap();
        let err = verifier
            .verify(&Credential::Token("abc".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, IdentityError::UnsupportedCredential("token")));
    }

    #[tokio::test]
    async fn token_verifier_rejects_bare_emails_without_calling_out() {
        let verifier =
            HttpTokenVerifier::new("http://127.0.0.1:9/verify", Duration::from_millis(50)).unwrap();
        let err = verifier
            .verify(&Credential::Email("a@b.com".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, IdentityError::UnsupportedCredential("email")));
    }

    #[test]
    fn verify_response_prefers_email_then_sub() {
        let both: VerifyResponse =
            serde_json::from_str(r#"{"email":"a@b.com","sub":"123"}"#).unwrap();
        assert_eq!(both.into_id().as_deref(), Some("a@b.com"));

        let sub_only: VerifyResponse = serde_json::from_str(r#"{"sub":"123"}"#).unwrap();
        assert_eq!(sub_only.into_id().as_deref(), Some("123"));

        let blank: VerifyResponse = serde_json::from_str(r#"{"email":"  "}"#).unwrap();
        assert_eq!(blank.into_id(), None);
    }

    #[test]
    fn raw_credentials_follow_mode() {
        let verifier = EmailIdentityVerifier::new().unwrap();
        assert_eq!(
            verifier.credential_from_raw("a@b.com".into()),
            Credential::Email("a@b.com".into())
        );
    }

    #[test]
    fn token_mode_requires_verify_url() {
        let config = AuthConfig {
            mode: AuthMode::Token,
            verify_url: None,
            allow_guests: true,
        };
        assert!(matches!(
            verifier_from_config(&config, Duration::from_secs(1)),
            Err(IdentityError::MissingVerifyUrl(AuthMode::Token))
        ));
    }
}
