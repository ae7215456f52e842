use serde::{Deserialize, Serialize};
use std::fmt;

/// A verified identity bound to a session. Immutable once established.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Principal {
    /// Stable unique identifier (email or subject claim).
    pub id: String,
    pub guest: bool,
}

impl Principal {
    pub fn verified(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            guest: false,
        }
    }

    pub fn guest(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            guest: true,
        }
    }

    /// View sent back to the client in `auth_success`.
    #[must_use]
    pub fn to_auth_user(&self) -> AuthUser {
        AuthUser {
            email: self.id.clone(),
            is_guest: self.guest,
        }
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.guest {
            write!(f, "guest:{}", self.id)
        } else {
            f.write_str(&self.id)
        }
    }
}

/// Opaque credential submitted for verification.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    Email(String),
    Token(String),
}

impl Credential {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Email(_) => "email",
            Self::Token(_) => "token",
        }
    }
}

// Tokens must never reach the logs.
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Email(email) => f.debug_tuple("Email").field(email).finish(),
            Self::Token(_) => f.debug_tuple("Token").field(&"<redacted>").finish(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthUser {
    pub email: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_guest: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn auth_user_omits_guest_flag_for_verified_principals() {
        let user = Principal::verified("a@b.com").to_auth_user();
        assert_eq!(serde_json::to_value(user).unwrap(), json!({ "email": "a@b.com" }));

        let guest = Principal::guest("guest-1").to_auth_user();
        assert_eq!(
            serde_json::to_value(guest).unwrap(),
            json!({ "email": "guest-1", "isGuest": true })
        );
    }

    #[test]
    fn token_debug_is_redacted() {
        let rendered = format!("{:?}", Credential::Token("secret-token".into()));
        assert!(!rendered.contains("secret-token"));
    }
}
