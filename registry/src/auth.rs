//! Bearer token auth for the registry surface.
//!
//! Tokens are HS256 JWTs scoped to `pull` or `push,pull`. The deploy
//! loop pulls with a short-lived service token minted at startup and
//! kept only in memory; human pushes exchange basic credentials for a
//! token at `/token`.

use std::collections::HashMap;

use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

pub const SERVICE_SUBJECT: &str = "gordon-deploy";
const SERVICE_TOKEN_TTL_HOURS: i64 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Pull,
    Push,
}

impl Scope {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Pull => "pull",
            Self::Push => "push,pull",
        }
    }

    fn allows(granted: &str, required: Scope) -> bool {
        match required {
            Scope::Pull => granted.contains("pull"),
            Scope::Push => granted.contains("push"),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    scope: String,
    iat: i64,
    exp: i64,
}

pub struct TokenAuthority {
    enabled: bool,
    encoding: EncodingKey,
    decoding: DecodingKey,
    users: HashMap<String, String>,
}

impl TokenAuthority {
    pub fn new(enabled: bool, secret: &[u8], users: HashMap<String, String>) -> Self {
        Self {
            enabled,
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            users,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn issue(&self, subject: &str, scope: Scope, ttl: Duration) -> Result<String> {
        let now = Utc::now();
        let claims = Claims {
            sub: subject.to_string(),
            scope: scope.as_str().to_string(),
            iat: now.timestamp(),
            exp: (now + ttl).timestamp(),
        };
        encode(&Header::default(), &claims, &self.encoding).map_err(|_| Error::Unauthorized)
    }

    /// The pull-scoped credential handed to the deployment controller.
    /// Regenerated on every start, never persisted.
    pub fn service_pull_token(&self) -> Result<String> {
        self.issue(
            SERVICE_SUBJECT,
            Scope::Pull,
            Duration::hours(SERVICE_TOKEN_TTL_HOURS),
        )
    }

    /// Check a request's `Authorization` header for the required scope.
    /// A no-op when auth is disabled.
    pub fn authorize(&self, header: Option<&str>, required: Scope) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let token = header
            .and_then(|value| value.strip_prefix("Bearer "))
            .ok_or(Error::Unauthorized)?;
        let data = decode::<Claims>(token, &self.decoding, &Validation::default())
            .map_err(|_| Error::Unauthorized)?;
        if Scope::allows(&data.claims.scope, required) {
            Ok(())
        } else {
            Err(Error::Denied)
        }
    }

    /// Exchange basic credentials for a push token.
    pub fn exchange(&self, username: &str, password: &str) -> Result<String> {
        match self.users.get(username) {
            Some(expected) if expected == password => {
                self.issue(username, Scope::Push, Duration::hours(1))
            }
            _ => Err(Error::Unauthorized),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn authority(enabled: bool) -> TokenAuthority {
        let users = HashMap::from([("admin".to_string(), "hunter2".to_string())]);
        TokenAuthority::new(enabled, b"test-secret", users)
    }

    #[test]
    fn disabled_auth_allows_everything() {
        let auth = authority(false);
        assert!(auth.authorize(None, Scope::Push).is_ok());
    }

    #[test]
    fn missing_or_garbage_tokens_are_unauthorized() {
        let auth = authority(true);
        assert!(matches!(
            auth.authorize(None, Scope::Pull),
            Err(Error::Unauthorized)
        ));
        assert!(matches!(
            auth.authorize(Some("Bearer not-a-jwt"), Scope::Pull),
            Err(Error::Unauthorized)
        ));
    }

    #[test]
    fn service_token_pulls_but_cannot_push() {
        let auth = authority(true);
        let token = auth.service_pull_token().unwrap();
        let header = format!("Bearer {token}");
        assert!(auth.authorize(Some(&header), Scope::Pull).is_ok());
        assert!(matches!(
            auth.authorize(Some(&header), Scope::Push),
            Err(Error::Denied)
        ));
    }

    #[test]
    fn basic_exchange_issues_push_tokens() {
        let auth = authority(true);
        let token = auth.exchange("admin", "hunter2").unwrap();
        let header = format!("Bearer {token}");
        assert!(auth.authorize(Some(&header), Scope::Push).is_ok());

        assert!(matches!(
            auth.exchange("admin", "wrong"),
            Err(Error::Unauthorized)
        ));
    }

    #[test]
    fn tokens_from_another_secret_are_rejected() {
        let auth = authority(true);
        let other = TokenAuthority::new(true, b"other-secret", HashMap::new());
        let token = other.service_pull_token().unwrap();
        assert!(auth
            .authorize(Some(&format!("Bearer {token}")), Scope::Pull)
            .is_err());
    }
}
