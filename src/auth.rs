use std::fmt;

use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;

use crate::limits::MAX_AUTH_TOKEN_LEN;

/// Session metadata key holding the caller's `Authorization` value.
pub const AUTH_TOKEN_KEY: &str = "auth_token";

/// Cleartext password for the wire startup handshake.
#[derive(Debug)]
pub struct BookdAuthSource {
    password: String,
}

impl BookdAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for BookdAuthSource {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

/// A bearer credential as the caller sent it. The engine never inspects it;
/// it is forwarded verbatim to the services that own users and listings.
#[derive(Clone, PartialEq, Eq)]
pub struct BearerToken(String);

impl BearerToken {
    /// Accepts `Bearer <token>` (scheme case-insensitive) and rejects empty,
    /// oversized, or multi-line values.
    pub fn parse(header: &str) -> Result<Self, String> {
        let header = header.trim();
        if header.len() > MAX_AUTH_TOKEN_LEN {
            return Err("authorization token too long".into());
        }
        if header.contains(['\r', '\n']) {
            return Err("authorization token contains line breaks".into());
        }
        let Some((scheme, token)) = header.split_once(' ') else {
            return Err("authorization must be 'Bearer <token>'".into());
        };
        if !scheme.eq_ignore_ascii_case("bearer") || token.trim().is_empty() {
            return Err("authorization must be 'Bearer <token>'".into());
        }
        Ok(Self(header.to_string()))
    }

    /// The full `Authorization` header value.
    pub fn as_header(&self) -> &str {
        &self.0
    }
}

// Keep credentials out of logs.
impl fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BearerToken(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_bearer_scheme() {
        let t = BearerToken::parse("Bearer abc.def").unwrap();
        assert_eq!(t.as_header(), "Bearer abc.def");
        assert!(BearerToken::parse("bearer abc").is_ok());
        assert_eq!(BearerToken::parse("  Bearer abc  ").unwrap().as_header(), "Bearer abc");
    }

    #[test]
    fn rejects_malformed() {
        assert!(BearerToken::parse("").is_err());
        assert!(BearerToken::parse("Bearer").is_err());
        assert!(BearerToken::parse("Bearer   ").is_err());
        assert!(BearerToken::parse("Basic abc").is_err());
        assert!(BearerToken::parse("Bearer a\r\nX-Evil: 1").is_err());
        let long = format!("Bearer {}", "x".repeat(MAX_AUTH_TOKEN_LEN));
        assert!(BearerToken::parse(&long).is_err());
    }

    #[test]
    fn debug_hides_token() {
        let t = BearerToken::parse("Bearer secret").unwrap();
        assert!(!format!("{t:?}").contains("secret"));
    }
}
