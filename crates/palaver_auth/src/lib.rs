#![forbid(unsafe_code)]

use core::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod hmac;
pub mod http;

pub use hmac::HmacAuthority;
pub use http::HttpAuthProvider;

/// A string holding a secret; redacted from `Debug`/`Display` output.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}

/// Whether a token is usable as an access credential or only for refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
	#[default]
	Access,
	Refresh,
}

/// Claims carried by a validated credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
	/// Subject: the user id the credential was issued for.
	pub sub: String,
	/// Expiry as Unix seconds.
	pub exp: u64,
	#[serde(default)]
	pub kind: TokenKind,
}

/// A freshly issued credential pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
	pub access_token: String,
	pub refresh_token: String,
	/// Access token expiry as Unix seconds.
	pub expires_at: u64,
}

/// Errors produced by credential validation and refresh exchange.
#[derive(Debug, Error)]
pub enum AuthError {
	#[error("invalid token: {0}")]
	InvalidToken(String),

	#[error("token expired")]
	Expired,

	#[error("auth provider error: {0}")]
	Provider(String),
}

/// External authentication collaborator.
///
/// The core treats every error as an authentication failure and never retries;
/// retry policy (if any) belongs to the transport layer.
#[async_trait::async_trait]
pub trait AuthProvider: Send + Sync {
	/// Validate a bearer credential and return its claims.
	async fn validate_credential(&self, token: &str) -> Result<Claims, AuthError>;

	/// Exchange a refresh token for a new credential pair.
	async fn exchange_refresh_token(&self, refresh_token: &str) -> Result<TokenPair, AuthError>;
}

/// Current Unix time in seconds.
pub(crate) fn unix_now_secs() -> u64 {
	std::time::SystemTime::now()
		.duration_since(std::time::UNIX_EPOCH)
		.unwrap_or_default()
		.as_secs()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn secret_string_is_redacted() {
		let secret = SecretString::new("hunter2");
		assert_eq!(format!("{secret:?}"), "SecretString(<redacted>)");
		assert_eq!(secret.to_string(), "<redacted>");
		assert_eq!(secret.expose(), "hunter2");
	}

	#[test]
	fn claims_default_to_access_kind() {
		let claims: Claims = serde_json::from_str(r#"{"sub":"u1","exp":123}"#).unwrap();
		assert_eq!(claims.kind, TokenKind::Access);
	}
}
