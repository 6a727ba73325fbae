#![forbid(unsafe_code)]

use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::{AuthError, AuthProvider, Claims, SecretString, TokenKind, TokenPair, unix_now_secs};

/// Local token authority for self-hosted deployments.
///
/// Tokens are `v1.<payload-b64>.<sig-b64>` where the payload is the JSON
/// [`Claims`] and the signature is HMAC-SHA256 over the base64 payload.
pub struct HmacAuthority {
	secret: SecretString,
	access_ttl: Duration,
	refresh_ttl: Duration,
}

impl HmacAuthority {
	pub fn new(secret: SecretString) -> Self {
		Self {
			secret,
			access_ttl: Duration::from_secs(60 * 60),
			refresh_ttl: Duration::from_secs(30 * 24 * 60 * 60),
		}
	}

	pub fn with_ttls(mut self, access_ttl: Duration, refresh_ttl: Duration) -> Self {
		self.access_ttl = access_ttl;
		self.refresh_ttl = refresh_ttl;
		self
	}

	/// Mint a fresh access/refresh pair for `subject`.
	pub fn issue_pair(&self, subject: &str) -> Result<TokenPair, AuthError> {
		let now = unix_now_secs();
		let access_exp = now.saturating_add(self.access_ttl.as_secs());
		let refresh_exp = now.saturating_add(self.refresh_ttl.as_secs());

		let access_token = self.mint(&Claims {
			sub: subject.to_string(),
			exp: access_exp,
			kind: TokenKind::Access,
		})?;
		let refresh_token = self.mint(&Claims {
			sub: subject.to_string(),
			exp: refresh_exp,
			kind: TokenKind::Refresh,
		})?;

		Ok(TokenPair {
			access_token,
			refresh_token,
			expires_at: access_exp,
		})
	}

	fn mint(&self, claims: &Claims) -> Result<String, AuthError> {
		let payload = serde_json::to_vec(claims).map_err(|e| AuthError::Provider(format!("encode claims: {e}")))?;
		let payload_b64 = URL_SAFE_NO_PAD.encode(payload);
		let sig = sign(payload_b64.as_bytes(), self.secret.expose().as_bytes());
		let sig_b64 = URL_SAFE_NO_PAD.encode(sig);
		Ok(format!("v1.{payload_b64}.{sig_b64}"))
	}

	/// Verify signature, expiry, and kind of a token.
	pub fn verify(&self, token: &str, expected_kind: TokenKind) -> Result<Claims, AuthError> {
		let parts = token.split('.').collect::<Vec<_>>();
		if parts.len() != 3 || parts[0] != "v1" {
			return Err(AuthError::InvalidToken("invalid token format".to_string()));
		}

		let payload_b64 = parts[1];
		let sig_b64 = parts[2];

		let payload = URL_SAFE_NO_PAD
			.decode(payload_b64)
			.map_err(|e| AuthError::InvalidToken(format!("decode token payload: {e}")))?;
		let expected_sig = sign(payload_b64.as_bytes(), self.secret.expose().as_bytes());
		let provided_sig = URL_SAFE_NO_PAD
			.decode(sig_b64)
			.map_err(|e| AuthError::InvalidToken(format!("decode token signature: {e}")))?;

		if !constant_time_eq(&expected_sig, &provided_sig) {
			return Err(AuthError::InvalidToken("invalid token signature".to_string()));
		}

		let claims: Claims =
			serde_json::from_slice(&payload).map_err(|e| AuthError::InvalidToken(format!("parse token claims: {e}")))?;

		if claims.exp <= unix_now_secs() {
			return Err(AuthError::Expired);
		}
		if claims.kind != expected_kind {
			return Err(AuthError::InvalidToken("wrong token kind".to_string()));
		}

		Ok(claims)
	}
}

#[async_trait::async_trait]
impl AuthProvider for HmacAuthority {
	async fn validate_credential(&self, token: &str) -> Result<Claims, AuthError> {
		self.verify(token, TokenKind::Access)
	}

	async fn exchange_refresh_token(&self, refresh_token: &str) -> Result<TokenPair, AuthError> {
		let claims = self.verify(refresh_token, TokenKind::Refresh)?;
		self.issue_pair(&claims.sub)
	}
}

fn sign(payload_b64: &[u8], secret: &[u8]) -> Vec<u8> {
	let mut mac = Hmac::<Sha256>::new_from_slice(secret).expect("hmac key");
	mac.update(payload_b64);
	mac.finalize().into_bytes().to_vec()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
	if a.len() != b.len() {
		return false;
	}

	let mut diff = 0u8;
	for (x, y) in a.iter().zip(b.iter()) {
		diff |= x ^ y;
	}

	diff == 0
}

#[cfg(test)]
mod tests {
	use super::*;

	fn authority() -> HmacAuthority {
		HmacAuthority::new(SecretString::new("test-secret"))
	}

	#[tokio::test]
	async fn issued_access_token_validates() {
		let authority = authority();
		let pair = authority.issue_pair("user-1").unwrap();

		let claims = authority.validate_credential(&pair.access_token).await.unwrap();
		assert_eq!(claims.sub, "user-1");
		assert_eq!(claims.kind, TokenKind::Access);
		assert!(claims.exp > unix_now_secs());
	}

	#[tokio::test]
	async fn refresh_token_is_not_an_access_credential() {
		let authority = authority();
		let pair = authority.issue_pair("user-1").unwrap();

		let err = authority.validate_credential(&pair.refresh_token).await.unwrap_err();
		assert!(matches!(err, AuthError::InvalidToken(_)));
	}

	#[tokio::test]
	async fn exchange_returns_a_new_pair_for_the_same_subject() {
		let authority = authority();
		let pair = authority.issue_pair("user-1").unwrap();

		let renewed = authority.exchange_refresh_token(&pair.refresh_token).await.unwrap();
		let claims = authority.validate_credential(&renewed.access_token).await.unwrap();
		assert_eq!(claims.sub, "user-1");
	}

	#[tokio::test]
	async fn expired_token_is_rejected() {
		let authority = HmacAuthority::new(SecretString::new("test-secret"))
			.with_ttls(Duration::from_secs(0), Duration::from_secs(0));
		let pair = authority.issue_pair("user-1").unwrap();

		let err = authority.validate_credential(&pair.access_token).await.unwrap_err();
		assert!(matches!(err, AuthError::Expired));
	}

	#[tokio::test]
	async fn tampered_payload_is_rejected() {
		let authority = authority();
		let pair = authority.issue_pair("user-1").unwrap();

		let mut parts = pair.access_token.split('.').map(str::to_string).collect::<Vec<_>>();
		let forged = Claims {
			sub: "user-2".to_string(),
			exp: unix_now_secs() + 3600,
			kind: TokenKind::Access,
		};
		parts[1] = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&forged).unwrap());
		let forged_token = parts.join(".");

		let err = authority.validate_credential(&forged_token).await.unwrap_err();
		assert!(matches!(err, AuthError::InvalidToken(_)));
	}

	#[tokio::test]
	async fn other_secret_is_rejected() {
		let pair = authority().issue_pair("user-1").unwrap();

		let other = HmacAuthority::new(SecretString::new("different-secret"));
		assert!(other.validate_credential(&pair.access_token).await.is_err());
	}

	#[test]
	fn garbage_is_rejected() {
		let authority = authority();
		assert!(authority.verify("", TokenKind::Access).is_err());
		assert!(authority.verify("v2.a.b", TokenKind::Access).is_err());
		assert!(authority.verify("not a token", TokenKind::Access).is_err());
	}
}
