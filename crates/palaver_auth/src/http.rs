#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{AuthError, AuthProvider, Claims, TokenKind, TokenPair, unix_now_secs};

/// Client for a remote auth provider speaking the v1 HTTP shapes:
/// `GET {base}/auth/user` with a bearer token and `POST {base}/auth/refresh`.
pub struct HttpAuthProvider {
	base_url: String,
	http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct UserResponse {
	id: String,
	#[serde(default)]
	expires_at: Option<u64>,
}

#[derive(Debug, Serialize)]
struct RefreshRequest<'a> {
	refresh_token: &'a str,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
	access_token: String,
	refresh_token: String,
	#[serde(default)]
	expires_at: Option<u64>,
	#[serde(default)]
	expires_in: Option<u64>,
}

impl HttpAuthProvider {
	pub fn new(base_url: impl Into<String>) -> Result<Self, AuthError> {
		let http = reqwest::Client::builder()
			.user_agent(concat!("palaver/", env!("CARGO_PKG_VERSION")))
			.build()
			.map_err(|e| AuthError::Provider(format!("build http client: {e}")))?;

		Ok(Self {
			base_url: base_url.into().trim_end_matches('/').to_string(),
			http,
		})
	}
}

#[async_trait::async_trait]
impl AuthProvider for HttpAuthProvider {
	async fn validate_credential(&self, token: &str) -> Result<Claims, AuthError> {
		let url = format!("{}/auth/user", self.base_url);
		let resp = self
			.http
			.get(&url)
			.bearer_auth(token)
			.send()
			.await
			.map_err(|e| AuthError::Provider(format!("validate request: {e}")))?;

		let status = resp.status();
		if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
			return Err(AuthError::InvalidToken(format!("provider rejected token: {status}")));
		}
		if !status.is_success() {
			return Err(AuthError::Provider(format!("validate failed: status={status}")));
		}

		let user: UserResponse = resp
			.json()
			.await
			.map_err(|e| AuthError::Provider(format!("validate parse json: {e}")))?;

		debug!(subject = %user.id, "credential validated by provider");

		Ok(Claims {
			sub: user.id,
			exp: user.expires_at.unwrap_or(u64::MAX),
			kind: TokenKind::Access,
		})
	}

	async fn exchange_refresh_token(&self, refresh_token: &str) -> Result<TokenPair, AuthError> {
		let url = format!("{}/auth/refresh", self.base_url);
		let resp = self
			.http
			.post(&url)
			.json(&RefreshRequest { refresh_token })
			.send()
			.await
			.map_err(|e| AuthError::Provider(format!("refresh request: {e}")))?;

		let status = resp.status();
		if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
			return Err(AuthError::InvalidToken(format!("provider rejected refresh token: {status}")));
		}
		if !status.is_success() {
			return Err(AuthError::Provider(format!("refresh failed: status={status}")));
		}

		let body: RefreshResponse = resp
			.json()
			.await
			.map_err(|e| AuthError::Provider(format!("refresh parse json: {e}")))?;

		let expires_at = match (body.expires_at, body.expires_in) {
			(Some(at), _) => at,
			(None, Some(secs)) => unix_now_secs().saturating_add(secs),
			(None, None) => {
				return Err(AuthError::Provider(
					"refresh response missing expires_at/expires_in".to_string(),
				));
			}
		};

		Ok(TokenPair {
			access_token: body.access_token,
			refresh_token: body.refresh_token,
			expires_at,
		})
	}
}
