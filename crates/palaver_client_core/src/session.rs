#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use palaver_auth::{AuthError, AuthProvider, TokenPair};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Renewal runs this long before the access credential expires.
pub const REFRESH_BUFFER: Duration = Duration::from_secs(5 * 60);

/// The current credential pair; replaced wholesale on each refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
	pub access_token: String,
	pub refresh_token: String,
	/// Access token expiry as Unix seconds.
	pub expires_at: u64,
}

impl From<TokenPair> for Session {
	fn from(pair: TokenPair) -> Self {
		Self {
			access_token: pair.access_token,
			refresh_token: pair.refresh_token,
			expires_at: pair.expires_at,
		}
	}
}

/// Events delivered to renewal observers, in registration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
	/// The pair was renewed; present this credential on the next reconnect.
	Refreshed { access_token: String },
	/// Renewal failed; the session is gone and a fresh login is required.
	Expired,
}

/// Owns the credential pair and keeps it fresh.
///
/// At most one renewal task is ever pending: setting a new session (or a
/// completed renewal) always cancels-and-replaces the previous one. The
/// coordinator never touches an established transport connection; it only
/// changes the credential used by the next reconnect.
#[derive(Clone)]
pub struct SessionManager {
	auth: Arc<dyn AuthProvider>,
	inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
	session: Option<Session>,
	refresh_task: Option<JoinHandle<()>>,
	observers: Vec<mpsc::UnboundedSender<SessionEvent>>,
}

impl SessionManager {
	pub fn new(auth: Arc<dyn AuthProvider>) -> Self {
		Self {
			auth,
			inner: Arc::new(Mutex::new(Inner::default())),
		}
	}

	/// Install a session and (re)schedule its renewal.
	pub fn set_session(&self, session: Session) {
		let delay = renewal_delay(session.expires_at);
		{
			let mut inner = self.inner.lock().expect("session lock");
			if let Some(task) = inner.refresh_task.take() {
				task.abort();
			}
			inner.session = Some(session);
		}

		debug!(delay_secs = delay.as_secs(), "renewal scheduled");
		self.schedule(delay);
	}

	/// Register a renewal observer. Observers are notified in registration
	/// order; one that went away is skipped and never blocks the rest.
	pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SessionEvent> {
		let (tx, rx) = mpsc::unbounded_channel();
		let mut inner = self.inner.lock().expect("session lock");
		inner.observers.push(tx);
		rx
	}

	pub fn access_token(&self) -> Option<String> {
		let inner = self.inner.lock().expect("session lock");
		inner.session.as_ref().map(|s| s.access_token.clone())
	}

	pub fn session(&self) -> Option<Session> {
		let inner = self.inner.lock().expect("session lock");
		inner.session.clone()
	}

	/// Drop the session and cancel any pending renewal (logout path).
	pub fn clear_session(&self) {
		let mut inner = self.inner.lock().expect("session lock");
		if let Some(task) = inner.refresh_task.take() {
			task.abort();
		}
		inner.session = None;
	}

	/// Exchange the refresh token for a new pair.
	///
	/// On success the session is replaced, observers are notified, and the
	/// next renewal is scheduled. On failure the session is cleared and
	/// observers see [`SessionEvent::Expired`]; the caller must treat this as
	/// a fatal authentication failure, not retry.
	pub async fn refresh(&self) -> Result<Session, AuthError> {
		let refresh_token = {
			let inner = self.inner.lock().expect("session lock");
			inner.session.as_ref().map(|s| s.refresh_token.clone())
		}
		.ok_or_else(|| AuthError::Provider("no refresh token available".to_string()))?;

		debug!("exchanging refresh token");

		match self.auth.exchange_refresh_token(&refresh_token).await {
			Ok(pair) => {
				let session = Session::from(pair);
				let delay = renewal_delay(session.expires_at);
				{
					let mut inner = self.inner.lock().expect("session lock");
					inner.session = Some(session.clone());
					notify(
						&mut inner.observers,
						SessionEvent::Refreshed {
							access_token: session.access_token.clone(),
						},
					);
				}

				debug!(delay_secs = delay.as_secs(), "credential pair refreshed");
				self.schedule(delay);
				Ok(session)
			}
			Err(e) => {
				warn!(error = %e, "refresh failed; clearing session");
				{
					let mut inner = self.inner.lock().expect("session lock");
					if let Some(task) = inner.refresh_task.take() {
						task.abort();
					}
					inner.session = None;
					notify(&mut inner.observers, SessionEvent::Expired);
				}
				Err(e)
			}
		}
	}

	fn schedule(&self, delay: Duration) {
		let manager = self.clone();
		let handle = tokio::spawn(async move {
			if !delay.is_zero() {
				tokio::time::sleep(delay).await;
			}
			if let Err(e) = manager.refresh().await {
				warn!(error = %e, "scheduled renewal failed");
			}
		});

		let mut inner = self.inner.lock().expect("session lock");
		if let Some(old) = inner.refresh_task.replace(handle) {
			old.abort();
		}
	}
}

fn notify(observers: &mut Vec<mpsc::UnboundedSender<SessionEvent>>, event: SessionEvent) {
	observers.retain(|tx| tx.send(event.clone()).is_ok());
}

/// Time until renewal: expiry minus now minus the buffer; zero means renew
/// immediately.
fn renewal_delay(expires_at: u64) -> Duration {
	let now = unix_now_secs();
	Duration::from_secs(expires_at.saturating_sub(now).saturating_sub(REFRESH_BUFFER.as_secs()))
}

fn unix_now_secs() -> u64 {
	std::time::SystemTime::now()
		.duration_since(std::time::UNIX_EPOCH)
		.unwrap_or_default()
		.as_secs()
}
