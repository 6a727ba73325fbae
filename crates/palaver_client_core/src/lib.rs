#![forbid(unsafe_code)]

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use bytes::BytesMut;
use palaver_domain::{Identity, RoomId, UserId};
use palaver_protocol::framing::{DEFAULT_MAX_FRAME_SIZE, FramingError, encode_frame, try_decode_frame_from_buffer};
use palaver_protocol::{ClientFrame, ServerFrame};
use palaver_util::endpoint::QuicEndpoint;
use quinn::{ClientConfig as QuinnClientConfig, Endpoint, TransportConfig, VarInt};
use tokio::io::AsyncWriteExt as _;
use tracing::{debug, info};

pub mod reconnect;
pub mod session;

pub use reconnect::{RECONNECT_RESET_AFTER, schedule_reconnect};
pub use session::{Session, SessionEvent, SessionManager};

/// Client session configuration (v1).
#[derive(Debug, Clone)]
pub struct ClientConfig {
	/// Remote server host (DNS name or IP literal).
	pub server_host: String,

	/// Remote server UDP port.
	pub server_port: u16,

	/// Resolved remote server address override.
	pub server_addr: Option<SocketAddr>,

	/// Bearer credential presented in the handshake.
	pub token: Option<String>,

	/// Maximum inbound/outbound frame size.
	pub max_frame_bytes: usize,

	/// Timeout for connect + handshake.
	pub connect_timeout: Duration,
}

impl ClientConfig {
	/// Parse a `quic://host:port` endpoint into `(host, port)`.
	pub fn parse_quic_endpoint(endpoint: &str) -> Result<(String, u16), ClientCoreError> {
		let e = QuicEndpoint::parse(endpoint)
			.map_err(|msg| ClientCoreError::Protocol(format!("invalid endpoint (expected quic://host:port): {msg}")))?;
		Ok((e.host, e.port))
	}

	/// Convenience: create a config from `quic://host:port`.
	pub fn from_quic_endpoint(endpoint: &str) -> Result<Self, ClientCoreError> {
		let (host, port) = Self::parse_quic_endpoint(endpoint)?;
		Ok(Self {
			server_host: host,
			server_port: port,
			server_addr: None,
			..Self::default()
		})
	}
}

impl Default for ClientConfig {
	fn default() -> Self {
		// Local dev default.
		Self {
			server_host: "localhost".to_string(),
			server_port: 18303,
			server_addr: Some("127.0.0.1:18303".parse().expect("valid default addr")),
			token: None,
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
			connect_timeout: Duration::from_secs(15),
		}
	}
}

/// Errors for client core operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientCoreError {
	/// QUIC endpoint setup failed.
	#[error("failed to create QUIC endpoint: {0}")]
	Endpoint(String),

	/// Connection establishment failed.
	#[error("failed to connect: {0}")]
	Connect(String),

	/// The server rejected the handshake credential.
	#[error("authentication failed: {0}")]
	Authentication(String),

	/// Protocol framing error.
	#[error(transparent)]
	Framing(#[from] FramingError),

	/// Protocol error (unexpected message ordering/types).
	#[error("protocol error: {0}")]
	Protocol(String),

	/// IO error.
	#[error("io error: {0}")]
	Io(String),

	/// Other error.
	#[error("error: {0}")]
	Other(String),
}

impl From<anyhow::Error> for ClientCoreError {
	fn from(e: anyhow::Error) -> Self {
		ClientCoreError::Other(format!("{e:#}"))
	}
}

/// Command half of a session: fire-and-forget frame writers. Responses and
/// pushed events all arrive on the [`SessionEvents`] half.
pub struct ClientSession {
	conn: quinn::Connection,
	send: quinn::SendStream,
	max_frame_bytes: usize,
}

/// Event reader half of a session.
pub struct SessionEvents {
	recv: quinn::RecvStream,
	buf: BytesMut,
	max_frame_bytes: usize,
}

impl ClientSession {
	/// Connect and perform the v1 handshake: send `hello`, wait for
	/// `authenticated`. Any `error` frame fails the handshake.
	pub async fn connect(cfg: ClientConfig) -> Result<(Self, SessionEvents, Identity), ClientCoreError> {
		let endpoint = make_client_endpoint().map_err(|e| ClientCoreError::Endpoint(format!("{e:#}")))?;

		let quinn_cfg = make_insecure_client_config().map_err(|e| ClientCoreError::Endpoint(format!("{e:#}")))?;

		let connect_timeout = cfg.connect_timeout;
		let server_name = cfg.server_host.clone();

		let candidates: Vec<SocketAddr> = match cfg.server_addr {
			Some(addr) => vec![addr],
			None => {
				let hostport = format!("{}:{}", cfg.server_host, cfg.server_port);
				let addrs = hostport
					.to_socket_addrs()
					.map_err(|e| ClientCoreError::Connect(format!("failed to resolve {hostport}: {e}")))?;

				let addrs: Vec<SocketAddr> = addrs.collect();
				if addrs.is_empty() {
					return Err(ClientCoreError::Connect(format!(
						"DNS resolution returned no addresses for {hostport}"
					)));
				}
				addrs
			}
		};

		let mut last_err: Option<String> = None;
		let mut conn: Option<quinn::Connection> = None;

		for server_addr in candidates {
			let connecting = endpoint
				.connect_with(quinn_cfg.clone(), server_addr, &server_name)
				.map_err(|e| ClientCoreError::Connect(format!("connect_with({server_addr}, sni={server_name}): {e}")))?;

			match tokio::time::timeout(connect_timeout, connecting).await {
				Ok(Ok(c)) => {
					conn = Some(c);
					break;
				}
				Ok(Err(e)) => {
					last_err = Some(format!("connect failed (addr={server_addr}, sni={server_name}): {e}"));
				}
				Err(_) => {
					last_err = Some(format!(
						"connect timeout after {connect_timeout:?} (addr={server_addr}, sni={server_name})"
					));
				}
			}
		}

		let conn = conn.ok_or_else(|| {
			ClientCoreError::Connect(
				last_err.unwrap_or_else(|| format!("connect failed (no addresses attempted) (sni={server_name})")),
			)
		})?;

		info!(remote = %conn.remote_address(), "connected");

		let (mut send, recv) = tokio::time::timeout(connect_timeout, conn.open_bi())
			.await
			.map_err(|_| ClientCoreError::Io(format!("timeout opening control stream after {connect_timeout:?}")))?
			.map_err(|e| ClientCoreError::Io(format!("open_bi(control) failed: {e}")))?;

		let hello = ClientFrame::Hello {
			token: cfg.token.unwrap_or_default(),
		};
		let frame = encode_frame(&hello, cfg.max_frame_bytes).map_err(ClientCoreError::Framing)?;
		send.write_all(&frame)
			.await
			.map_err(|e| ClientCoreError::Io(format!("send hello failed: {e}")))?;
		send.flush()
			.await
			.map_err(|e| ClientCoreError::Io(format!("flush hello failed: {e}")))?;

		let mut events = SessionEvents {
			recv,
			buf: BytesMut::with_capacity(8 * 1024),
			max_frame_bytes: cfg.max_frame_bytes,
		};

		let ack = tokio::time::timeout(connect_timeout, events.next_frame())
			.await
			.map_err(|_| ClientCoreError::Protocol(format!("timeout waiting for authenticated after {connect_timeout:?}")))??
			.ok_or_else(|| ClientCoreError::Protocol("stream closed before authenticated".to_string()))?;

		let identity = match ack {
			ServerFrame::Authenticated { user_id, username, role } => Identity {
				id: user_id,
				username,
				role,
			},
			ServerFrame::Error { message } => return Err(ClientCoreError::Authentication(message)),
			other => {
				return Err(ClientCoreError::Protocol(format!("expected authenticated, got {other:?}")));
			}
		};

		debug!(
			user_id = %identity.id,
			username = %identity.username,
			role = %identity.role,
			"received authenticated"
		);

		let session = Self {
			conn,
			send,
			max_frame_bytes: cfg.max_frame_bytes,
		};

		Ok((session, events, identity))
	}

	async fn write_frame(&mut self, frame: &ClientFrame) -> Result<(), ClientCoreError> {
		let bytes = encode_frame(frame, self.max_frame_bytes).map_err(ClientCoreError::Framing)?;
		self.send
			.write_all(&bytes)
			.await
			.map_err(|e| ClientCoreError::Io(e.to_string()))?;
		self.send.flush().await.map_err(|e| ClientCoreError::Io(e.to_string()))?;
		Ok(())
	}

	/// Send a message to a room.
	pub async fn send_message(&mut self, room_id: RoomId, content: impl Into<String>) -> Result<(), ClientCoreError> {
		self.write_frame(&ClientFrame::SendMessage {
			room_id: Some(room_id),
			recipient_id: None,
			content: content.into(),
		})
		.await
	}

	/// Send a direct message to a user.
	pub async fn send_direct_message(
		&mut self,
		recipient_id: UserId,
		content: impl Into<String>,
	) -> Result<(), ClientCoreError> {
		self.write_frame(&ClientFrame::SendMessage {
			room_id: None,
			recipient_id: Some(recipient_id),
			content: content.into(),
		})
		.await
	}

	pub async fn join_room(&mut self, room_id: RoomId) -> Result<(), ClientCoreError> {
		self.write_frame(&ClientFrame::JoinRoom { room_id }).await
	}

	pub async fn leave_room(&mut self, room_id: RoomId) -> Result<(), ClientCoreError> {
		self.write_frame(&ClientFrame::LeaveRoom { room_id }).await
	}

	pub async fn list_rooms(&mut self) -> Result<(), ClientCoreError> {
		self.write_frame(&ClientFrame::ListRooms).await
	}

	pub async fn list_users(&mut self) -> Result<(), ClientCoreError> {
		self.write_frame(&ClientFrame::ListUsers).await
	}

	pub async fn typing_start(&mut self, room_id: RoomId) -> Result<(), ClientCoreError> {
		self.write_frame(&ClientFrame::TypingStart { room_id }).await
	}

	pub async fn typing_stop(&mut self, room_id: RoomId) -> Result<(), ClientCoreError> {
		self.write_frame(&ClientFrame::TypingStop { room_id }).await
	}

	/// Send a keepalive ping; the pong arrives on the events half.
	pub async fn ping(&mut self, client_time_unix_ms: i64) -> Result<(), ClientCoreError> {
		self.write_frame(&ClientFrame::Ping { client_time_unix_ms }).await
	}

	pub async fn create_room(
		&mut self,
		name: impl Into<String>,
		description: Option<String>,
	) -> Result<(), ClientCoreError> {
		self.write_frame(&ClientFrame::CreateRoom {
			name: name.into(),
			description,
		})
		.await
	}

	pub async fn delete_room(&mut self, room_id: RoomId) -> Result<(), ClientCoreError> {
		self.write_frame(&ClientFrame::DeleteRoom { room_id }).await
	}

	pub async fn ban_user(&mut self, username: impl Into<String>, reason: Option<String>) -> Result<(), ClientCoreError> {
		self.write_frame(&ClientFrame::BanUser {
			username: username.into(),
			reason,
		})
		.await
	}

	pub async fn unban_user(&mut self, username: impl Into<String>) -> Result<(), ClientCoreError> {
		self.write_frame(&ClientFrame::UnbanUser {
			username: username.into(),
		})
		.await
	}

	pub async fn kick_user(&mut self, username: impl Into<String>, reason: Option<String>) -> Result<(), ClientCoreError> {
		self.write_frame(&ClientFrame::KickUser {
			username: username.into(),
			reason,
		})
		.await
	}

	pub fn close(&self, code: u32, reason: &str) {
		self.conn.close(VarInt::from_u32(code), reason.as_bytes());
	}
}

impl SessionEvents {
	/// Read the next server frame; `None` on clean end-of-stream.
	pub async fn next_frame(&mut self) -> Result<Option<ServerFrame>, ClientCoreError> {
		let mut tmp = [0u8; 8192];

		loop {
			match try_decode_frame_from_buffer::<ServerFrame>(&mut self.buf, self.max_frame_bytes) {
				Ok(Some(frame)) => return Ok(Some(frame)),
				Ok(None) => {}
				Err(e) => return Err(ClientCoreError::Framing(e)),
			}

			let n = match self.recv.read(&mut tmp).await {
				Ok(Some(n)) => n,
				Ok(None) => {
					if self.buf.is_empty() {
						return Ok(None);
					}
					return Err(ClientCoreError::Protocol(
						"stream closed mid-frame".to_string(),
					));
				}
				Err(e) => return Err(ClientCoreError::Io(e.to_string())),
			};

			self.buf.extend_from_slice(&tmp[..n]);
		}
	}

	/// Run the events loop until end-of-stream or error.
	pub async fn run_events_loop<F>(&mut self, mut on_event: F) -> Result<(), ClientCoreError>
	where
		F: FnMut(ServerFrame),
	{
		while let Some(frame) = self.next_frame().await? {
			on_event(frame);
		}
		info!("events stream closed");
		Ok(())
	}
}

fn make_client_endpoint() -> anyhow::Result<Endpoint> {
	let addr: SocketAddr = "0.0.0.0:0".parse().context("parse wildcard addr")?;
	let endpoint = Endpoint::client(addr).context("create client endpoint")?;
	Ok(endpoint)
}

/// Dev-only TLS config that skips server cert validation.
fn make_insecure_client_config() -> anyhow::Result<QuinnClientConfig> {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

	#[derive(Debug)]
	struct NoVerifier;

	impl rustls::client::danger::ServerCertVerifier for NoVerifier {
		fn verify_server_cert(
			&self,
			_end_entity: &rustls::pki_types::CertificateDer<'_>,
			_intermediates: &[rustls::pki_types::CertificateDer<'_>],
			_server_name: &rustls::pki_types::ServerName<'_>,
			_ocsp_response: &[u8],
			_now: rustls::pki_types::UnixTime,
		) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
			Ok(rustls::client::danger::ServerCertVerified::assertion())
		}

		fn verify_tls12_signature(
			&self,
			_message: &[u8],
			_cert: &rustls::pki_types::CertificateDer<'_>,
			_dss: &rustls::DigitallySignedStruct,
		) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
			Err(rustls::Error::General("TLS1.2 not supported".into()))
		}

		fn verify_tls13_signature(
			&self,
			_message: &[u8],
			_cert: &rustls::pki_types::CertificateDer<'_>,
			_dss: &rustls::DigitallySignedStruct,
		) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
			Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
		}

		fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
			vec![
				rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
				rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
				rustls::SignatureScheme::RSA_PSS_SHA256,
				rustls::SignatureScheme::RSA_PSS_SHA384,
				rustls::SignatureScheme::RSA_PSS_SHA512,
				rustls::SignatureScheme::ED25519,
			]
		}
	}

	let mut tls = rustls::ClientConfig::builder()
		.with_root_certificates(rustls::RootCertStore::empty())
		.with_no_client_auth();

	tls.dangerous().set_certificate_verifier(Arc::new(NoVerifier));
	tls.alpn_protocols = vec![b"palaver-v1".to_vec()];

	let quic_tls = quinn::crypto::rustls::QuicClientConfig::try_from(tls)?;

	let mut cfg = QuinnClientConfig::new(Arc::new(quic_tls));

	let mut transport = TransportConfig::default();
	transport.max_concurrent_bidi_streams(VarInt::from_u32(16));
	transport.max_concurrent_uni_streams(VarInt::from_u32(16));
	cfg.transport_config(Arc::new(transport));

	Ok(cfg)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn default_config_is_sane() {
		let cfg = ClientConfig::default();
		assert_eq!(cfg.server_host, "localhost");
		assert!(cfg.max_frame_bytes > 0);
	}

	#[test]
	fn from_quic_endpoint_parses_host_and_port() {
		let cfg = ClientConfig::from_quic_endpoint("quic://chat.example.com:443").unwrap();
		assert_eq!(cfg.server_host, "chat.example.com");
		assert_eq!(cfg.server_port, 443);
		assert!(cfg.server_addr.is_none());

		assert!(ClientConfig::from_quic_endpoint("tcp://nope:1").is_err());
	}
}
