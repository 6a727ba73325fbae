#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use palaver_auth::HttpAuthProvider;
use palaver_client_core::{ClientConfig, ClientSession, Session, SessionEvent, SessionManager};
use palaver_domain::RoomId;
use palaver_protocol::ServerFrame;
use tracing::{info, warn};

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: palaver_client [--connect quic://host:port] [--addr ip:port] [--room room-id]\n\
\n\
Options:\n\
\t--connect   Server endpoint (default: quic://127.0.0.1:18303)\n\
\t            Format: quic://host:port\n\
\t--addr      Server SocketAddr (overrides DNS resolution from --connect)\n\
\t--room      Room id (UUID) to join after authenticating\n\
\t--help      Show this help\n\
\n\
The bearer credential is read from PALAVER_CLIENT_TOKEN. Alternatively set\n\
PALAVER_AUTH_URL and PALAVER_REFRESH_TOKEN to exchange a stored refresh token\n\
at startup and keep the credential renewed in the background.\n\
\n\
Examples:\n\
\tPALAVER_CLIENT_TOKEN=... palaver_client --connect quic://127.0.0.1:18303\n\
\tPALAVER_CLIENT_TOKEN=... palaver_client --room 8f9b6c1e-0d5a-4f2e-9b3c-1a2b3c4d5e6f\n"
	);
	std::process::exit(2)
}

fn env_non_empty(key: &str) -> Option<String> {
	std::env::var(key).ok().and_then(|v| {
		let v = v.trim().to_string();
		(!v.is_empty()).then_some(v)
	})
}

/// Exchange a stored refresh token for a fresh pair and keep it renewed.
async fn bootstrap_session(auth_url: String, refresh_token: String) -> anyhow::Result<(SessionManager, String)> {
	let provider = Arc::new(HttpAuthProvider::new(auth_url)?);
	let manager = SessionManager::new(provider);
	let mut events = manager.subscribe();

	// An already-expired placeholder forces an immediate exchange.
	manager.set_session(Session {
		access_token: String::new(),
		refresh_token,
		expires_at: 0,
	});

	let access_token = match events.recv().await {
		Some(SessionEvent::Refreshed { access_token }) => access_token,
		Some(SessionEvent::Expired) | None => {
			anyhow::bail!("refresh token exchange failed; log in again");
		}
	};

	tokio::spawn(async move {
		while let Some(event) = events.recv().await {
			match event {
				SessionEvent::Refreshed { .. } => {
					info!("credential renewed; the next reconnect uses the new token");
				}
				SessionEvent::Expired => {
					warn!("session expired and could not be renewed; log in again");
					break;
				}
			}
		}
	});

	Ok((manager, access_token))
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,palaver_client_core=debug".to_string());
	tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

fn parse_args() -> (String, Option<SocketAddr>, Option<RoomId>) {
	let mut endpoint = "quic://127.0.0.1:18303".to_string();
	let mut addr_override: Option<SocketAddr> = None;
	let mut room: Option<RoomId> = None;

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--connect" | "--endpoint" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--connect must be non-empty (expected quic://host:port)");
					usage_and_exit();
				}
				endpoint = v;
			}
			"--addr" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				let parsed: SocketAddr = v.parse().unwrap_or_else(|_| {
					eprintln!("Invalid --addr value: {v}");
					usage_and_exit()
				});
				addr_override = Some(parsed);
			}
			"--room" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				let parsed: RoomId = v.parse().unwrap_or_else(|_| {
					eprintln!("Invalid --room value (expected a UUID): {v}");
					usage_and_exit()
				});
				room = Some(parsed);
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	(endpoint, addr_override, room)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();
	let (endpoint, addr_override, room) = parse_args();

	let mut cfg = ClientConfig::from_quic_endpoint(&endpoint).unwrap_or_else(|e| {
		eprintln!("Invalid --connect value: {endpoint}\n{e}");
		usage_and_exit();
	});
	cfg.server_addr = addr_override;

	let _session_manager = match (env_non_empty("PALAVER_AUTH_URL"), env_non_empty("PALAVER_REFRESH_TOKEN")) {
		(Some(auth_url), Some(refresh_token)) => {
			let (manager, access_token) = bootstrap_session(auth_url, refresh_token).await?;
			cfg.token = Some(access_token);
			Some(manager)
		}
		_ => {
			cfg.token = env_non_empty("PALAVER_CLIENT_TOKEN");
			None
		}
	};

	info!(server = %endpoint, "connecting");

	let (mut session, mut events, identity) = ClientSession::connect(cfg).await?;
	info!(username = %identity.username, role = %identity.role, "authenticated");

	session.list_rooms().await?;
	if let Some(room_id) = room {
		session.join_room(room_id).await?;
	}

	events
		.run_events_loop(|frame| match frame {
			ServerFrame::Message(msg) => {
				println!("[{}] {}: {}", msg.created_at.format("%H:%M:%S"), msg.username, msg.content);
			}
			ServerFrame::MessageHistory { messages, .. } => {
				for msg in messages {
					println!("[{}] {}: {}", msg.created_at.format("%H:%M:%S"), msg.username, msg.content);
				}
			}
			ServerFrame::RoomsList { rooms } => {
				for room in rooms {
					println!("#{} ({})", room.name, room.id);
				}
			}
			ServerFrame::JoinedRoom { room_name, .. } => println!("-- joined #{room_name}"),
			ServerFrame::UserJoined { username, .. } => println!("-- {username} joined"),
			ServerFrame::UserLeft { username, .. } => println!("-- {username} left"),
			ServerFrame::RoomCreated { room } => println!("-- new room #{}", room.name),
			ServerFrame::RoomDeleted { room_name, .. } => println!("-- room #{room_name} was deleted"),
			ServerFrame::Banned { reason, by } => println!("** banned by {by}: {reason}"),
			ServerFrame::Kicked { reason, by } => println!("** kicked by {by}: {reason}"),
			ServerFrame::Error { message } => warn!(%message, "server error"),
			ServerFrame::Success { message } => info!(%message, "ok"),
			other => {
				tracing::debug!(?other, "event");
			}
		})
		.await?;

	Ok(())
}
