#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use bytes::BytesMut;
use palaver_domain::{ChatError, Identity, UserId};
use palaver_protocol::framing::{DEFAULT_MAX_FRAME_SIZE, encode_frame, try_decode_frame_from_buffer};
use palaver_protocol::{ClientFrame, ServerFrame};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::server::registry::{ConnId, ShutdownNotice, deliver_all};
use crate::server::state::ServerState;
use crate::server::{moderation, router};
use crate::util::time::unix_ms_now;

/// Per-connection server settings.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
	pub max_frame_bytes: usize,

	/// Capacity of the per-connection outbound queue.
	pub outbound_queue_capacity: usize,

	/// Number of persisted messages returned on room join.
	pub history_limit: u32,
}

impl Default for ConnectionSettings {
	fn default() -> Self {
		Self {
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
			outbound_queue_capacity: 256,
			history_limit: 50,
		}
	}
}

/// Drive one authenticated connection from handshake to teardown.
pub async fn handle_connection(
	conn_id: ConnId,
	connection: quinn::Connection,
	state: Arc<ServerState>,
	settings: ConnectionSettings,
) -> anyhow::Result<()> {
	struct ConnectionGaugeGuard;
	impl Drop for ConnectionGaugeGuard {
		fn drop(&mut self) {
			metrics::gauge!("palaver_server_active_connections").decrement(1.0);
		}
	}

	metrics::gauge!("palaver_server_active_connections").increment(1.0);
	let _conn_guard = ConnectionGaugeGuard;

	let (mut control_send, control_recv) = connection.accept_bi().await.context("accept control stream")?;

	let (ctrl_tx, mut ctrl_rx) = mpsc::unbounded_channel::<ClientFrame>();
	let max_frame_bytes = settings.max_frame_bytes;
	let reader_task = tokio::spawn(run_reader(conn_id, control_recv, ctrl_tx, max_frame_bytes));

	let token = wait_for_hello(&mut ctrl_rx).await?;

	let identity = match authenticate(&state, &token).await {
		Ok(identity) => identity,
		Err(err) => {
			warn!(conn_id, error = %err, "handshake rejected");
			metrics::counter!("palaver_server_auth_rejects_total").increment(1);
			let frame = encode_frame(
				&ServerFrame::Error {
					message: err.to_string(),
				},
				max_frame_bytes,
			)?;
			// The rejection must reach the peer before the connection is dropped.
			control_send.write_all(&frame).await.ok();
			let _ = control_send.finish();
			let _ = tokio::time::timeout(Duration::from_secs(2), control_send.stopped()).await;
			return Ok(());
		}
	};

	info!(
		conn_id,
		user_id = %identity.id,
		username = %identity.username,
		role = %identity.role,
		"authenticated"
	);
	metrics::counter!("palaver_server_authenticated_total").increment(1);

	let (out_tx, out_rx) = mpsc::channel::<ServerFrame>(settings.outbound_queue_capacity);
	let (shutdown_tx, shutdown_rx) = mpsc::channel::<ShutdownNotice>(1);

	let writer_task = tokio::spawn(run_writer(
		conn_id,
		control_send,
		connection.clone(),
		out_rx,
		shutdown_rx,
		max_frame_bytes,
	));

	state
		.registry
		.register(conn_id, identity.clone(), out_tx.clone(), shutdown_tx.clone())
		.await;

	let authenticated = ServerFrame::Authenticated {
		user_id: identity.id,
		username: identity.username.clone(),
		role: identity.role,
	};
	if out_tx.send(authenticated).await.is_err() {
		warn!(conn_id, "connection closed before authenticated ack");
	}

	while let Some(frame) = ctrl_rx.recv().await {
		if let Err(err) = dispatch(&state, conn_id, &identity, &out_tx, &settings, frame).await {
			debug!(conn_id, kind = err.kind(), error = %err, "command rejected");
			metrics::counter!("palaver_server_command_errors_total", "kind" => err.kind()).increment(1);

			let notice = ServerFrame::Error {
				message: err.to_string(),
			};
			if out_tx.send(notice).await.is_err() {
				break;
			}
		}
	}

	// Teardown forces the implicit leave; the registry entry goes away
	// atomically with the membership update.
	if let Some(departure) = state.registry.unregister(conn_id).await {
		info!(conn_id, username = %departure.identity.username, "disconnected");
		if let Some(room_id) = departure.room {
			deliver_all(
				&departure.remaining,
				&ServerFrame::UserLeft {
					username: departure.identity.username,
					room_id,
				},
			);
		}
	}

	drop(out_tx);
	drop(shutdown_tx);
	let _ = reader_task.await;
	let _ = writer_task.await;

	Ok(())
}

/// Read length-prefixed frames off the control stream into the dispatch queue.
async fn run_reader(
	conn_id: ConnId,
	mut control_recv: quinn::RecvStream,
	ctrl_tx: mpsc::UnboundedSender<ClientFrame>,
	max_frame_bytes: usize,
) -> anyhow::Result<()> {
	let mut buf = BytesMut::with_capacity(16 * 1024);
	let mut tmp = [0u8; 8192];

	loop {
		let n = match control_recv.read(&mut tmp).await {
			Ok(Some(n)) => n,
			Ok(None) => return Ok(()),
			Err(e) => {
				debug!(conn_id, error = %e, "control stream read ended");
				return Ok(());
			}
		};

		metrics::counter!("palaver_server_control_bytes_in_total").increment(n as u64);
		buf.extend_from_slice(&tmp[..n]);

		loop {
			match try_decode_frame_from_buffer::<ClientFrame>(&mut buf, max_frame_bytes) {
				Ok(Some(frame)) => {
					metrics::counter!("palaver_server_frames_in_total").increment(1);
					if ctrl_tx.send(frame).is_err() {
						return Ok(());
					}
				}
				Ok(None) => break,
				Err(e) => {
					metrics::counter!("palaver_server_decode_errors_total").increment(1);
					return Err(anyhow!(e).context("failed to decode control frame"));
				}
			}
		}
	}
}

/// Drain the outbound queue onto the control stream. A shutdown notice
/// preempts queued frames: the notice is written, then the transport closes.
async fn run_writer(
	conn_id: ConnId,
	mut control_send: quinn::SendStream,
	connection: quinn::Connection,
	mut out_rx: mpsc::Receiver<ServerFrame>,
	mut shutdown_rx: mpsc::Receiver<ShutdownNotice>,
	max_frame_bytes: usize,
) -> anyhow::Result<()> {
	loop {
		tokio::select! {
			notice = shutdown_rx.recv() => {
				let Some(notice) = notice else { break };

				debug!(conn_id, reason = notice.reason, "terminating connection");
				if let Ok(frame) = encode_frame(&notice.frame, max_frame_bytes) {
					// The notice must reach the peer before the transport goes
					// away; wait (bounded) for the stream to settle.
					control_send.write_all(&frame).await.ok();
					let _ = control_send.finish();
					let _ = tokio::time::timeout(Duration::from_secs(2), control_send.stopped()).await;
				}
				connection.close(quinn::VarInt::from_u32(0), notice.reason.as_bytes());
				return Ok(());
			}
			item = out_rx.recv() => {
				let Some(frame) = item else { break };

				let bytes = encode_frame(&frame, max_frame_bytes)?;
				metrics::counter!("palaver_server_frames_out_total").increment(1);
				metrics::counter!("palaver_server_control_bytes_out_total").increment(bytes.len() as u64);
				if let Err(e) = control_send.write_all(&bytes).await {
					debug!(conn_id, error = %e, "control stream write ended");
					return Ok(());
				}
			}
		}
	}

	let _ = control_send.finish();
	Ok(())
}

async fn wait_for_hello(ctrl_rx: &mut mpsc::UnboundedReceiver<ClientFrame>) -> anyhow::Result<String> {
	while let Some(frame) = ctrl_rx.recv().await {
		if let ClientFrame::Hello { token } = frame {
			return Ok(token);
		}
		// Nothing else is valid before authentication.
	}
	Err(anyhow!("connection closed before hello"))
}

/// One-time credential validation; any failure rejects the handshake.
async fn authenticate(state: &ServerState, token: &str) -> Result<Identity, ChatError> {
	if token.trim().is_empty() {
		return Err(ChatError::Authentication("Authentication token required".to_string()));
	}

	let claims = state.auth.validate_credential(token.trim()).await.map_err(|e| {
		debug!(error = %e, "credential rejected by auth provider");
		ChatError::Authentication("Invalid token".to_string())
	})?;

	let user_id: UserId = claims
		.sub
		.parse()
		.map_err(|_| ChatError::Authentication("Invalid token".to_string()))?;

	let identity = state
		.store
		.identity_by_id(user_id)
		.await
		.map_err(|e| {
			warn!(error = %e, "identity lookup failed");
			ChatError::Authentication("Authentication failed".to_string())
		})?
		.ok_or_else(|| ChatError::Authentication("Authentication failed".to_string()))?;

	Ok(identity)
}

async fn dispatch(
	state: &Arc<ServerState>,
	conn_id: ConnId,
	identity: &Identity,
	reply: &mpsc::Sender<ServerFrame>,
	settings: &ConnectionSettings,
	frame: ClientFrame,
) -> Result<(), ChatError> {
	match frame {
		ClientFrame::Hello { .. } => {
			debug!(conn_id, "ignoring duplicate hello");
			Ok(())
		}

		ClientFrame::Ping { client_time_unix_ms } => {
			let pong = ServerFrame::Pong {
				client_time_unix_ms,
				server_time_unix_ms: unix_ms_now(),
			};
			let _ = reply.send(pong).await;
			Ok(())
		}

		ClientFrame::SendMessage {
			room_id,
			recipient_id,
			content,
		} => router::handle_send_message(state, conn_id, identity, room_id, recipient_id, content).await,

		ClientFrame::JoinRoom { room_id } => {
			router::handle_join_room(state, conn_id, identity, reply, room_id, settings.history_limit).await
		}

		ClientFrame::LeaveRoom { room_id } => router::handle_leave_room(state, conn_id, reply, room_id).await,

		ClientFrame::ListRooms => router::handle_list_rooms(state, reply).await,

		ClientFrame::ListUsers => router::handle_list_users(state, conn_id, reply).await,

		ClientFrame::TypingStart { room_id } => router::handle_typing(state, conn_id, identity, room_id, true).await,

		ClientFrame::TypingStop { room_id } => router::handle_typing(state, conn_id, identity, room_id, false).await,

		ClientFrame::CreateRoom { name, description } => {
			moderation::handle_create_room(state, identity, reply, name, description).await
		}

		ClientFrame::DeleteRoom { room_id } => moderation::handle_delete_room(state, identity, reply, room_id).await,

		ClientFrame::BanUser { username, reason } => {
			moderation::handle_ban_user(state, identity, reply, username, reason).await
		}

		ClientFrame::UnbanUser { username } => moderation::handle_unban_user(state, identity, reply, username).await,

		ClientFrame::KickUser { username, reason } => {
			moderation::handle_kick_user(state, identity, reply, username, reason).await
		}
	}
}
