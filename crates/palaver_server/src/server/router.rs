#![forbid(unsafe_code)]

use std::sync::Arc;

use chrono::Utc;
use palaver_domain::{ChatError, Identity, MAX_MESSAGE_CHARS, MessageRecord, RoomId, UserId};
use palaver_protocol::{MessageEvent, RoomInfo, ServerFrame, UserInfo};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::server::registry::{ConnId, LeaveOutcome, deliver_all};
use crate::server::state::ServerState;

/// Route one outbound message to exactly its recipient set.
///
/// Persistence happens-before delivery; when the store fails, nothing is
/// delivered and the sender gets a single generic failure.
pub(crate) async fn handle_send_message(
	state: &Arc<ServerState>,
	conn_id: ConnId,
	sender: &Identity,
	room_id: Option<RoomId>,
	recipient_id: Option<UserId>,
	content: String,
) -> Result<(), ChatError> {
	let content = content.trim();
	if content.is_empty() {
		return Err(ChatError::Validation("Message cannot be empty".to_string()));
	}
	if content.chars().count() > MAX_MESSAGE_CHARS {
		return Err(ChatError::Validation(
			"Message too long (max 2000 characters)".to_string(),
		));
	}

	// Exactly one of room / recipient.
	if room_id.is_some() == recipient_id.is_some() {
		return Err(ChatError::Validation(
			"Specify either room_id or recipient_id".to_string(),
		));
	}

	// Checked at send time: a ban issued after connect takes effect immediately.
	let ban = state.store.ban_for(sender.id).await.map_err(|e| {
		warn!(conn_id, error = %e, "ban lookup failed");
		ChatError::Dependency("Failed to send message".to_string())
	})?;
	if ban.is_some() {
		return Err(ChatError::Privilege("You are banned from chatting".to_string()));
	}

	let record = MessageRecord {
		id: uuid::Uuid::new_v4(),
		sender: sender.clone(),
		room_id,
		recipient_id,
		content: content.to_string(),
		created_at: Utc::now(),
	};

	state.store.insert_message(&record).await.map_err(|e| {
		warn!(conn_id, error = %e, "message persist failed");
		ChatError::Dependency("Failed to send message".to_string())
	})?;

	let event = ServerFrame::Message(MessageEvent::from(&record));

	match (room_id, recipient_id) {
		(Some(room), None) => {
			let recipients = state.registry.room_recipients(room).await;
			deliver_all(&recipients, &event);
			metrics::counter!("palaver_server_messages_total", "kind" => "room").increment(1);
			debug!(conn_id, room_id = %room, recipients = recipients.len(), sender = %sender.username, "room message routed");
		}
		(None, Some(recipient)) => {
			// The sender's own connection echoes the message; every live
			// connection of the recipient gets a copy.
			let mut recipients = state.registry.user_recipients(recipient).await;
			if !recipients.iter().any(|r| r.conn_id == conn_id) {
				if let Some(echo) = state.registry.recipient(conn_id).await {
					recipients.push(echo);
				}
			}
			deliver_all(&recipients, &event);
			metrics::counter!("palaver_server_messages_total", "kind" => "direct").increment(1);
			debug!(conn_id, recipient_id = %recipient, recipients = recipients.len(), sender = %sender.username, "direct message routed");
		}
		_ => unreachable!("target exclusivity validated above"),
	}

	Ok(())
}

/// Join a room, implicitly leaving the previous one first.
pub(crate) async fn handle_join_room(
	state: &Arc<ServerState>,
	conn_id: ConnId,
	identity: &Identity,
	reply: &mpsc::Sender<ServerFrame>,
	room_id: RoomId,
	history_limit: u32,
) -> Result<(), ChatError> {
	let room = state
		.store
		.room_by_id(room_id)
		.await
		.map_err(|e| {
			warn!(conn_id, error = %e, "room lookup failed");
			ChatError::Dependency("Failed to join room".to_string())
		})?
		.ok_or_else(|| ChatError::NotFound("Room not found".to_string()))?;

	let Some(switch) = state.registry.join_room(conn_id, room.id).await else {
		// The connection tore down while the command was in flight.
		return Ok(());
	};

	if let Some((old_room, remaining)) = switch.previous {
		deliver_all(
			&remaining,
			&ServerFrame::UserLeft {
				username: identity.username.clone(),
				room_id: old_room,
			},
		);
	}

	if !switch.rejoined {
		deliver_all(
			&switch.others,
			&ServerFrame::UserJoined {
				username: identity.username.clone(),
				room_id: room.id,
			},
		);
	}

	info!(conn_id, username = %identity.username, room = %room.name, "joined room");

	let joined = ServerFrame::JoinedRoom {
		room_id: room.id,
		room_name: room.name.as_str().to_string(),
		description: room.description.clone(),
	};
	let _ = reply.send(joined).await;

	let history = state
		.store
		.recent_room_messages(room.id, history_limit)
		.await
		.map_err(|e| {
			warn!(conn_id, error = %e, "history fetch failed");
			ChatError::Dependency("Failed to join room".to_string())
		})?;

	let history_frame = ServerFrame::MessageHistory {
		room_id: room.id,
		messages: history.iter().map(MessageEvent::from).collect(),
	};
	let _ = reply.send(history_frame).await;

	Ok(())
}

/// Leave the current room; a mismatched room id is a validation error.
pub(crate) async fn handle_leave_room(
	state: &Arc<ServerState>,
	conn_id: ConnId,
	reply: &mpsc::Sender<ServerFrame>,
	room_id: RoomId,
) -> Result<(), ChatError> {
	match state.registry.leave_room(conn_id, room_id).await {
		LeaveOutcome::NotInRoom => Err(ChatError::Validation("You are not in that room".to_string())),
		LeaveOutcome::Left { identity, remaining } => {
			debug!(conn_id, username = %identity.username, room_id = %room_id, "left room");
			deliver_all(
				&remaining,
				&ServerFrame::UserLeft {
					username: identity.username,
					room_id,
				},
			);
			let _ = reply.send(ServerFrame::LeftRoom { room_id }).await;
			Ok(())
		}
	}
}

pub(crate) async fn handle_list_rooms(
	state: &Arc<ServerState>,
	reply: &mpsc::Sender<ServerFrame>,
) -> Result<(), ChatError> {
	let rooms = state.store.list_rooms().await.map_err(|e| {
		warn!(error = %e, "room list failed");
		ChatError::Dependency("Failed to fetch rooms".to_string())
	})?;

	let frame = ServerFrame::RoomsList {
		rooms: rooms.iter().map(RoomInfo::from).collect(),
	};
	let _ = reply.send(frame).await;
	Ok(())
}

/// List the live occupants of the caller's current room.
pub(crate) async fn handle_list_users(
	state: &Arc<ServerState>,
	conn_id: ConnId,
	reply: &mpsc::Sender<ServerFrame>,
) -> Result<(), ChatError> {
	let room_id = state
		.registry
		.current_room(conn_id)
		.await
		.ok_or_else(|| ChatError::Validation("You are not in a room".to_string()))?;

	let users = state
		.registry
		.room_members(room_id)
		.await
		.into_iter()
		.map(|identity| UserInfo {
			username: identity.username,
			role: identity.role,
		})
		.collect();

	let _ = reply.send(ServerFrame::UsersList { room_id, users }).await;
	Ok(())
}

/// Relay a typing indicator to the other members of the room.
pub(crate) async fn handle_typing(
	state: &Arc<ServerState>,
	conn_id: ConnId,
	identity: &Identity,
	room_id: RoomId,
	started: bool,
) -> Result<(), ChatError> {
	let recipients: Vec<_> = state
		.registry
		.room_recipients(room_id)
		.await
		.into_iter()
		.filter(|r| r.conn_id != conn_id)
		.collect();

	let frame = if started {
		ServerFrame::UserTyping {
			username: identity.username.clone(),
			room_id,
		}
	} else {
		ServerFrame::UserStoppedTyping {
			username: identity.username.clone(),
			room_id,
		}
	};

	deliver_all(&recipients, &frame);
	Ok(())
}
