#![forbid(unsafe_code)]

use std::sync::Arc;

use chrono::Utc;
use palaver_domain::{Ban, ChatError, Identity, Room, RoomId, RoomName};
use palaver_protocol::{RoomInfo, ServerFrame};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::server::registry::deliver_all;
use crate::server::state::ServerState;
use crate::server::store::StoreError;

const DEFAULT_REASON: &str = "No reason provided";

/// Privilege gate: every moderation operation checks this first; a non-admin
/// attempt has no side effects.
fn require_admin(actor: &Identity) -> Result<(), ChatError> {
	if actor.is_admin() {
		Ok(())
	} else {
		Err(ChatError::Privilege("Admin privileges required".to_string()))
	}
}

pub(crate) async fn handle_create_room(
	state: &Arc<ServerState>,
	actor: &Identity,
	reply: &mpsc::Sender<ServerFrame>,
	name: String,
	description: Option<String>,
) -> Result<(), ChatError> {
	require_admin(actor)?;

	let name = RoomName::new(&name)?;
	let room = Room {
		id: RoomId::new_v4(),
		name,
		description: description.filter(|d| !d.trim().is_empty()),
		created_by: actor.id,
		created_at: Utc::now(),
	};

	match state.store.insert_room(&room).await {
		Ok(()) => {}
		Err(StoreError::Conflict) => {
			return Err(ChatError::Conflict("Room name already exists".to_string()));
		}
		Err(StoreError::Backend(e)) => {
			warn!(error = %e, "room insert failed");
			return Err(ChatError::Dependency("Failed to create room".to_string()));
		}
	}

	info!(admin = %actor.username, room = %room.name, "room created");
	metrics::counter!("palaver_server_moderation_total", "op" => "create_room").increment(1);

	let everyone = state.registry.all_recipients().await;
	deliver_all(
		&everyone,
		&ServerFrame::RoomCreated {
			room: RoomInfo::from(&room),
		},
	);

	let ack = ServerFrame::Success {
		message: format!("Room #{} created successfully", room.name),
	};
	let _ = reply.send(ack).await;
	Ok(())
}

pub(crate) async fn handle_delete_room(
	state: &Arc<ServerState>,
	actor: &Identity,
	reply: &mpsc::Sender<ServerFrame>,
	room_id: RoomId,
) -> Result<(), ChatError> {
	require_admin(actor)?;

	let room = state
		.store
		.room_by_id(room_id)
		.await
		.map_err(|e| {
			warn!(error = %e, "room lookup failed");
			ChatError::Dependency("Failed to delete room".to_string())
		})?
		.ok_or_else(|| ChatError::NotFound("Room not found".to_string()))?;

	// Message cascade is the store's responsibility.
	let deleted = state.store.delete_room(room_id).await.map_err(|e| {
		warn!(error = %e, "room delete failed");
		ChatError::Dependency("Failed to delete room".to_string())
	})?;
	if !deleted {
		return Err(ChatError::NotFound("Room not found".to_string()));
	}

	info!(admin = %actor.username, room = %room.name, "room deleted");
	metrics::counter!("palaver_server_moderation_total", "op" => "delete_room").increment(1);

	let notice = ServerFrame::RoomDeleted {
		room_id,
		room_name: room.name.as_str().to_string(),
	};

	// Evict current members first, then tell every client so idle room lists
	// update too.
	let evicted = state.registry.clear_room(room_id).await;
	deliver_all(&evicted, &notice);

	let everyone = state.registry.all_recipients().await;
	deliver_all(&everyone, &notice);

	let ack = ServerFrame::Success {
		message: format!("Room {} has been deleted", room.name),
	};
	let _ = reply.send(ack).await;
	Ok(())
}

pub(crate) async fn handle_ban_user(
	state: &Arc<ServerState>,
	actor: &Identity,
	reply: &mpsc::Sender<ServerFrame>,
	username: String,
	reason: Option<String>,
) -> Result<(), ChatError> {
	require_admin(actor)?;

	let username = username.trim().to_string();
	if username.is_empty() {
		return Err(ChatError::Validation("Username required".to_string()));
	}

	let target = state
		.store
		.identity_by_username(&username)
		.await
		.map_err(|e| {
			warn!(error = %e, "target lookup failed");
			ChatError::Dependency("Failed to ban user".to_string())
		})?
		.ok_or_else(|| ChatError::NotFound("User not found".to_string()))?;

	if target.is_admin() {
		return Err(ChatError::Validation("Cannot ban admin users".to_string()));
	}

	let existing = state.store.ban_for(target.id).await.map_err(|e| {
		warn!(error = %e, "ban lookup failed");
		ChatError::Dependency("Failed to ban user".to_string())
	})?;
	if existing.is_some() {
		return Err(ChatError::Conflict("User is already banned".to_string()));
	}

	let reason = reason
		.filter(|r| !r.trim().is_empty())
		.unwrap_or_else(|| DEFAULT_REASON.to_string());

	let ban = Ban {
		user_id: target.id,
		banned_by: actor.id,
		reason: reason.clone(),
		created_at: Utc::now(),
	};
	match state.store.insert_ban(&ban).await {
		Ok(()) => {}
		Err(StoreError::Conflict) => {
			return Err(ChatError::Conflict("User is already banned".to_string()));
		}
		Err(StoreError::Backend(e)) => {
			warn!(error = %e, "ban insert failed");
			return Err(ChatError::Dependency("Failed to ban user".to_string()));
		}
	}

	info!(admin = %actor.username, target = %username, reason = %reason, "user banned");
	metrics::counter!("palaver_server_moderation_total", "op" => "ban_user").increment(1);

	// Termination happens-after the ban is persisted. Targets that already
	// disconnected are skipped silently.
	for target_conn in state.registry.user_recipients(target.id).await {
		target_conn.shutdown(
			ServerFrame::Banned {
				reason: reason.clone(),
				by: actor.username.clone(),
			},
			"banned",
		);
	}

	let ack = ServerFrame::Success {
		message: format!("User {username} has been banned"),
	};
	let _ = reply.send(ack).await;
	Ok(())
}

pub(crate) async fn handle_unban_user(
	state: &Arc<ServerState>,
	actor: &Identity,
	reply: &mpsc::Sender<ServerFrame>,
	username: String,
) -> Result<(), ChatError> {
	require_admin(actor)?;

	let username = username.trim().to_string();
	if username.is_empty() {
		return Err(ChatError::Validation("Username required".to_string()));
	}

	let target = state
		.store
		.identity_by_username(&username)
		.await
		.map_err(|e| {
			warn!(error = %e, "target lookup failed");
			ChatError::Dependency("Failed to unban user".to_string())
		})?
		.ok_or_else(|| ChatError::NotFound("User not found".to_string()))?;

	// Absence of a ban is not an error.
	let removed = state.store.remove_ban(target.id).await.map_err(|e| {
		warn!(error = %e, "ban removal failed");
		ChatError::Dependency("Failed to unban user".to_string())
	})?;

	info!(admin = %actor.username, target = %username, removed, "user unbanned");
	metrics::counter!("palaver_server_moderation_total", "op" => "unban_user").increment(1);

	let ack = ServerFrame::Success {
		message: format!("User {username} has been unbanned"),
	};
	let _ = reply.send(ack).await;
	Ok(())
}

pub(crate) async fn handle_kick_user(
	state: &Arc<ServerState>,
	actor: &Identity,
	reply: &mpsc::Sender<ServerFrame>,
	username: String,
	reason: Option<String>,
) -> Result<(), ChatError> {
	require_admin(actor)?;

	let username = username.trim().to_string();
	if username.is_empty() {
		return Err(ChatError::Validation("Username required".to_string()));
	}

	let target = state
		.store
		.identity_by_username(&username)
		.await
		.map_err(|e| {
			warn!(error = %e, "target lookup failed");
			ChatError::Dependency("Failed to kick user".to_string())
		})?
		.ok_or_else(|| ChatError::NotFound("User not found".to_string()))?;

	if target.is_admin() {
		return Err(ChatError::Validation("Cannot kick admin users".to_string()));
	}

	let reason = reason
		.filter(|r| !r.trim().is_empty())
		.unwrap_or_else(|| DEFAULT_REASON.to_string());

	info!(admin = %actor.username, target = %username, reason = %reason, "user kicked");
	metrics::counter!("palaver_server_moderation_total", "op" => "kick_user").increment(1);

	// No persisted record: the target may reconnect immediately.
	for target_conn in state.registry.user_recipients(target.id).await {
		target_conn.shutdown(
			ServerFrame::Kicked {
				reason: reason.clone(),
				by: actor.username.clone(),
			},
			"kicked",
		);
	}

	let ack = ServerFrame::Success {
		message: format!("User {username} has been kicked"),
	};
	let _ = reply.send(ack).await;
	Ok(())
}
