#![forbid(unsafe_code)]

use std::sync::Arc;

use chrono::Utc;
use palaver_auth::{HmacAuthority, SecretString};
use palaver_domain::{ChatError, Identity, Role, Room, RoomId, RoomName, UserId};
use palaver_protocol::ServerFrame;
use tokio::sync::mpsc;

use crate::server::registry::ShutdownNotice;
use crate::server::state::ServerState;
use crate::server::store::MemoryStore;
use crate::server::{moderation, router};

fn test_state() -> Arc<ServerState> {
	let store = Arc::new(MemoryStore::default());
	let auth = Arc::new(HmacAuthority::new(SecretString::new("test-secret")));
	Arc::new(ServerState::new(store, auth))
}

fn identity(name: &str, role: Role) -> Identity {
	Identity {
		id: UserId::new_v4(),
		username: name.to_string(),
		role,
	}
}

/// Store the identity profile and register a live connection for it.
async fn connect_known(
	state: &Arc<ServerState>,
	conn_id: u64,
	identity: Identity,
) -> (
	mpsc::Sender<ServerFrame>,
	mpsc::Receiver<ServerFrame>,
	mpsc::Receiver<ShutdownNotice>,
) {
	state.store.upsert_identity(&identity).await.expect("store identity");
	let (tx, rx) = mpsc::channel(64);
	let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
	state.registry.register(conn_id, identity, tx.clone(), shutdown_tx).await;
	(tx, rx, shutdown_rx)
}

fn drain(rx: &mut mpsc::Receiver<ServerFrame>) -> Vec<ServerFrame> {
	let mut frames = Vec::new();
	while let Ok(frame) = rx.try_recv() {
		frames.push(frame);
	}
	frames
}

async fn seed_room(state: &ServerState, name: &str) -> Room {
	let room = Room {
		id: RoomId::new_v4(),
		name: RoomName::new(name).expect("valid room name"),
		description: None,
		created_by: UserId::new_v4(),
		created_at: Utc::now(),
	};
	state.store.insert_room(&room).await.expect("insert room");
	room
}

#[tokio::test]
async fn non_admin_attempts_have_no_side_effects() {
	let state = test_state();
	let alice = identity("alice", Role::User);
	let (tx, mut rx, _sd) = connect_known(&state, 1, alice.clone()).await;

	let err = moderation::handle_create_room(&state, &alice, &tx, "general".to_string(), None)
		.await
		.unwrap_err();
	assert_eq!(err, ChatError::Privilege("Admin privileges required".to_string()));
	assert!(state.store.list_rooms().await.expect("rooms").is_empty());

	let err = moderation::handle_ban_user(&state, &alice, &tx, "bob".to_string(), None)
		.await
		.unwrap_err();
	assert_eq!(err, ChatError::Privilege("Admin privileges required".to_string()));

	let err = moderation::handle_kick_user(&state, &alice, &tx, "bob".to_string(), None)
		.await
		.unwrap_err();
	assert_eq!(err, ChatError::Privilege("Admin privileges required".to_string()));

	let err = moderation::handle_unban_user(&state, &alice, &tx, "bob".to_string())
		.await
		.unwrap_err();
	assert_eq!(err, ChatError::Privilege("Admin privileges required".to_string()));

	let err = moderation::handle_delete_room(&state, &alice, &tx, RoomId::new_v4())
		.await
		.unwrap_err();
	assert_eq!(err, ChatError::Privilege("Admin privileges required".to_string()));

	assert!(drain(&mut rx).is_empty());
}

#[tokio::test]
async fn create_room_normalizes_broadcasts_and_acks() {
	let state = test_state();
	let root = identity("root", Role::Admin);
	let alice = identity("alice", Role::User);
	let (root_tx, mut root_rx, _sd1) = connect_known(&state, 1, root.clone()).await;
	let (_alice_tx, mut alice_rx, _sd2) = connect_known(&state, 2, alice.clone()).await;

	moderation::handle_create_room(&state, &root, &root_tx, "  General ".to_string(), Some("town square".to_string()))
		.await
		.expect("create room");

	let rooms = state.store.list_rooms().await.expect("rooms");
	assert_eq!(rooms.len(), 1);
	assert_eq!(rooms[0].name.as_str(), "general");
	assert_eq!(rooms[0].created_by, root.id);

	// Every live connection learns about the new room, idle ones included.
	let to_alice = drain(&mut alice_rx);
	assert!(matches!(&to_alice[..], [ServerFrame::RoomCreated { room }] if room.name == "general"));

	let to_root = drain(&mut root_rx);
	assert_eq!(to_root.len(), 2);
	assert!(matches!(&to_root[0], ServerFrame::RoomCreated { .. }));
	assert!(
		matches!(&to_root[1], ServerFrame::Success { message } if message == "Room #general created successfully")
	);
}

#[tokio::test]
async fn create_room_rejects_bad_names() {
	let state = test_state();
	let root = identity("root", Role::Admin);
	let (tx, _rx, _sd) = connect_known(&state, 1, root.clone()).await;

	let err = moderation::handle_create_room(&state, &root, &tx, "  ".to_string(), None)
		.await
		.unwrap_err();
	assert_eq!(err, ChatError::Validation("Room name required".to_string()));

	let err = moderation::handle_create_room(&state, &root, &tx, "x".repeat(31), None)
		.await
		.unwrap_err();
	assert_eq!(err, ChatError::Validation("Room name too long (max 30 characters)".to_string()));

	let err = moderation::handle_create_room(&state, &root, &tx, "no spaces".to_string(), None)
		.await
		.unwrap_err();
	assert_eq!(
		err,
		ChatError::Validation("Room name can only contain letters, numbers, _ and -".to_string())
	);
}

#[tokio::test]
async fn duplicate_room_name_is_a_conflict_not_a_second_room() {
	let state = test_state();
	let root = identity("root", Role::Admin);
	let (tx, _rx, _sd) = connect_known(&state, 1, root.clone()).await;

	moderation::handle_create_room(&state, &root, &tx, "general".to_string(), None)
		.await
		.expect("first create");

	let err = moderation::handle_create_room(&state, &root, &tx, "General".to_string(), None)
		.await
		.unwrap_err();
	assert_eq!(err, ChatError::Conflict("Room name already exists".to_string()));

	assert_eq!(state.store.list_rooms().await.expect("rooms").len(), 1);
}

#[tokio::test]
async fn delete_room_force_leaves_members_and_broadcasts() {
	let state = test_state();
	let room = seed_room(&state, "general").await;
	let root = identity("root", Role::Admin);
	let alice = identity("alice", Role::User);
	let (root_tx, mut root_rx, _sd1) = connect_known(&state, 1, root.clone()).await;
	let (alice_tx, mut alice_rx, _sd2) = connect_known(&state, 2, alice.clone()).await;

	router::handle_join_room(&state, 2, &alice, &alice_tx, room.id, 50)
		.await
		.expect("alice joins");
	drain(&mut alice_rx);

	moderation::handle_delete_room(&state, &root, &root_tx, room.id)
		.await
		.expect("delete room");

	assert!(state.store.list_rooms().await.expect("rooms").is_empty());
	assert_eq!(state.registry.current_room(2).await, None);

	let to_alice = drain(&mut alice_rx);
	assert!(!to_alice.is_empty());
	assert!(
		to_alice
			.iter()
			.all(|f| matches!(f, ServerFrame::RoomDeleted { room_name, .. } if room_name == "general"))
	);

	let to_root = drain(&mut root_rx);
	assert!(to_root.iter().any(|f| matches!(f, ServerFrame::RoomDeleted { .. })));
	assert!(
		to_root
			.iter()
			.any(|f| matches!(f, ServerFrame::Success { message } if message == "Room general has been deleted"))
	);

	let err = moderation::handle_delete_room(&state, &root, &root_tx, room.id)
		.await
		.unwrap_err();
	assert_eq!(err, ChatError::NotFound("Room not found".to_string()));
}

#[tokio::test]
async fn ban_persists_then_terminates_every_target_connection() {
	let state = test_state();
	let root = identity("root", Role::Admin);
	let alice = identity("alice", Role::User);
	let (root_tx, mut root_rx, _root_sd) = connect_known(&state, 1, root.clone()).await;
	let (_a_tx, _a_rx, mut alice_sd2) = connect_known(&state, 2, alice.clone()).await;
	let (_b_tx, _b_rx, mut alice_sd3) = connect_known(&state, 3, alice.clone()).await;

	moderation::handle_ban_user(&state, &root, &root_tx, "alice".to_string(), Some("spam".to_string()))
		.await
		.expect("ban");

	let ban = state.store.ban_for(alice.id).await.expect("lookup").expect("ban row");
	assert_eq!(ban.reason, "spam");
	assert_eq!(ban.banned_by, root.id);

	for sd in [&mut alice_sd2, &mut alice_sd3] {
		let notice = sd.try_recv().expect("termination queued");
		assert_eq!(notice.reason, "banned");
		assert!(
			matches!(&notice.frame, ServerFrame::Banned { reason, by } if reason == "spam" && by == "root")
		);
	}

	let to_root = drain(&mut root_rx);
	assert!(
		matches!(&to_root[..], [ServerFrame::Success { message }] if message == "User alice has been banned")
	);
}

#[tokio::test]
async fn ban_rejects_admins_unknowns_and_duplicates() {
	let state = test_state();
	let root = identity("root", Role::Admin);
	let other_admin = identity("ops", Role::Admin);
	let alice = identity("alice", Role::User);
	let (tx, _rx, _sd) = connect_known(&state, 1, root.clone()).await;
	state.store.upsert_identity(&other_admin).await.expect("store admin");
	state.store.upsert_identity(&alice).await.expect("store alice");

	let err = moderation::handle_ban_user(&state, &root, &tx, "ops".to_string(), None)
		.await
		.unwrap_err();
	assert_eq!(err, ChatError::Validation("Cannot ban admin users".to_string()));

	let err = moderation::handle_ban_user(&state, &root, &tx, "ghost".to_string(), None)
		.await
		.unwrap_err();
	assert_eq!(err, ChatError::NotFound("User not found".to_string()));

	let err = moderation::handle_ban_user(&state, &root, &tx, "  ".to_string(), None)
		.await
		.unwrap_err();
	assert_eq!(err, ChatError::Validation("Username required".to_string()));

	moderation::handle_ban_user(&state, &root, &tx, "alice".to_string(), None)
		.await
		.expect("first ban");
	let err = moderation::handle_ban_user(&state, &root, &tx, "alice".to_string(), None)
		.await
		.unwrap_err();
	assert_eq!(err, ChatError::Conflict("User is already banned".to_string()));
}

#[tokio::test]
async fn ban_without_reason_uses_the_default() {
	let state = test_state();
	let root = identity("root", Role::Admin);
	let alice = identity("alice", Role::User);
	let (tx, _rx, _root_sd) = connect_known(&state, 1, root.clone()).await;
	let (_a_tx, _a_rx, mut alice_sd) = connect_known(&state, 2, alice.clone()).await;

	moderation::handle_ban_user(&state, &root, &tx, "alice".to_string(), None)
		.await
		.expect("ban");

	let notice = alice_sd.try_recv().expect("termination queued");
	assert!(matches!(&notice.frame, ServerFrame::Banned { reason, .. } if reason == "No reason provided"));
}

#[tokio::test]
async fn banning_an_offline_user_only_persists() {
	let state = test_state();
	let root = identity("root", Role::Admin);
	let alice = identity("alice", Role::User);
	let (tx, _rx, _sd) = connect_known(&state, 1, root.clone()).await;
	state.store.upsert_identity(&alice).await.expect("store alice");

	moderation::handle_ban_user(&state, &root, &tx, "alice".to_string(), None)
		.await
		.expect("ban offline target");

	assert!(state.store.ban_for(alice.id).await.expect("lookup").is_some());
}

#[tokio::test]
async fn unban_removes_the_record_and_tolerates_absence() {
	let state = test_state();
	let root = identity("root", Role::Admin);
	let alice = identity("alice", Role::User);
	let (tx, mut rx, _sd) = connect_known(&state, 1, root.clone()).await;
	state.store.upsert_identity(&alice).await.expect("store alice");

	moderation::handle_ban_user(&state, &root, &tx, "alice".to_string(), None)
		.await
		.expect("ban");
	moderation::handle_unban_user(&state, &root, &tx, "alice".to_string())
		.await
		.expect("unban");
	assert!(state.store.ban_for(alice.id).await.expect("lookup").is_none());

	// No ban on record is not an error; an unknown user is.
	moderation::handle_unban_user(&state, &root, &tx, "alice".to_string())
		.await
		.expect("repeat unban");
	let err = moderation::handle_unban_user(&state, &root, &tx, "ghost".to_string())
		.await
		.unwrap_err();
	assert_eq!(err, ChatError::NotFound("User not found".to_string()));

	let acks = drain(&mut rx);
	assert!(
		acks.iter()
			.filter(|f| matches!(f, ServerFrame::Success { message } if message == "User alice has been unbanned"))
			.count() == 2
	);
}

#[tokio::test]
async fn kick_terminates_without_a_persisted_ban() {
	let state = test_state();
	let root = identity("root", Role::Admin);
	let alice = identity("alice", Role::User);
	let (tx, mut rx, _root_sd) = connect_known(&state, 1, root.clone()).await;
	let (_a_tx, _a_rx, mut alice_sd) = connect_known(&state, 2, alice.clone()).await;

	moderation::handle_kick_user(&state, &root, &tx, "alice".to_string(), Some("cool off".to_string()))
		.await
		.expect("kick");

	let notice = alice_sd.try_recv().expect("termination queued");
	assert_eq!(notice.reason, "kicked");
	assert!(
		matches!(&notice.frame, ServerFrame::Kicked { reason, by } if reason == "cool off" && by == "root")
	);

	// Nothing persisted: the target may reconnect immediately.
	assert!(state.store.ban_for(alice.id).await.expect("lookup").is_none());

	let err = moderation::handle_kick_user(&state, &root, &tx, "root".to_string(), None)
		.await
		.unwrap_err();
	assert_eq!(err, ChatError::Validation("Cannot kick admin users".to_string()));

	let acks = drain(&mut rx);
	assert!(
		acks.iter()
			.any(|f| matches!(f, ServerFrame::Success { message } if message == "User alice has been kicked"))
	);
}
