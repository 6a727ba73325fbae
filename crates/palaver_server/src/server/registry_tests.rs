#![forbid(unsafe_code)]

use palaver_domain::{Identity, Role, RoomId, UserId};
use palaver_protocol::ServerFrame;
use tokio::sync::mpsc;

use crate::server::registry::{LeaveOutcome, Registry, ShutdownNotice};

fn identity(name: &str, role: Role) -> Identity {
	Identity {
		id: UserId::new_v4(),
		username: name.to_string(),
		role,
	}
}

async fn register(
	registry: &Registry,
	conn_id: u64,
	identity: Identity,
) -> (mpsc::Receiver<ServerFrame>, mpsc::Receiver<ShutdownNotice>) {
	let (tx, rx) = mpsc::channel(64);
	let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
	registry.register(conn_id, identity, tx, shutdown_tx).await;
	(rx, shutdown_rx)
}

#[tokio::test]
async fn member_is_visible_in_room_until_it_leaves() {
	let registry = Registry::new();
	let room = RoomId::new_v4();
	let alice = identity("alice", Role::User);
	let (_rx, _sd) = register(&registry, 1, alice.clone()).await;

	assert!(registry.room_recipients(room).await.is_empty());

	registry.join_room(1, room).await.expect("registered");
	let members = registry.room_recipients(room).await;
	assert_eq!(members.len(), 1);
	assert_eq!(members[0].conn_id, 1);
	assert_eq!(registry.current_room(1).await, Some(room));

	match registry.leave_room(1, room).await {
		LeaveOutcome::Left { identity, remaining } => {
			assert_eq!(identity.username, "alice");
			assert!(remaining.is_empty());
		}
		other => panic!("expected Left, got {other:?}"),
	}
	assert!(registry.room_recipients(room).await.is_empty());
	assert_eq!(registry.current_room(1).await, None);
}

#[tokio::test]
async fn a_connection_occupies_at_most_one_room() {
	let registry = Registry::new();
	let room_a = RoomId::new_v4();
	let room_b = RoomId::new_v4();
	let (_rx, _sd) = register(&registry, 1, identity("alice", Role::User)).await;
	let (_rx2, _sd2) = register(&registry, 2, identity("bob", Role::User)).await;

	registry.join_room(2, room_a).await.expect("bob joins a");
	registry.join_room(1, room_a).await.expect("alice joins a");

	let switch = registry.join_room(1, room_b).await.expect("alice switches to b");
	assert!(!switch.rejoined);
	let (old_room, remaining) = switch.previous.expect("implicit leave");
	assert_eq!(old_room, room_a);
	assert_eq!(remaining.len(), 1);
	assert_eq!(remaining[0].identity.username, "bob");

	assert_eq!(registry.current_room(1).await, Some(room_b));
	let in_a: Vec<u64> = registry.room_recipients(room_a).await.iter().map(|r| r.conn_id).collect();
	assert_eq!(in_a, vec![2]);
	let in_b: Vec<u64> = registry.room_recipients(room_b).await.iter().map(|r| r.conn_id).collect();
	assert_eq!(in_b, vec![1]);
}

#[tokio::test]
async fn rejoining_the_current_room_is_not_a_switch() {
	let registry = Registry::new();
	let room = RoomId::new_v4();
	let (_rx, _sd) = register(&registry, 1, identity("alice", Role::User)).await;

	registry.join_room(1, room).await.expect("first join");
	let again = registry.join_room(1, room).await.expect("rejoin");

	assert!(again.rejoined);
	assert!(again.previous.is_none());
	assert_eq!(registry.room_recipients(room).await.len(), 1);
}

#[tokio::test]
async fn leave_requires_the_matching_room() {
	let registry = Registry::new();
	let room_a = RoomId::new_v4();
	let room_b = RoomId::new_v4();
	let (_rx, _sd) = register(&registry, 1, identity("alice", Role::User)).await;
	registry.join_room(1, room_a).await.expect("join");

	assert!(matches!(registry.leave_room(1, room_b).await, LeaveOutcome::NotInRoom));
	assert_eq!(registry.current_room(1).await, Some(room_a));

	assert!(matches!(registry.leave_room(99, room_a).await, LeaveOutcome::NotInRoom));
}

#[tokio::test]
async fn unregister_removes_presence_atomically() {
	let registry = Registry::new();
	let room = RoomId::new_v4();
	let (_rx1, _sd1) = register(&registry, 1, identity("alice", Role::User)).await;
	let (_rx2, _sd2) = register(&registry, 2, identity("bob", Role::User)).await;
	registry.join_room(1, room).await.expect("alice joins");
	registry.join_room(2, room).await.expect("bob joins");

	let departure = registry.unregister(1).await.expect("was registered");
	assert_eq!(departure.identity.username, "alice");
	assert_eq!(departure.room, Some(room));
	assert_eq!(departure.remaining.len(), 1);
	assert_eq!(departure.remaining[0].identity.username, "bob");

	assert_eq!(registry.connection_count().await, 1);
	assert_eq!(registry.room_recipients(room).await.len(), 1);

	// Repeat unregister is a no-op.
	assert!(registry.unregister(1).await.is_none());
}

#[tokio::test]
async fn a_user_may_hold_several_connections() {
	let registry = Registry::new();
	let alice = identity("alice", Role::User);
	let (_rx1, _sd1) = register(&registry, 1, alice.clone()).await;
	let (_rx2, _sd2) = register(&registry, 2, alice.clone()).await;

	let conns: Vec<u64> = registry.user_recipients(alice.id).await.iter().map(|r| r.conn_id).collect();
	assert_eq!(conns.len(), 2);
	assert!(conns.contains(&1) && conns.contains(&2));

	registry.unregister(1).await.expect("first connection");
	let conns: Vec<u64> = registry.user_recipients(alice.id).await.iter().map(|r| r.conn_id).collect();
	assert_eq!(conns, vec![2]);
}

#[tokio::test]
async fn closed_receivers_are_skipped_in_snapshots() {
	let registry = Registry::new();
	let room = RoomId::new_v4();
	let alice = identity("alice", Role::User);

	let (rx, _sd) = register(&registry, 1, alice.clone()).await;
	registry.join_room(1, room).await.expect("join");
	drop(rx);

	assert!(registry.room_recipients(room).await.is_empty());
	assert!(registry.user_recipients(alice.id).await.is_empty());
}

#[tokio::test]
async fn clear_room_evicts_every_member() {
	let registry = Registry::new();
	let room = RoomId::new_v4();
	let (_rx1, _sd1) = register(&registry, 1, identity("alice", Role::User)).await;
	let (_rx2, _sd2) = register(&registry, 2, identity("bob", Role::User)).await;
	registry.join_room(1, room).await.expect("alice joins");
	registry.join_room(2, room).await.expect("bob joins");

	let evicted = registry.clear_room(room).await;
	assert_eq!(evicted.len(), 2);

	assert!(registry.room_recipients(room).await.is_empty());
	assert_eq!(registry.current_room(1).await, None);
	assert_eq!(registry.current_room(2).await, None);
	// Connections stay registered; only the room membership is gone.
	assert_eq!(registry.connection_count().await, 2);
}

#[tokio::test]
async fn delivered_frames_arrive_on_the_connection_queue() {
	let registry = Registry::new();
	let room = RoomId::new_v4();
	let (mut rx, _sd) = register(&registry, 1, identity("alice", Role::User)).await;
	registry.join_room(1, room).await.expect("join");

	let recipients = registry.room_recipients(room).await;
	crate::server::registry::deliver_all(
		&recipients,
		&ServerFrame::UserJoined {
			username: "bob".to_string(),
			room_id: room,
		},
	);

	let frame = rx.try_recv().expect("frame queued");
	assert!(matches!(frame, ServerFrame::UserJoined { ref username, .. } if username == "bob"));
}
