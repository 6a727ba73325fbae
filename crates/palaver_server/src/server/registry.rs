#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use palaver_domain::{Identity, RoomId, UserId};
use palaver_protocol::ServerFrame;
use tokio::sync::{Mutex, mpsc};
use tracing::debug;

/// Server-assigned connection identifier.
pub type ConnId = u64;

/// A terminal notice for one connection: the writer task delivers `frame`,
/// then closes the transport with `reason`.
#[derive(Debug)]
pub struct ShutdownNotice {
	pub frame: ServerFrame,
	pub reason: &'static str,
}

/// Delivery handle for one live connection, snapshotted from the registry.
#[derive(Debug, Clone)]
pub struct Recipient {
	pub conn_id: ConnId,
	pub identity: Identity,
	tx: mpsc::Sender<ServerFrame>,
	shutdown_tx: mpsc::Sender<ShutdownNotice>,
}

impl Recipient {
	/// Queue a frame; best effort, never blocks. A full or closed queue drops
	/// the frame for this connection only.
	pub fn deliver(&self, frame: ServerFrame) -> bool {
		match self.tx.try_send(frame) {
			Ok(()) => true,
			Err(mpsc::error::TrySendError::Full(_)) => {
				metrics::counter!("palaver_server_outbound_dropped_total").increment(1);
				debug!(conn_id = self.conn_id, "outbound queue full; frame dropped");
				false
			}
			Err(mpsc::error::TrySendError::Closed(_)) => false,
		}
	}

	/// Request notice-then-teardown. Idempotent: a repeat request or an
	/// already-gone connection is a no-op.
	pub fn shutdown(&self, frame: ServerFrame, reason: &'static str) {
		let _ = self.shutdown_tx.try_send(ShutdownNotice { frame, reason });
	}
}

/// Deliver one frame to every recipient, at most once each.
pub fn deliver_all(recipients: &[Recipient], frame: &ServerFrame) {
	for recipient in recipients {
		recipient.deliver(frame.clone());
	}
}

/// Outcome of [`Registry::unregister`].
#[derive(Debug)]
pub struct Departure {
	pub identity: Identity,
	pub room: Option<RoomId>,
	/// Members still in the departed room, snapshotted atomically with the removal.
	pub remaining: Vec<Recipient>,
}

/// Outcome of [`Registry::join_room`].
#[derive(Debug)]
pub struct RoomSwitch {
	pub identity: Identity,
	/// Previous room (if different from the target) and its remaining members.
	pub previous: Option<(RoomId, Vec<Recipient>)>,
	/// Other members already in the joined room.
	pub others: Vec<Recipient>,
	/// True when the connection was already in the target room.
	pub rejoined: bool,
}

/// Outcome of [`Registry::leave_room`].
#[derive(Debug)]
pub enum LeaveOutcome {
	NotInRoom,
	Left {
		identity: Identity,
		remaining: Vec<Recipient>,
	},
}

/// The authoritative in-memory index of live connections: who is online, on
/// which connection, in which room.
///
/// Every operation takes the single lock once; room-membership snapshots are
/// taken in the same critical section as the mutation they accompany, so a
/// concurrent broadcast observes either the state before or after the whole
/// step, never a half-updated entry. Delivery happens after the lock is
/// released.
#[derive(Debug, Clone, Default)]
pub struct Registry {
	inner: Arc<Mutex<Inner>>,
}

#[derive(Debug, Default)]
struct Inner {
	conns: HashMap<ConnId, ConnEntry>,
	by_room: HashMap<RoomId, HashSet<ConnId>>,
	by_user: HashMap<UserId, HashSet<ConnId>>,
}

#[derive(Debug)]
struct ConnEntry {
	identity: Identity,
	room: Option<RoomId>,
	tx: mpsc::Sender<ServerFrame>,
	shutdown_tx: mpsc::Sender<ShutdownNotice>,
}

impl Inner {
	fn recipient(&self, conn_id: ConnId) -> Option<Recipient> {
		self.conns.get(&conn_id).map(|entry| Recipient {
			conn_id,
			identity: entry.identity.clone(),
			tx: entry.tx.clone(),
			shutdown_tx: entry.shutdown_tx.clone(),
		})
	}

	fn recipients_of(&self, ids: Option<&HashSet<ConnId>>) -> Vec<Recipient> {
		let Some(ids) = ids else {
			return Vec::new();
		};
		ids.iter()
			.filter_map(|conn_id| self.recipient(*conn_id))
			.filter(|r| !r.tx.is_closed())
			.collect()
	}

	fn detach_from_room(&mut self, conn_id: ConnId, room: RoomId) {
		if let Some(members) = self.by_room.get_mut(&room) {
			members.remove(&conn_id);
			if members.is_empty() {
				self.by_room.remove(&room);
			}
		}
	}
}

impl Registry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Bind a freshly authenticated connection. Initial state: no room.
	pub async fn register(
		&self,
		conn_id: ConnId,
		identity: Identity,
		tx: mpsc::Sender<ServerFrame>,
		shutdown_tx: mpsc::Sender<ShutdownNotice>,
	) {
		let mut inner = self.inner.lock().await;
		inner.by_user.entry(identity.id).or_default().insert(conn_id);
		inner.conns.insert(
			conn_id,
			ConnEntry {
				identity,
				room: None,
				tx,
				shutdown_tx,
			},
		);
	}

	/// Remove a connection, atomically with its room membership.
	pub async fn unregister(&self, conn_id: ConnId) -> Option<Departure> {
		let mut inner = self.inner.lock().await;
		let entry = inner.conns.remove(&conn_id)?;

		if let Some(members) = inner.by_user.get_mut(&entry.identity.id) {
			members.remove(&conn_id);
			if members.is_empty() {
				inner.by_user.remove(&entry.identity.id);
			}
		}

		let mut remaining = Vec::new();
		if let Some(room) = entry.room {
			inner.detach_from_room(conn_id, room);
			remaining = inner.recipients_of(inner.by_room.get(&room));
		}

		Some(Departure {
			identity: entry.identity,
			room: entry.room,
			remaining,
		})
	}

	/// Move a connection into `room`, implicitly leaving its previous room.
	///
	/// Returns `None` when the connection is no longer registered (it raced
	/// its own teardown).
	pub async fn join_room(&self, conn_id: ConnId, room: RoomId) -> Option<RoomSwitch> {
		let mut inner = self.inner.lock().await;

		let (identity, old_room) = {
			let entry = inner.conns.get(&conn_id)?;
			(entry.identity.clone(), entry.room)
		};

		if old_room == Some(room) {
			let others = inner
				.recipients_of(inner.by_room.get(&room))
				.into_iter()
				.filter(|r| r.conn_id != conn_id)
				.collect();
			return Some(RoomSwitch {
				identity,
				previous: None,
				others,
				rejoined: true,
			});
		}

		let previous = old_room.map(|old| {
			inner.detach_from_room(conn_id, old);
			(old, inner.recipients_of(inner.by_room.get(&old)))
		});

		let others = inner
			.recipients_of(inner.by_room.get(&room))
			.into_iter()
			.filter(|r| r.conn_id != conn_id)
			.collect();

		inner.by_room.entry(room).or_default().insert(conn_id);
		if let Some(entry) = inner.conns.get_mut(&conn_id) {
			entry.room = Some(room);
		}

		Some(RoomSwitch {
			identity,
			previous,
			others,
			rejoined: false,
		})
	}

	/// Leave `room`; only valid when it is the connection's current room.
	pub async fn leave_room(&self, conn_id: ConnId, room: RoomId) -> LeaveOutcome {
		let mut inner = self.inner.lock().await;

		let identity = match inner.conns.get(&conn_id) {
			Some(entry) if entry.room == Some(room) => entry.identity.clone(),
			_ => return LeaveOutcome::NotInRoom,
		};

		inner.detach_from_room(conn_id, room);
		if let Some(entry) = inner.conns.get_mut(&conn_id) {
			entry.room = None;
		}
		let remaining = inner.recipients_of(inner.by_room.get(&room));

		LeaveOutcome::Left { identity, remaining }
	}

	/// Force every member of `room` to `no_room`; returns the evicted members.
	pub async fn clear_room(&self, room: RoomId) -> Vec<Recipient> {
		let mut inner = self.inner.lock().await;

		let Some(member_ids) = inner.by_room.remove(&room) else {
			return Vec::new();
		};

		let mut evicted = Vec::with_capacity(member_ids.len());
		for conn_id in member_ids {
			if let Some(entry) = inner.conns.get_mut(&conn_id) {
				entry.room = None;
			}
			if let Some(recipient) = inner.recipient(conn_id) {
				evicted.push(recipient);
			}
		}

		evicted
	}

	/// Every connection currently in `room`.
	pub async fn room_recipients(&self, room: RoomId) -> Vec<Recipient> {
		let inner = self.inner.lock().await;
		inner.recipients_of(inner.by_room.get(&room))
	}

	/// Identities currently in `room` (one entry per connection).
	pub async fn room_members(&self, room: RoomId) -> Vec<Identity> {
		let inner = self.inner.lock().await;
		inner
			.recipients_of(inner.by_room.get(&room))
			.into_iter()
			.map(|r| r.identity)
			.collect()
	}

	/// Every live connection of `user` (a user may be connected more than once).
	pub async fn user_recipients(&self, user: UserId) -> Vec<Recipient> {
		let inner = self.inner.lock().await;
		inner.recipients_of(inner.by_user.get(&user))
	}

	/// Every live connection.
	pub async fn all_recipients(&self) -> Vec<Recipient> {
		let inner = self.inner.lock().await;
		inner
			.conns
			.keys()
			.copied()
			.collect::<Vec<_>>()
			.into_iter()
			.filter_map(|conn_id| inner.recipient(conn_id))
			.filter(|r| !r.tx.is_closed())
			.collect()
	}

	/// Delivery handle for one connection.
	pub async fn recipient(&self, conn_id: ConnId) -> Option<Recipient> {
		let inner = self.inner.lock().await;
		inner.recipient(conn_id)
	}

	/// The room a connection currently occupies, if any.
	pub async fn current_room(&self, conn_id: ConnId) -> Option<RoomId> {
		let inner = self.inner.lock().await;
		inner.conns.get(&conn_id).and_then(|entry| entry.room)
	}

	/// Number of registered connections.
	pub async fn connection_count(&self) -> usize {
		let inner = self.inner.lock().await;
		inner.conns.len()
	}
}
