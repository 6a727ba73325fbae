#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::str::FromStr as _;

use anyhow::{Context, anyhow};
use chrono::{DateTime, TimeZone as _, Utc};
use palaver_domain::{Ban, Identity, MessageRecord, Role, Room, RoomId, RoomName, UserId};
use thiserror::Error;
use tokio::sync::Mutex;

/// Errors surfaced by [`DataStore`] operations.
#[derive(Debug, Error)]
pub enum StoreError {
	/// A uniqueness constraint was violated (duplicate room name, duplicate ban).
	#[error("conflict")]
	Conflict,

	#[error(transparent)]
	Backend(#[from] anyhow::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// External persistence collaborator: rooms, messages, bans, identity profiles.
///
/// The core only issues point queries; the single cross-entity ordering it
/// relies on ("persist message, then broadcast") lives in the router.
#[async_trait::async_trait]
pub trait DataStore: Send + Sync {
	async fn identity_by_id(&self, id: UserId) -> StoreResult<Option<Identity>>;
	async fn identity_by_username(&self, username: &str) -> StoreResult<Option<Identity>>;
	async fn upsert_identity(&self, identity: &Identity) -> StoreResult<()>;

	/// All rooms ordered by name.
	async fn list_rooms(&self) -> StoreResult<Vec<Room>>;
	async fn room_by_id(&self, id: RoomId) -> StoreResult<Option<Room>>;
	/// Fails with [`StoreError::Conflict`] when the name is taken.
	async fn insert_room(&self, room: &Room) -> StoreResult<()>;
	/// Deletes the room and its messages; returns false when the room is unknown.
	async fn delete_room(&self, id: RoomId) -> StoreResult<bool>;

	async fn insert_message(&self, message: &MessageRecord) -> StoreResult<()>;
	/// Most recent `limit` room messages, oldest first.
	async fn recent_room_messages(&self, room_id: RoomId, limit: u32) -> StoreResult<Vec<MessageRecord>>;

	async fn ban_for(&self, user_id: UserId) -> StoreResult<Option<Ban>>;
	/// Fails with [`StoreError::Conflict`] when the user is already banned.
	async fn insert_ban(&self, ban: &Ban) -> StoreResult<()>;
	/// Returns false when no ban existed; that is not an error.
	async fn remove_ban(&self, user_id: UserId) -> StoreResult<bool>;
}

/// In-memory store used by tests and by servers running without persistence.
#[derive(Default)]
pub struct MemoryStore {
	inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
	identities: HashMap<UserId, Identity>,
	rooms: HashMap<RoomId, Room>,
	messages: Vec<MessageRecord>,
	bans: HashMap<UserId, Ban>,
}

#[async_trait::async_trait]
impl DataStore for MemoryStore {
	async fn identity_by_id(&self, id: UserId) -> StoreResult<Option<Identity>> {
		let inner = self.inner.lock().await;
		Ok(inner.identities.get(&id).cloned())
	}

	async fn identity_by_username(&self, username: &str) -> StoreResult<Option<Identity>> {
		let inner = self.inner.lock().await;
		Ok(inner.identities.values().find(|i| i.username == username).cloned())
	}

	async fn upsert_identity(&self, identity: &Identity) -> StoreResult<()> {
		let mut inner = self.inner.lock().await;
		inner.identities.insert(identity.id, identity.clone());
		Ok(())
	}

	async fn list_rooms(&self) -> StoreResult<Vec<Room>> {
		let inner = self.inner.lock().await;
		let mut rooms: Vec<Room> = inner.rooms.values().cloned().collect();
		rooms.sort_by(|a, b| a.name.as_str().cmp(b.name.as_str()));
		Ok(rooms)
	}

	async fn room_by_id(&self, id: RoomId) -> StoreResult<Option<Room>> {
		let inner = self.inner.lock().await;
		Ok(inner.rooms.get(&id).cloned())
	}

	async fn insert_room(&self, room: &Room) -> StoreResult<()> {
		let mut inner = self.inner.lock().await;
		if inner.rooms.values().any(|r| r.name == room.name) {
			return Err(StoreError::Conflict);
		}
		inner.rooms.insert(room.id, room.clone());
		Ok(())
	}

	async fn delete_room(&self, id: RoomId) -> StoreResult<bool> {
		let mut inner = self.inner.lock().await;
		if inner.rooms.remove(&id).is_none() {
			return Ok(false);
		}
		inner.messages.retain(|m| m.room_id != Some(id));
		Ok(true)
	}

	async fn insert_message(&self, message: &MessageRecord) -> StoreResult<()> {
		let mut inner = self.inner.lock().await;
		inner.messages.push(message.clone());
		Ok(())
	}

	async fn recent_room_messages(&self, room_id: RoomId, limit: u32) -> StoreResult<Vec<MessageRecord>> {
		let inner = self.inner.lock().await;
		let mut recent: Vec<MessageRecord> = inner
			.messages
			.iter()
			.rev()
			.filter(|m| m.room_id == Some(room_id))
			.take(limit as usize)
			.cloned()
			.collect();
		recent.reverse();
		Ok(recent)
	}

	async fn ban_for(&self, user_id: UserId) -> StoreResult<Option<Ban>> {
		let inner = self.inner.lock().await;
		Ok(inner.bans.get(&user_id).cloned())
	}

	async fn insert_ban(&self, ban: &Ban) -> StoreResult<()> {
		let mut inner = self.inner.lock().await;
		if inner.bans.contains_key(&ban.user_id) {
			return Err(StoreError::Conflict);
		}
		inner.bans.insert(ban.user_id, ban.clone());
		Ok(())
	}

	async fn remove_ban(&self, user_id: UserId) -> StoreResult<bool> {
		let mut inner = self.inner.lock().await;
		Ok(inner.bans.remove(&user_id).is_some())
	}
}

/// SQL-backed store; the backend is selected by the database URL scheme.
#[derive(Clone)]
pub struct SqlStore {
	backend: SqlBackend,
}

#[derive(Clone)]
enum SqlBackend {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
}

const SCHEMA: &[&str] = &[
	"CREATE TABLE IF NOT EXISTS profiles (\
		id TEXT PRIMARY KEY, \
		username TEXT NOT NULL UNIQUE, \
		role TEXT NOT NULL)",
	"CREATE TABLE IF NOT EXISTS rooms (\
		id TEXT PRIMARY KEY, \
		name TEXT NOT NULL UNIQUE, \
		description TEXT, \
		created_by TEXT NOT NULL, \
		created_at BIGINT NOT NULL)",
	"CREATE TABLE IF NOT EXISTS messages (\
		id TEXT PRIMARY KEY, \
		user_id TEXT NOT NULL, \
		room_id TEXT, \
		recipient_id TEXT, \
		content TEXT NOT NULL, \
		created_at BIGINT NOT NULL)",
	"CREATE INDEX IF NOT EXISTS idx_messages_room ON messages (room_id, created_at)",
	"CREATE TABLE IF NOT EXISTS bans (\
		user_id TEXT PRIMARY KEY, \
		banned_by TEXT NOT NULL, \
		reason TEXT NOT NULL, \
		created_at BIGINT NOT NULL)",
];

impl SqlStore {
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		let backend = if database_url.starts_with("sqlite:") {
			let pool = sqlx::SqlitePool::connect(database_url).await.context("connect sqlite")?;
			SqlBackend::Sqlite(pool)
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = sqlx::PgPool::connect(database_url).await.context("connect postgres")?;
			SqlBackend::Postgres(pool)
		} else {
			return Err(anyhow!("unsupported database_url (use sqlite: or postgres:)"));
		};

		let store = Self { backend };
		store.init_schema().await?;
		Ok(store)
	}

	async fn init_schema(&self) -> anyhow::Result<()> {
		for ddl in SCHEMA {
			match &self.backend {
				SqlBackend::Sqlite(pool) => {
					sqlx::query(ddl).execute(pool).await.context("init schema (sqlite)")?;
				}
				SqlBackend::Postgres(pool) => {
					sqlx::query(ddl).execute(pool).await.context("init schema (postgres)")?;
				}
			}
		}
		Ok(())
	}
}

type IdentityRow = (String, String, String);
type RoomRow = (String, String, Option<String>, String, i64);
type MessageRow = (
	String,
	String,
	i64,
	Option<String>,
	Option<String>,
	String,
	String,
	String,
);
type BanRow = (String, String, String, i64);

fn ms_to_utc(ms: i64) -> anyhow::Result<DateTime<Utc>> {
	Utc.timestamp_millis_opt(ms)
		.single()
		.ok_or_else(|| anyhow!("timestamp out of range: {ms}"))
}

fn parse_identity((id, username, role): IdentityRow) -> anyhow::Result<Identity> {
	Ok(Identity {
		id: UserId::from_str(&id).map_err(|e| anyhow!("profile id: {e}"))?,
		username,
		role: Role::from_str(&role).map_err(|e| anyhow!("profile role: {e}"))?,
	})
}

fn parse_room((id, name, description, created_by, created_at): RoomRow) -> anyhow::Result<Room> {
	Ok(Room {
		id: RoomId::from_str(&id).map_err(|e| anyhow!("room id: {e}"))?,
		name: RoomName::new(&name).map_err(|e| anyhow!("room name: {e}"))?,
		description,
		created_by: UserId::from_str(&created_by).map_err(|e| anyhow!("room created_by: {e}"))?,
		created_at: ms_to_utc(created_at)?,
	})
}

fn parse_message(row: MessageRow) -> anyhow::Result<MessageRecord> {
	let (id, content, created_at, room_id, recipient_id, sender_id, username, role) = row;
	Ok(MessageRecord {
		id: uuid::Uuid::from_str(&id).map_err(|e| anyhow!("message id: {e}"))?,
		sender: parse_identity((sender_id, username, role))?,
		room_id: room_id
			.map(|r| RoomId::from_str(&r).map_err(|e| anyhow!("message room_id: {e}")))
			.transpose()?,
		recipient_id: recipient_id
			.map(|r| UserId::from_str(&r).map_err(|e| anyhow!("message recipient_id: {e}")))
			.transpose()?,
		content,
		created_at: ms_to_utc(created_at)?,
	})
}

fn parse_ban((user_id, banned_by, reason, created_at): BanRow) -> anyhow::Result<Ban> {
	Ok(Ban {
		user_id: UserId::from_str(&user_id).map_err(|e| anyhow!("ban user_id: {e}"))?,
		banned_by: UserId::from_str(&banned_by).map_err(|e| anyhow!("ban banned_by: {e}"))?,
		reason,
		created_at: ms_to_utc(created_at)?,
	})
}

fn map_insert_err(e: sqlx::Error, what: &'static str) -> StoreError {
	if matches!(&e, sqlx::Error::Database(db) if db.is_unique_violation()) {
		return StoreError::Conflict;
	}
	StoreError::Backend(anyhow!(e).context(what))
}

const SELECT_MESSAGE: &str = "SELECT m.id, m.content, m.created_at, m.room_id, m.recipient_id, \
	p.id, p.username, p.role \
	FROM messages m JOIN profiles p ON p.id = m.user_id";

#[async_trait::async_trait]
impl DataStore for SqlStore {
	async fn identity_by_id(&self, id: UserId) -> StoreResult<Option<Identity>> {
		let row: Option<IdentityRow> = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as("SELECT id, username, role FROM profiles WHERE id = ?")
				.bind(id.to_string())
				.fetch_optional(pool)
				.await
				.map_err(|e| anyhow!(e).context("select profile by id (sqlite)"))?,
			SqlBackend::Postgres(pool) => sqlx::query_as("SELECT id, username, role FROM profiles WHERE id = $1")
				.bind(id.to_string())
				.fetch_optional(pool)
				.await
				.map_err(|e| anyhow!(e).context("select profile by id (postgres)"))?,
		};

		row.map(parse_identity).transpose().map_err(StoreError::Backend)
	}

	async fn identity_by_username(&self, username: &str) -> StoreResult<Option<Identity>> {
		let row: Option<IdentityRow> = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as("SELECT id, username, role FROM profiles WHERE username = ?")
				.bind(username)
				.fetch_optional(pool)
				.await
				.map_err(|e| anyhow!(e).context("select profile by username (sqlite)"))?,
			SqlBackend::Postgres(pool) => sqlx::query_as("SELECT id, username, role FROM profiles WHERE username = $1")
				.bind(username)
				.fetch_optional(pool)
				.await
				.map_err(|e| anyhow!(e).context("select profile by username (postgres)"))?,
		};

		row.map(parse_identity).transpose().map_err(StoreError::Backend)
	}

	async fn upsert_identity(&self, identity: &Identity) -> StoreResult<()> {
		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query(
					"INSERT INTO profiles (id, username, role) VALUES (?, ?, ?) \
					ON CONFLICT(id) DO UPDATE SET username = excluded.username, role = excluded.role",
				)
				.bind(identity.id.to_string())
				.bind(&identity.username)
				.bind(identity.role.as_str())
				.execute(pool)
				.await
				.map_err(|e| map_insert_err(e, "upsert profile (sqlite)"))?;
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO profiles (id, username, role) VALUES ($1, $2, $3) \
					ON CONFLICT (id) DO UPDATE SET username = EXCLUDED.username, role = EXCLUDED.role",
				)
				.bind(identity.id.to_string())
				.bind(&identity.username)
				.bind(identity.role.as_str())
				.execute(pool)
				.await
				.map_err(|e| map_insert_err(e, "upsert profile (postgres)"))?;
			}
		}
		Ok(())
	}

	async fn list_rooms(&self) -> StoreResult<Vec<Room>> {
		let rows: Vec<RoomRow> = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query_as("SELECT id, name, description, created_by, created_at FROM rooms ORDER BY name ASC")
					.fetch_all(pool)
					.await
					.map_err(|e| anyhow!(e).context("select rooms (sqlite)"))?
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query_as("SELECT id, name, description, created_by, created_at FROM rooms ORDER BY name ASC")
					.fetch_all(pool)
					.await
					.map_err(|e| anyhow!(e).context("select rooms (postgres)"))?
			}
		};

		rows.into_iter()
			.map(parse_room)
			.collect::<anyhow::Result<Vec<_>>>()
			.map_err(StoreError::Backend)
	}

	async fn room_by_id(&self, id: RoomId) -> StoreResult<Option<Room>> {
		let row: Option<RoomRow> = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query_as("SELECT id, name, description, created_by, created_at FROM rooms WHERE id = ?")
					.bind(id.to_string())
					.fetch_optional(pool)
					.await
					.map_err(|e| anyhow!(e).context("select room (sqlite)"))?
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query_as("SELECT id, name, description, created_by, created_at FROM rooms WHERE id = $1")
					.bind(id.to_string())
					.fetch_optional(pool)
					.await
					.map_err(|e| anyhow!(e).context("select room (postgres)"))?
			}
		};

		row.map(parse_room).transpose().map_err(StoreError::Backend)
	}

	async fn insert_room(&self, room: &Room) -> StoreResult<()> {
		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query("INSERT INTO rooms (id, name, description, created_by, created_at) VALUES (?, ?, ?, ?, ?)")
					.bind(room.id.to_string())
					.bind(room.name.as_str())
					.bind(&room.description)
					.bind(room.created_by.to_string())
					.bind(room.created_at.timestamp_millis())
					.execute(pool)
					.await
					.map_err(|e| map_insert_err(e, "insert room (sqlite)"))?;
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query("INSERT INTO rooms (id, name, description, created_by, created_at) VALUES ($1, $2, $3, $4, $5)")
					.bind(room.id.to_string())
					.bind(room.name.as_str())
					.bind(&room.description)
					.bind(room.created_by.to_string())
					.bind(room.created_at.timestamp_millis())
					.execute(pool)
					.await
					.map_err(|e| map_insert_err(e, "insert room (postgres)"))?;
			}
		}
		Ok(())
	}

	async fn delete_room(&self, id: RoomId) -> StoreResult<bool> {
		let deleted = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query("DELETE FROM messages WHERE room_id = ?")
					.bind(id.to_string())
					.execute(pool)
					.await
					.map_err(|e| anyhow!(e).context("delete room messages (sqlite)"))?;
				sqlx::query("DELETE FROM rooms WHERE id = ?")
					.bind(id.to_string())
					.execute(pool)
					.await
					.map_err(|e| anyhow!(e).context("delete room (sqlite)"))?
					.rows_affected()
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query("DELETE FROM messages WHERE room_id = $1")
					.bind(id.to_string())
					.execute(pool)
					.await
					.map_err(|e| anyhow!(e).context("delete room messages (postgres)"))?;
				sqlx::query("DELETE FROM rooms WHERE id = $1")
					.bind(id.to_string())
					.execute(pool)
					.await
					.map_err(|e| anyhow!(e).context("delete room (postgres)"))?
					.rows_affected()
			}
		};

		Ok(deleted > 0)
	}

	async fn insert_message(&self, message: &MessageRecord) -> StoreResult<()> {
		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query(
					"INSERT INTO messages (id, user_id, room_id, recipient_id, content, created_at) \
					VALUES (?, ?, ?, ?, ?, ?)",
				)
				.bind(message.id.to_string())
				.bind(message.sender.id.to_string())
				.bind(message.room_id.map(|r| r.to_string()))
				.bind(message.recipient_id.map(|r| r.to_string()))
				.bind(&message.content)
				.bind(message.created_at.timestamp_millis())
				.execute(pool)
				.await
				.map_err(|e| map_insert_err(e, "insert message (sqlite)"))?;
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO messages (id, user_id, room_id, recipient_id, content, created_at) \
					VALUES ($1, $2, $3, $4, $5, $6)",
				)
				.bind(message.id.to_string())
				.bind(message.sender.id.to_string())
				.bind(message.room_id.map(|r| r.to_string()))
				.bind(message.recipient_id.map(|r| r.to_string()))
				.bind(&message.content)
				.bind(message.created_at.timestamp_millis())
				.execute(pool)
				.await
				.map_err(|e| map_insert_err(e, "insert message (postgres)"))?;
			}
		}
		Ok(())
	}

	async fn recent_room_messages(&self, room_id: RoomId, limit: u32) -> StoreResult<Vec<MessageRecord>> {
		let rows: Vec<MessageRow> = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				let sql = format!("{SELECT_MESSAGE} WHERE m.room_id = ? ORDER BY m.created_at DESC LIMIT ?");
				sqlx::query_as(&sql)
					.bind(room_id.to_string())
					.bind(limit as i64)
					.fetch_all(pool)
					.await
					.map_err(|e| anyhow!(e).context("select room messages (sqlite)"))?
			}
			SqlBackend::Postgres(pool) => {
				let sql = format!("{SELECT_MESSAGE} WHERE m.room_id = $1 ORDER BY m.created_at DESC LIMIT $2");
				sqlx::query_as(&sql)
					.bind(room_id.to_string())
					.bind(limit as i64)
					.fetch_all(pool)
					.await
					.map_err(|e| anyhow!(e).context("select room messages (postgres)"))?
			}
		};

		let mut messages = rows
			.into_iter()
			.map(parse_message)
			.collect::<anyhow::Result<Vec<_>>>()
			.map_err(StoreError::Backend)?;

		// Query returns newest-first; history is delivered oldest-first.
		messages.reverse();
		Ok(messages)
	}

	async fn ban_for(&self, user_id: UserId) -> StoreResult<Option<Ban>> {
		let row: Option<BanRow> = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query_as("SELECT user_id, banned_by, reason, created_at FROM bans WHERE user_id = ?")
					.bind(user_id.to_string())
					.fetch_optional(pool)
					.await
					.map_err(|e| anyhow!(e).context("select ban (sqlite)"))?
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query_as("SELECT user_id, banned_by, reason, created_at FROM bans WHERE user_id = $1")
					.bind(user_id.to_string())
					.fetch_optional(pool)
					.await
					.map_err(|e| anyhow!(e).context("select ban (postgres)"))?
			}
		};

		row.map(parse_ban).transpose().map_err(StoreError::Backend)
	}

	async fn insert_ban(&self, ban: &Ban) -> StoreResult<()> {
		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query("INSERT INTO bans (user_id, banned_by, reason, created_at) VALUES (?, ?, ?, ?)")
					.bind(ban.user_id.to_string())
					.bind(ban.banned_by.to_string())
					.bind(&ban.reason)
					.bind(ban.created_at.timestamp_millis())
					.execute(pool)
					.await
					.map_err(|e| map_insert_err(e, "insert ban (sqlite)"))?;
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query("INSERT INTO bans (user_id, banned_by, reason, created_at) VALUES ($1, $2, $3, $4)")
					.bind(ban.user_id.to_string())
					.bind(ban.banned_by.to_string())
					.bind(&ban.reason)
					.bind(ban.created_at.timestamp_millis())
					.execute(pool)
					.await
					.map_err(|e| map_insert_err(e, "insert ban (postgres)"))?;
			}
		}
		Ok(())
	}

	async fn remove_ban(&self, user_id: UserId) -> StoreResult<bool> {
		let removed = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query("DELETE FROM bans WHERE user_id = ?")
				.bind(user_id.to_string())
				.execute(pool)
				.await
				.map_err(|e| anyhow!(e).context("delete ban (sqlite)"))?
				.rows_affected(),
			SqlBackend::Postgres(pool) => sqlx::query("DELETE FROM bans WHERE user_id = $1")
				.bind(user_id.to_string())
				.execute(pool)
				.await
				.map_err(|e| anyhow!(e).context("delete ban (postgres)"))?
				.rows_affected(),
		};

		Ok(removed > 0)
	}
}
