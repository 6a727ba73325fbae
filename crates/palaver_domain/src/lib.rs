#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum chat message length in characters (after trimming).
pub const MAX_MESSAGE_CHARS: usize = 2000;

/// Maximum room name length in characters.
pub const MAX_ROOM_NAME_CHARS: usize = 30;

/// Account role of an authenticated identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
	User,
	Admin,
}

impl Role {
	/// Stable string identifier.
	pub const fn as_str(self) -> &'static str {
		match self {
			Role::User => "user",
			Role::Admin => "admin",
		}
	}
}

impl fmt::Display for Role {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("unknown role: {0}")]
	UnknownRole(String),
	#[error("invalid uuid: {0}")]
	InvalidUuid(String),
}

impl FromStr for Role {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		match s.to_ascii_lowercase().as_str() {
			"user" => Ok(Role::User),
			"admin" => Ok(Role::Admin),
			other => Err(ParseIdError::UnknownRole(other.to_string())),
		}
	}
}

/// Unique identifier of a user account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub uuid::Uuid);

impl UserId {
	/// Create a new random user id.
	pub fn new_v4() -> Self {
		Self(uuid::Uuid::new_v4())
	}
}

impl fmt::Display for UserId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for UserId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}
		uuid::Uuid::parse_str(s)
			.map(Self)
			.map_err(|_| ParseIdError::InvalidUuid(s.to_string()))
	}
}

/// Unique identifier of a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(pub uuid::Uuid);

impl RoomId {
	/// Create a new random room id.
	pub fn new_v4() -> Self {
		Self(uuid::Uuid::new_v4())
	}
}

impl fmt::Display for RoomId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for RoomId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}
		uuid::Uuid::parse_str(s)
			.map(Self)
			.map_err(|_| ParseIdError::InvalidUuid(s.to_string()))
	}
}

/// Validated room name: 1..=30 chars of `[a-zA-Z0-9_-]`, stored lowercase.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomName(String);

impl RoomName {
	/// Validate and normalize a raw room name.
	pub fn new(raw: &str) -> Result<Self, ChatError> {
		let trimmed = raw.trim();
		if trimmed.is_empty() {
			return Err(ChatError::Validation("Room name required".to_string()));
		}
		if trimmed.chars().count() > MAX_ROOM_NAME_CHARS {
			return Err(ChatError::Validation(
				"Room name too long (max 30 characters)".to_string(),
			));
		}
		if !trimmed.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
			return Err(ChatError::Validation(
				"Room name can only contain letters, numbers, _ and -".to_string(),
			));
		}
		Ok(Self(trimmed.to_ascii_lowercase()))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for RoomName {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

/// Authenticated user bound to a connection; immutable for its lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
	pub id: UserId,
	pub username: String,
	pub role: Role,
}

impl Identity {
	pub fn is_admin(&self) -> bool {
		self.role == Role::Admin
	}
}

/// A named broadcast channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
	pub id: RoomId,
	pub name: RoomName,
	pub description: Option<String>,
	pub created_by: UserId,
	pub created_at: DateTime<Utc>,
}

/// One persisted chat utterance; never mutated after creation.
///
/// Exactly one of `room_id` / `recipient_id` is set; the router enforces the
/// exclusivity before a record is built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
	pub id: uuid::Uuid,
	pub sender: Identity,
	pub room_id: Option<RoomId>,
	pub recipient_id: Option<UserId>,
	pub content: String,
	pub created_at: DateTime<Utc>,
}

/// Moderation record: `user_id` may not send messages while this exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ban {
	pub user_id: UserId,
	pub banned_by: UserId,
	pub reason: String,
	pub created_at: DateTime<Utc>,
}

/// Error taxonomy for every operation the core rejects.
///
/// `Display` is the user-visible message delivered on the wire; use
/// [`ChatError::kind`] for log/metric labels.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChatError {
	/// Invalid, missing, or expired credential; fatal to the connection attempt.
	#[error("{0}")]
	Authentication(String),

	/// Malformed input; reported to the originating connection only.
	#[error("{0}")]
	Validation(String),

	/// Non-admin attempting an admin operation.
	#[error("{0}")]
	Privilege(String),

	/// Duplicate room name, already-banned target.
	#[error("{0}")]
	Conflict(String),

	/// Unknown room or user.
	#[error("{0}")]
	NotFound(String),

	/// Data store or auth provider failure, surfaced generically.
	#[error("{0}")]
	Dependency(String),
}

impl ChatError {
	/// Short classification label.
	pub const fn kind(&self) -> &'static str {
		match self {
			ChatError::Authentication(_) => "authentication",
			ChatError::Validation(_) => "validation",
			ChatError::Privilege(_) => "privilege",
			ChatError::Conflict(_) => "conflict",
			ChatError::NotFound(_) => "not_found",
			ChatError::Dependency(_) => "dependency",
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn role_parse_and_display() {
		assert_eq!("admin".parse::<Role>().unwrap(), Role::Admin);
		assert_eq!("User".parse::<Role>().unwrap(), Role::User);
		assert_eq!(Role::Admin.to_string(), "admin");
		assert!("moderator".parse::<Role>().is_err());
	}

	#[test]
	fn room_name_normalizes_case_and_whitespace() {
		let name = RoomName::new("  General ").unwrap();
		assert_eq!(name.as_str(), "general");

		let name = RoomName::new("dev_team-2").unwrap();
		assert_eq!(name.as_str(), "dev_team-2");
	}

	#[test]
	fn room_name_rejects_bad_input() {
		assert!(RoomName::new("").is_err());
		assert!(RoomName::new("   ").is_err());
		assert!(RoomName::new(&"x".repeat(31)).is_err());
		assert!(RoomName::new("has space").is_err());
		assert!(RoomName::new("emoji💬").is_err());
	}

	#[test]
	fn room_name_at_limit_is_accepted() {
		let name = RoomName::new(&"a".repeat(30)).unwrap();
		assert_eq!(name.as_str().len(), 30);
	}

	#[test]
	fn ids_roundtrip_via_str() {
		let id = UserId::new_v4();
		assert_eq!(id.to_string().parse::<UserId>().unwrap(), id);

		let id = RoomId::new_v4();
		assert_eq!(id.to_string().parse::<RoomId>().unwrap(), id);

		assert!("not-a-uuid".parse::<UserId>().is_err());
		assert!("".parse::<RoomId>().is_err());
	}

	#[test]
	fn chat_error_display_is_the_user_message() {
		let err = ChatError::Validation("Message cannot be empty".to_string());
		assert_eq!(err.to_string(), "Message cannot be empty");
		assert_eq!(err.kind(), "validation");
	}
}
