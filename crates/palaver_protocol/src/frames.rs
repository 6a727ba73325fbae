#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use palaver_domain::{MessageRecord, Role, Room, RoomId, UserId};
use serde::{Deserialize, Serialize};

/// One chat message as delivered to clients and in history replies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEvent {
	pub id: uuid::Uuid,
	pub content: String,
	pub username: String,
	pub role: Role,
	pub created_at: DateTime<Utc>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub room_id: Option<RoomId>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub recipient_id: Option<UserId>,
}

impl From<&MessageRecord> for MessageEvent {
	fn from(record: &MessageRecord) -> Self {
		Self {
			id: record.id,
			content: record.content.clone(),
			username: record.sender.username.clone(),
			role: record.sender.role,
			created_at: record.created_at,
			room_id: record.room_id,
			recipient_id: record.recipient_id,
		}
	}
}

/// Room metadata as exposed on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomInfo {
	pub id: RoomId,
	pub name: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub description: Option<String>,
	pub created_at: DateTime<Utc>,
}

impl From<&Room> for RoomInfo {
	fn from(room: &Room) -> Self {
		Self {
			id: room.id,
			name: room.name.as_str().to_string(),
			description: room.description.clone(),
			created_at: room.created_at,
		}
	}
}

/// One online user as exposed in `users_list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserInfo {
	pub username: String,
	pub role: Role,
}

/// Frames sent by the client over the control stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
	/// Handshake: the first frame on a fresh connection.
	Hello {
		token: String,
	},

	SendMessage {
		#[serde(default, skip_serializing_if = "Option::is_none")]
		room_id: Option<RoomId>,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		recipient_id: Option<UserId>,
		content: String,
	},

	JoinRoom {
		room_id: RoomId,
	},

	LeaveRoom {
		room_id: RoomId,
	},

	ListRooms,

	ListUsers,

	TypingStart {
		room_id: RoomId,
	},

	TypingStop {
		room_id: RoomId,
	},

	Ping {
		client_time_unix_ms: i64,
	},

	#[serde(rename = "admin:create_room")]
	CreateRoom {
		name: String,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		description: Option<String>,
	},

	#[serde(rename = "admin:delete_room")]
	DeleteRoom {
		room_id: RoomId,
	},

	#[serde(rename = "admin:ban_user")]
	BanUser {
		username: String,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		reason: Option<String>,
	},

	#[serde(rename = "admin:unban_user")]
	UnbanUser {
		username: String,
	},

	#[serde(rename = "admin:kick_user")]
	KickUser {
		username: String,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		reason: Option<String>,
	},
}

/// Frames sent by the server: command acknowledgments and pushed events share
/// the control stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
	/// Handshake succeeded; the connection is bound to this identity.
	Authenticated {
		user_id: UserId,
		username: String,
		role: Role,
	},

	Message(MessageEvent),

	MessageHistory {
		room_id: RoomId,
		messages: Vec<MessageEvent>,
	},

	RoomsList {
		rooms: Vec<RoomInfo>,
	},

	UsersList {
		room_id: RoomId,
		users: Vec<UserInfo>,
	},

	JoinedRoom {
		room_id: RoomId,
		room_name: String,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		description: Option<String>,
	},

	LeftRoom {
		room_id: RoomId,
	},

	UserJoined {
		username: String,
		room_id: RoomId,
	},

	UserLeft {
		username: String,
		room_id: RoomId,
	},

	UserTyping {
		username: String,
		room_id: RoomId,
	},

	UserStoppedTyping {
		username: String,
		room_id: RoomId,
	},

	RoomCreated {
		room: RoomInfo,
	},

	RoomDeleted {
		room_id: RoomId,
		room_name: String,
	},

	/// Terminal notice: the identity was banned; the transport closes next.
	Banned {
		reason: String,
		by: String,
	},

	/// Terminal notice: the connection was kicked; reconnecting is allowed.
	Kicked {
		reason: String,
		by: String,
	},

	Error {
		message: String,
	},

	Success {
		message: String,
	},

	Pong {
		client_time_unix_ms: i64,
		server_time_unix_ms: i64,
	},
}
