#![forbid(unsafe_code)]

use casechat_domain::{ChatMessage, ChatRoom, DocumentId, Identity, RoomId};
use serde::{Deserialize, Serialize};

/// Commands a client may send on its control stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ClientCommand {
	/// Attach an identity to the connection. Valid once; re-auth with the
	/// same identity is accepted as a no-op.
	Auth { credential_token: String },
	/// Resolve or create the room bound to a document.
	ResolveRoom { document_id: DocumentId },
	/// Join an existing room's membership set. Idempotent.
	JoinRoom { room_id: RoomId },
	/// Leave a room's membership set.
	LeaveRoom { room_id: RoomId },
	/// Append a message to a joined room.
	SendMessage { room_id: RoomId, text: String },
	/// Keepalive.
	Ping { client_time_unix_ms: i64 },
}

/// Events the server pushes to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerEvent {
	AuthSuccess {
		identity: Identity,
	},
	AuthFailed {
		reason: String,
	},
	RoomResolved {
		room: ChatRoom,
	},
	/// Sent only to the joining connection.
	JoinedRoom {
		room_id: RoomId,
	},
	/// Full room history, ascending by message id. Sent once per join,
	/// directly after `JoinedRoom`.
	History {
		room_id: RoomId,
		messages: Vec<ChatMessage>,
	},
	LeftRoom {
		room_id: RoomId,
	},
	/// Fanned out to every member of the room.
	NewMessage {
		room_id: RoomId,
		message: ChatMessage,
	},
	Pong {
		client_time_unix_ms: i64,
		server_time_unix_ms: i64,
	},
	/// Reported only to the offending connection.
	Error {
		code: ErrorCode,
		message: String,
	},
}

/// Protocol-visible error classes. Transport failures are not errors at
/// this layer; clients recover them by reconnecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
	Unauthorized,
	Forbidden,
	NotFound,
	InvalidInput,
}

impl ErrorCode {
	pub const fn as_str(self) -> &'static str {
		match self {
			ErrorCode::Unauthorized => "unauthorized",
			ErrorCode::Forbidden => "forbidden",
			ErrorCode::NotFound => "not_found",
			ErrorCode::InvalidInput => "invalid_input",
		}
	}
}

impl core::fmt::Display for ErrorCode {
	fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
		f.write_str(self.as_str())
	}
}

impl ServerEvent {
	/// Room this event belongs to, if it is room-scoped.
	pub fn room_id(&self) -> Option<RoomId> {
		match self {
			ServerEvent::JoinedRoom { room_id }
			| ServerEvent::History { room_id, .. }
			| ServerEvent::LeftRoom { room_id }
			| ServerEvent::NewMessage { room_id, .. } => Some(*room_id),
			ServerEvent::RoomResolved { room } => Some(room.id),
			_ => None,
		}
	}
}
