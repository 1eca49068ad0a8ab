#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Participant role within a document's chat room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
	Worker,
	Dealer,
}

impl Role {
	/// Stable string identifier.
	pub const fn as_str(self) -> &'static str {
		match self {
			Role::Worker => "worker",
			Role::Dealer => "dealer",
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
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

impl FromStr for Role {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		match s.to_ascii_lowercase().as_str() {
			"worker" | "case_worker" => Ok(Role::Worker),
			"dealer" => Ok(Role::Dealer),
			other => Err(ParseIdError::UnknownRole(other.to_string())),
		}
	}
}

/// Whether a message was typed by a participant or emitted by the room itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
	User,
	System,
}

impl MessageKind {
	pub const fn as_str(self) -> &'static str {
		match self {
			MessageKind::User => "user",
			MessageKind::System => "system",
		}
	}
}

impl fmt::Display for MessageKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Account identifier from the surrounding application.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
	/// Create a non-empty `UserId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}
	pub fn as_str(&self) -> &str {
		&self.0
	}
	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for UserId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for UserId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		UserId::new(s.to_string())
	}
}

macro_rules! numeric_id {
	($(#[$doc:meta])* $name:ident) => {
		$(#[$doc])*
		#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
		#[serde(transparent)]
		pub struct $name(pub u64);

		impl $name {
			pub const fn as_u64(self) -> u64 {
				self.0
			}
		}

		impl fmt::Display for $name {
			fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				write!(f, "{}", self.0)
			}
		}

		impl FromStr for $name {
			type Err = ParseIdError;

			fn from_str(s: &str) -> Result<Self, Self::Err> {
				let s = s.trim();
				if s.is_empty() {
					return Err(ParseIdError::Empty);
				}
				s.parse::<u64>()
					.map(Self)
					.map_err(|_| ParseIdError::InvalidFormat(format!("expected unsigned integer, got {s:?}")))
			}
		}
	};
}

numeric_id!(
	/// Business document identifier; each document owns at most one room.
	DocumentId
);
numeric_id!(
	/// Server-assigned room identifier.
	RoomId
);
numeric_id!(
	/// Server-assigned message identifier, strictly increasing per room.
	MessageId
);

/// An authenticated participant as resolved from a credential token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
	pub user_id: UserId,
	pub name: String,
	pub role: Role,
}

/// A chat room bound 1:1 to a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRoom {
	pub id: RoomId,
	pub document_id: DocumentId,
	pub dealer_participant_id: UserId,
	pub worker_participant_id: Option<UserId>,
	pub created_at_unix_ms: i64,
}

/// A persisted chat message, denormalized with sender display data so
/// clients can render it without a second lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
	pub id: MessageId,
	pub room_id: RoomId,
	pub sender_id: Option<UserId>,
	pub sender_role: Option<Role>,
	pub sender_name: String,
	pub text: String,
	pub kind: MessageKind,
	pub created_at_unix_ms: i64,
}

/// Message body before the store assigns an id and ordering position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
	pub sender_id: Option<UserId>,
	pub sender_role: Option<Role>,
	pub sender_name: String,
	pub text: String,
	pub kind: MessageKind,
	pub created_at_unix_ms: i64,
}

impl NewMessage {
	/// A message typed by an authenticated participant.
	pub fn user(identity: &Identity, text: impl Into<String>, created_at_unix_ms: i64) -> Self {
		Self {
			sender_id: Some(identity.user_id.clone()),
			sender_role: Some(identity.role),
			sender_name: identity.name.clone(),
			text: text.into(),
			kind: MessageKind::User,
			created_at_unix_ms,
		}
	}

	/// A message emitted by the room itself (no sender).
	pub fn system(text: impl Into<String>, created_at_unix_ms: i64) -> Self {
		Self {
			sender_id: None,
			sender_role: None,
			sender_name: String::new(),
			text: text.into(),
			kind: MessageKind::System,
			created_at_unix_ms,
		}
	}
}
