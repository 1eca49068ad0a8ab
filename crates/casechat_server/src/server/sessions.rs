#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};

use casechat_domain::{Identity, RoomId};
use tokio::sync::Mutex;

use crate::server::error::ChatError;

/// Per-connection session state: the authenticated identity and the set of
/// joined rooms. Entries live exactly as long as the transport.
#[derive(Default)]
pub struct SessionManager {
	inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
	identities: HashMap<u64, Identity>,
	joined: HashMap<u64, HashSet<RoomId>>,
}

impl SessionManager {
	pub fn new() -> Self {
		Self::default()
	}

	/// Attach an identity to a connection. Identity is immutable once set;
	/// re-auth with the same `user_id` is accepted as a no-op so reconnect
	/// flows can replay their auth command.
	pub async fn set_identity(&self, conn_id: u64, identity: Identity) -> Result<Identity, ChatError> {
		let mut inner = self.inner.lock().await;
		match inner.identities.get(&conn_id) {
			None => {
				inner.identities.insert(conn_id, identity.clone());
				Ok(identity)
			}
			Some(existing) if existing.user_id == identity.user_id => Ok(existing.clone()),
			Some(_) => Err(ChatError::InvalidInput(
				"connection is already authenticated as a different user".to_string(),
			)),
		}
	}

	pub async fn identity(&self, conn_id: u64) -> Option<Identity> {
		self.inner.lock().await.identities.get(&conn_id).cloned()
	}

	/// Record a join. Returns false when the connection was already a member.
	pub async fn mark_joined(&self, conn_id: u64, room_id: RoomId) -> bool {
		let mut inner = self.inner.lock().await;
		inner.joined.entry(conn_id).or_default().insert(room_id)
	}

	pub async fn mark_left(&self, conn_id: u64, room_id: RoomId) -> bool {
		let mut inner = self.inner.lock().await;
		inner.joined.get_mut(&conn_id).is_some_and(|rooms| rooms.remove(&room_id))
	}

	pub async fn is_joined(&self, conn_id: u64, room_id: RoomId) -> bool {
		let inner = self.inner.lock().await;
		inner.joined.get(&conn_id).is_some_and(|rooms| rooms.contains(&room_id))
	}

	/// Drop all state for a closed connection, returning the rooms it was in.
	pub async fn remove_conn(&self, conn_id: u64) -> Vec<RoomId> {
		let mut inner = self.inner.lock().await;
		inner.identities.remove(&conn_id);
		inner
			.joined
			.remove(&conn_id)
			.map(|rooms| rooms.into_iter().collect())
			.unwrap_or_default()
	}
}
