#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use casechat_domain::{ChatMessage, NewMessage, RoomId};
use casechat_protocol::wire::ServerEvent;
use casechat_util::time::unix_millis_now;
use tokio::sync::{Mutex, Notify, mpsc};
use tracing::{debug, warn};

use crate::server::error::ChatError;
use crate::server::hub::RoomHub;
use crate::server::registry::RoomRegistry;
use crate::server::sessions::SessionManager;
use crate::server::store::MessageStore;

/// Serializes membership mutation, persistence and fan-out per room.
///
/// One async mutex per room linearizes join/leave/send/broadcast for that
/// room; rooms are independent. A message is persisted (and its id
/// assigned) before its broadcast is issued, and a join snapshots history
/// under the same lock, so no member can observe a gap.
pub struct Dispatcher {
	store: Arc<dyn MessageStore>,
	registry: Arc<RoomRegistry>,
	hub: RoomHub,
	sessions: Arc<SessionManager>,
	room_locks: Mutex<HashMap<RoomId, Arc<Mutex<()>>>>,
}

impl Dispatcher {
	pub fn new(
		store: Arc<dyn MessageStore>,
		registry: Arc<RoomRegistry>,
		hub: RoomHub,
		sessions: Arc<SessionManager>,
	) -> Self {
		Self {
			store,
			registry,
			hub,
			sessions,
			room_locks: Mutex::new(HashMap::new()),
		}
	}

	async fn room_lock(&self, room_id: RoomId) -> Arc<Mutex<()>> {
		let mut locks = self.room_locks.lock().await;
		Arc::clone(locks.entry(room_id).or_default())
	}

	/// Add `conn_id` to the room and deliver `joined_room` plus the full
	/// ascending history into its event queue. Idempotent; a repeated join
	/// re-sends the snapshot, which clients dedup by message id.
	pub async fn join(
		&self,
		conn_id: u64,
		room_id: RoomId,
		tx: mpsc::Sender<ServerEvent>,
		shutdown: Arc<Notify>,
	) -> Result<(), ChatError> {
		let identity = self
			.sessions
			.identity(conn_id)
			.await
			.ok_or_else(|| ChatError::Unauthorized("authenticate before joining a room".to_string()))?;
		let room = self
			.store
			.room_by_id(room_id)
			.await?
			.ok_or_else(|| ChatError::NotFound(format!("room {room_id}")))?;
		self.registry.authorize(room.document_id, &identity).await?;
		self.registry.claim_worker_if_first(room, &identity).await?;

		let lock = self.room_lock(room_id).await;
		let _guard = lock.lock().await;

		self.sessions.mark_joined(conn_id, room_id).await;
		self.hub.subscribe(room_id, conn_id, tx.clone(), Arc::clone(&shutdown)).await;
		let history = self.store.history(room_id).await?;

		// Queued under the room lock so no later broadcast can outrun the
		// snapshot.
		for event in [ServerEvent::JoinedRoom { room_id }, ServerEvent::History {
			room_id,
			messages: history,
		}] {
			if tx.try_send(event).is_err() {
				warn!(conn_id, %room_id, "event queue full during join; dropping connection");
				shutdown.notify_one();
				return Ok(());
			}
		}

		debug!(conn_id, %room_id, user = %identity.user_id, "joined room");
		Ok(())
	}

	/// Validate, persist and fan out one message.
	pub async fn send(&self, conn_id: u64, room_id: RoomId, text: &str) -> Result<ChatMessage, ChatError> {
		let identity = self
			.sessions
			.identity(conn_id)
			.await
			.ok_or_else(|| ChatError::Unauthorized("authenticate before sending".to_string()))?;

		let trimmed = text.trim();
		if trimmed.is_empty() {
			return Err(ChatError::InvalidInput("message text is empty".to_string()));
		}

		if !self.sessions.is_joined(conn_id, room_id).await {
			return Err(ChatError::Forbidden(format!("join room {room_id} before sending")));
		}

		let lock = self.room_lock(room_id).await;
		let _guard = lock.lock().await;

		let message = self
			.store
			.append_message(room_id, NewMessage::user(&identity, trimmed, unix_millis_now()))
			.await?;
		metrics::counter!("casechat_server_messages_total").increment(1);

		self.hub
			.broadcast(room_id, &ServerEvent::NewMessage {
				room_id,
				message: message.clone(),
			})
			.await;

		Ok(message)
	}

	/// Remove `conn_id` from the room. Returns whether it was a member.
	pub async fn leave(&self, conn_id: u64, room_id: RoomId) -> bool {
		// Never materialize a lock entry for a client-supplied room id the
		// connection did not join.
		if !self.sessions.is_joined(conn_id, room_id).await {
			return false;
		}

		let lock = self.room_lock(room_id).await;
		let _guard = lock.lock().await;

		let was_member = self.sessions.mark_left(conn_id, room_id).await;
		self.hub.unsubscribe(room_id, conn_id).await;
		was_member
	}

	/// Leave-all cleanup when a transport closes.
	pub async fn disconnect(&self, conn_id: u64) {
		let rooms = self.sessions.remove_conn(conn_id).await;
		for room_id in rooms {
			let lock = self.room_lock(room_id).await;
			let _guard = lock.lock().await;
			self.hub.unsubscribe(room_id, conn_id).await;
		}
	}
}
