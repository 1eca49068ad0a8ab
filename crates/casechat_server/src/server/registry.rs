#![forbid(unsafe_code)]

use std::sync::Arc;

use casechat_directory::{DocumentRecord, DocumentStore};
use casechat_domain::{ChatMessage, ChatRoom, DocumentId, Identity, NewMessage, Role};
use casechat_util::time::unix_millis_now;
use tokio::sync::Mutex;
use tracing::info;

use crate::server::error::ChatError;
use crate::server::store::MessageStore;

/// Owns the document-to-room binding. Rooms are created lazily on first
/// resolve and never deleted, even after the underlying document is purged.
pub struct RoomRegistry {
	store: Arc<dyn MessageStore>,
	documents: Arc<dyn DocumentStore>,
	// Serializes first-access creation so exactly one room exists per
	// document; the losing racer re-reads instead of surfacing a conflict.
	create_lock: Mutex<()>,
}

impl RoomRegistry {
	pub fn new(store: Arc<dyn MessageStore>, documents: Arc<dyn DocumentStore>) -> Self {
		Self {
			store,
			documents,
			create_lock: Mutex::new(()),
		}
	}

	/// Authorization check against the document of record. Re-run on every
	/// resolve and join; a revoked dealer loses access immediately.
	pub async fn authorize(&self, document_id: DocumentId, identity: &Identity) -> Result<DocumentRecord, ChatError> {
		let record = self.documents.fetch_document(document_id).await?;
		if !record.permits(identity) {
			return Err(ChatError::Forbidden(format!(
				"user {} is not a participant of document {document_id}",
				identity.user_id
			)));
		}
		Ok(record)
	}

	/// Resolve the room bound to `document_id`, creating it on first access.
	/// Returns the room together with its full history.
	pub async fn resolve_or_create(
		&self,
		document_id: DocumentId,
		identity: &Identity,
	) -> Result<(ChatRoom, Vec<ChatMessage>), ChatError> {
		let record = self.authorize(document_id, identity).await?;

		if let Some(room) = self.store.room_by_document(document_id).await? {
			let room = self.claim_worker_if_first(room, identity).await?;
			let history = self.store.history(room.id).await?;
			return Ok((room, history));
		}

		let _guard = self.create_lock.lock().await;

		// Another resolve may have created the room while we waited.
		if let Some(room) = self.store.room_by_document(document_id).await? {
			let room = self.claim_worker_if_first(room, identity).await?;
			let history = self.store.history(room.id).await?;
			return Ok((room, history));
		}

		let worker_id = (identity.role == Role::Worker).then(|| identity.user_id.clone());
		let genesis = NewMessage::system("room created", unix_millis_now());
		let (room, message) = self
			.store
			.create_room(document_id, record.dealer_id, worker_id, genesis)
			.await?;

		info!(%document_id, room_id = %room.id, creator = %identity.user_id, "created chat room");
		metrics::counter!("casechat_server_rooms_created_total").increment(1);

		Ok((room, vec![message]))
	}

	/// Bind the worker slot to the first worker identity that resolves or
	/// joins the room. Later workers keep access but not the slot.
	pub(crate) async fn claim_worker_if_first(
		&self,
		mut room: ChatRoom,
		identity: &Identity,
	) -> Result<ChatRoom, ChatError> {
		if identity.role == Role::Worker && room.worker_participant_id.is_none() {
			self.store.set_worker_participant(room.id, &identity.user_id).await?;
			// Re-read; a concurrent worker may have claimed first.
			if let Some(updated) = self.store.room_by_id(room.id).await? {
				room = updated;
			}
		}
		Ok(room)
	}
}
