#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::str::FromStr as _;

use anyhow::Context as _;
use async_trait::async_trait;
use casechat_domain::{ChatMessage, ChatRoom, DocumentId, MessageId, MessageKind, NewMessage, Role, RoomId, UserId};
use sqlx::Row as _;
use tokio::sync::Mutex;
use tracing::info;

/// Durable room and message state. Message ids are assigned here and are
/// strictly increasing per room; the room-creation system message takes
/// id 0 so the first participant message is always id 1.
#[async_trait]
pub trait MessageStore: Send + Sync {
	/// Create the room for `document_id` together with its system
	/// "room created" message. Fails if the document already has a room.
	async fn create_room(
		&self,
		document_id: DocumentId,
		dealer_id: UserId,
		worker_id: Option<UserId>,
		genesis: NewMessage,
	) -> anyhow::Result<(ChatRoom, ChatMessage)>;

	async fn room_by_document(&self, document_id: DocumentId) -> anyhow::Result<Option<ChatRoom>>;

	async fn room_by_id(&self, room_id: RoomId) -> anyhow::Result<Option<ChatRoom>>;

	/// Record the first worker participant. A no-op when already set.
	async fn set_worker_participant(&self, room_id: RoomId, worker_id: &UserId) -> anyhow::Result<()>;

	/// Append a message, assigning the next id for the room.
	async fn append_message(&self, room_id: RoomId, msg: NewMessage) -> anyhow::Result<ChatMessage>;

	/// Full room history, ascending by message id.
	async fn history(&self, room_id: RoomId) -> anyhow::Result<Vec<ChatMessage>>;
}

/// In-memory store for tests and persistence-disabled deployments.
#[derive(Default)]
pub struct MemoryStore {
	inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
	next_room_id: u64,
	rooms: HashMap<RoomId, ChatRoom>,
	by_document: HashMap<DocumentId, RoomId>,
	messages: HashMap<RoomId, Vec<ChatMessage>>,
}

impl MemoryStore {
	pub fn new() -> Self {
		Self::default()
	}
}

fn materialize(room_id: RoomId, id: MessageId, msg: NewMessage) -> ChatMessage {
	ChatMessage {
		id,
		room_id,
		sender_id: msg.sender_id,
		sender_role: msg.sender_role,
		sender_name: msg.sender_name,
		text: msg.text,
		kind: msg.kind,
		created_at_unix_ms: msg.created_at_unix_ms,
	}
}

#[async_trait]
impl MessageStore for MemoryStore {
	async fn create_room(
		&self,
		document_id: DocumentId,
		dealer_id: UserId,
		worker_id: Option<UserId>,
		genesis: NewMessage,
	) -> anyhow::Result<(ChatRoom, ChatMessage)> {
		let mut inner = self.inner.lock().await;
		if inner.by_document.contains_key(&document_id) {
			anyhow::bail!("document {document_id} already has a room");
		}

		inner.next_room_id += 1;
		let room_id = RoomId(inner.next_room_id);
		let room = ChatRoom {
			id: room_id,
			document_id,
			dealer_participant_id: dealer_id,
			worker_participant_id: worker_id,
			created_at_unix_ms: genesis.created_at_unix_ms,
		};

		let message = materialize(room_id, MessageId(0), genesis);
		inner.rooms.insert(room_id, room.clone());
		inner.by_document.insert(document_id, room_id);
		inner.messages.insert(room_id, vec![message.clone()]);

		Ok((room, message))
	}

	async fn room_by_document(&self, document_id: DocumentId) -> anyhow::Result<Option<ChatRoom>> {
		let inner = self.inner.lock().await;
		Ok(inner
			.by_document
			.get(&document_id)
			.and_then(|room_id| inner.rooms.get(room_id))
			.cloned())
	}

	async fn room_by_id(&self, room_id: RoomId) -> anyhow::Result<Option<ChatRoom>> {
		let inner = self.inner.lock().await;
		Ok(inner.rooms.get(&room_id).cloned())
	}

	async fn set_worker_participant(&self, room_id: RoomId, worker_id: &UserId) -> anyhow::Result<()> {
		let mut inner = self.inner.lock().await;
		let room = inner
			.rooms
			.get_mut(&room_id)
			.with_context(|| format!("room {room_id} not found"))?;
		if room.worker_participant_id.is_none() {
			room.worker_participant_id = Some(worker_id.clone());
		}
		Ok(())
	}

	async fn append_message(&self, room_id: RoomId, msg: NewMessage) -> anyhow::Result<ChatMessage> {
		let mut inner = self.inner.lock().await;
		let messages = inner
			.messages
			.get_mut(&room_id)
			.with_context(|| format!("room {room_id} not found"))?;

		let next = messages.last().map(|m| m.id.as_u64() + 1).unwrap_or(1);
		let message = materialize(room_id, MessageId(next), msg);
		messages.push(message.clone());
		Ok(message)
	}

	async fn history(&self, room_id: RoomId) -> anyhow::Result<Vec<ChatMessage>> {
		let inner = self.inner.lock().await;
		Ok(inner.messages.get(&room_id).cloned().unwrap_or_default())
	}
}

/// sqlite-backed store; message id assignment runs in a transaction so
/// concurrent appends never reuse an id.
pub struct SqliteStore {
	pool: sqlx::SqlitePool,
}

impl SqliteStore {
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		let pool = sqlx::SqlitePool::connect(database_url).await.context("connect sqlite")?;
		sqlx::migrate!("migrations/sqlite")
			.run(&pool)
			.await
			.context("run sqlite migrations")?;

		info!(database_url, "sqlite message store ready");
		Ok(Self { pool })
	}

	fn room_from_row(row: &sqlx::sqlite::SqliteRow) -> anyhow::Result<ChatRoom> {
		let worker: Option<String> = row.get("worker_participant_id");
		let worker_participant_id = match worker {
			Some(w) => Some(UserId::new(w).map_err(anyhow::Error::msg)?),
			None => None,
		};

		Ok(ChatRoom {
			id: RoomId(row.get::<i64, _>("id") as u64),
			document_id: DocumentId(row.get::<i64, _>("document_id") as u64),
			dealer_participant_id: UserId::new(row.get::<String, _>("dealer_participant_id"))
				.map_err(anyhow::Error::msg)?,
			worker_participant_id,
			created_at_unix_ms: row.get("created_at_unix_ms"),
		})
	}

	fn message_from_row(row: &sqlx::sqlite::SqliteRow) -> anyhow::Result<ChatMessage> {
		let sender: Option<String> = row.get("sender_id");
		let sender_id = match sender {
			Some(s) => Some(UserId::new(s).map_err(anyhow::Error::msg)?),
			None => None,
		};
		let role: Option<String> = row.get("sender_role");
		let sender_role = match role {
			Some(r) => Some(Role::from_str(&r).map_err(anyhow::Error::msg)?),
			None => None,
		};
		let kind: String = row.get("kind");
		let kind = match kind.as_str() {
			"system" => MessageKind::System,
			_ => MessageKind::User,
		};

		Ok(ChatMessage {
			id: MessageId(row.get::<i64, _>("id") as u64),
			room_id: RoomId(row.get::<i64, _>("room_id") as u64),
			sender_id,
			sender_role,
			sender_name: row.get("sender_name"),
			text: row.get("text"),
			kind,
			created_at_unix_ms: row.get("created_at_unix_ms"),
		})
	}
}

#[async_trait]
impl MessageStore for SqliteStore {
	async fn create_room(
		&self,
		document_id: DocumentId,
		dealer_id: UserId,
		worker_id: Option<UserId>,
		genesis: NewMessage,
	) -> anyhow::Result<(ChatRoom, ChatMessage)> {
		let mut tx = self.pool.begin().await.context("begin create_room tx")?;

		let row = sqlx::query(
			"INSERT INTO chat_rooms (document_id, dealer_participant_id, worker_participant_id, created_at_unix_ms) \
			 VALUES (?1, ?2, ?3, ?4) RETURNING id",
		)
		.bind(document_id.as_u64() as i64)
		.bind(dealer_id.as_str())
		.bind(worker_id.as_ref().map(|w| w.as_str()))
		.bind(genesis.created_at_unix_ms)
		.fetch_one(&mut *tx)
		.await
		.context("insert room")?;
		let room_id = RoomId(row.get::<i64, _>("id") as u64);

		sqlx::query(
			"INSERT INTO chat_messages (room_id, id, sender_id, sender_role, sender_name, text, kind, created_at_unix_ms) \
			 VALUES (?1, 0, NULL, NULL, ?2, ?3, ?4, ?5)",
		)
		.bind(room_id.as_u64() as i64)
		.bind(genesis.sender_name.as_str())
		.bind(genesis.text.as_str())
		.bind(genesis.kind.as_str())
		.bind(genesis.created_at_unix_ms)
		.execute(&mut *tx)
		.await
		.context("insert room-created message")?;

		tx.commit().await.context("commit create_room tx")?;

		let room = ChatRoom {
			id: room_id,
			document_id,
			dealer_participant_id: dealer_id,
			worker_participant_id: worker_id,
			created_at_unix_ms: genesis.created_at_unix_ms,
		};
		let message = materialize(room_id, MessageId(0), genesis);
		Ok((room, message))
	}

	async fn room_by_document(&self, document_id: DocumentId) -> anyhow::Result<Option<ChatRoom>> {
		let row = sqlx::query("SELECT * FROM chat_rooms WHERE document_id = ?1")
			.bind(document_id.as_u64() as i64)
			.fetch_optional(&self.pool)
			.await
			.context("select room by document")?;
		row.map(|r| Self::room_from_row(&r)).transpose()
	}

	async fn room_by_id(&self, room_id: RoomId) -> anyhow::Result<Option<ChatRoom>> {
		let row = sqlx::query("SELECT * FROM chat_rooms WHERE id = ?1")
			.bind(room_id.as_u64() as i64)
			.fetch_optional(&self.pool)
			.await
			.context("select room by id")?;
		row.map(|r| Self::room_from_row(&r)).transpose()
	}

	async fn set_worker_participant(&self, room_id: RoomId, worker_id: &UserId) -> anyhow::Result<()> {
		sqlx::query("UPDATE chat_rooms SET worker_participant_id = ?1 WHERE id = ?2 AND worker_participant_id IS NULL")
			.bind(worker_id.as_str())
			.bind(room_id.as_u64() as i64)
			.execute(&self.pool)
			.await
			.context("set worker participant")?;
		Ok(())
	}

	async fn append_message(&self, room_id: RoomId, msg: NewMessage) -> anyhow::Result<ChatMessage> {
		let mut tx = self.pool.begin().await.context("begin append tx")?;

		let exists = sqlx::query("SELECT id FROM chat_rooms WHERE id = ?1")
			.bind(room_id.as_u64() as i64)
			.fetch_optional(&mut *tx)
			.await
			.context("check room exists")?;
		if exists.is_none() {
			anyhow::bail!("room {room_id} not found");
		}

		let next: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(id) + 1, 1) FROM chat_messages WHERE room_id = ?1")
			.bind(room_id.as_u64() as i64)
			.fetch_one(&mut *tx)
			.await
			.context("next message id")?;

		sqlx::query(
			"INSERT INTO chat_messages (room_id, id, sender_id, sender_role, sender_name, text, kind, created_at_unix_ms) \
			 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
		)
		.bind(room_id.as_u64() as i64)
		.bind(next)
		.bind(msg.sender_id.as_ref().map(|s| s.as_str()))
		.bind(msg.sender_role.map(|r| r.as_str()))
		.bind(msg.sender_name.as_str())
		.bind(msg.text.as_str())
		.bind(msg.kind.as_str())
		.bind(msg.created_at_unix_ms)
		.execute(&mut *tx)
		.await
		.context("insert message")?;

		tx.commit().await.context("commit append tx")?;

		Ok(materialize(room_id, MessageId(next as u64), msg))
	}

	async fn history(&self, room_id: RoomId) -> anyhow::Result<Vec<ChatMessage>> {
		let rows = sqlx::query("SELECT * FROM chat_messages WHERE room_id = ?1 ORDER BY id ASC")
			.bind(room_id.as_u64() as i64)
			.fetch_all(&self.pool)
			.await
			.context("select history")?;
		rows.iter().map(Self::message_from_row).collect()
	}
}

#[cfg(test)]
mod tests {
	use casechat_domain::Identity;

	use super::*;

	fn worker_identity() -> Identity {
		Identity {
			user_id: UserId::new("w1").unwrap(),
			name: "Worker One".to_string(),
			role: Role::Worker,
		}
	}

	#[tokio::test]
	async fn memory_ids_start_at_one_and_increase() {
		let store = MemoryStore::new();
		let (room, genesis) = store
			.create_room(
				DocumentId(7),
				UserId::new("d1").unwrap(),
				None,
				NewMessage::system("room created", 100),
			)
			.await
			.unwrap();
		assert_eq!(genesis.id, MessageId(0));
		assert_eq!(genesis.kind, MessageKind::System);

		let identity = worker_identity();
		let m1 = store
			.append_message(room.id, NewMessage::user(&identity, "first", 101))
			.await
			.unwrap();
		let m2 = store
			.append_message(room.id, NewMessage::user(&identity, "second", 102))
			.await
			.unwrap();
		assert_eq!(m1.id, MessageId(1));
		assert_eq!(m2.id, MessageId(2));

		let history = store.history(room.id).await.unwrap();
		let ids: Vec<u64> = history.iter().map(|m| m.id.as_u64()).collect();
		assert_eq!(ids, vec![0, 1, 2]);
	}

	#[tokio::test]
	async fn memory_one_room_per_document() {
		let store = MemoryStore::new();
		store
			.create_room(
				DocumentId(7),
				UserId::new("d1").unwrap(),
				None,
				NewMessage::system("room created", 100),
			)
			.await
			.unwrap();
		assert!(
			store
				.create_room(
					DocumentId(7),
					UserId::new("d1").unwrap(),
					None,
					NewMessage::system("room created", 101),
				)
				.await
				.is_err()
		);
	}

	#[tokio::test]
	async fn memory_worker_claim_is_first_writer_wins() {
		let store = MemoryStore::new();
		let (room, _) = store
			.create_room(
				DocumentId(9),
				UserId::new("d1").unwrap(),
				None,
				NewMessage::system("room created", 100),
			)
			.await
			.unwrap();

		store
			.set_worker_participant(room.id, &UserId::new("w1").unwrap())
			.await
			.unwrap();
		store
			.set_worker_participant(room.id, &UserId::new("w2").unwrap())
			.await
			.unwrap();

		let room = store.room_by_id(room.id).await.unwrap().unwrap();
		assert_eq!(room.worker_participant_id.unwrap().as_str(), "w1");
	}

	fn temp_db_url(name: &str) -> String {
		let path = std::env::temp_dir().join(format!("casechat-{name}-{}.db", std::process::id()));
		let _ = std::fs::remove_file(&path);
		format!("sqlite:{}?mode=rwc", path.display())
	}

	#[tokio::test]
	async fn sqlite_roundtrip_and_id_assignment() {
		let store = SqliteStore::connect(&temp_db_url("roundtrip")).await.unwrap();

		let (room, genesis) = store
			.create_room(
				DocumentId(11),
				UserId::new("d1").unwrap(),
				Some(UserId::new("w1").unwrap()),
				NewMessage::system("room created", 500),
			)
			.await
			.unwrap();
		assert_eq!(genesis.id, MessageId(0));

		let identity = worker_identity();
		let m1 = store
			.append_message(room.id, NewMessage::user(&identity, "안녕하세요", 501))
			.await
			.unwrap();
		assert_eq!(m1.id, MessageId(1));

		let by_doc = store.room_by_document(DocumentId(11)).await.unwrap().unwrap();
		assert_eq!(by_doc.id, room.id);
		assert_eq!(by_doc.worker_participant_id.as_ref().unwrap().as_str(), "w1");

		let history = store.history(room.id).await.unwrap();
		assert_eq!(history.len(), 2);
		assert_eq!(history[1].text, "안녕하세요");
		assert_eq!(history[1].sender_role, Some(Role::Worker));
	}

	#[tokio::test]
	async fn sqlite_rejects_duplicate_document() {
		let store = SqliteStore::connect(&temp_db_url("dup-doc")).await.unwrap();
		store
			.create_room(
				DocumentId(3),
				UserId::new("d1").unwrap(),
				None,
				NewMessage::system("room created", 1),
			)
			.await
			.unwrap();
		assert!(
			store
				.create_room(
					DocumentId(3),
					UserId::new("d1").unwrap(),
					None,
					NewMessage::system("room created", 2),
				)
				.await
				.is_err()
		);
	}

	#[tokio::test]
	async fn sqlite_append_to_missing_room_fails() {
		let store = SqliteStore::connect(&temp_db_url("missing-room")).await.unwrap();
		let identity = worker_identity();
		assert!(
			store
				.append_message(RoomId(99), NewMessage::user(&identity, "hello", 1))
				.await
				.is_err()
		);
	}
}
