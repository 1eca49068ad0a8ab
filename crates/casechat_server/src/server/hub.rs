#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use casechat_domain::RoomId;
use casechat_protocol::wire::ServerEvent;
use tokio::sync::{Mutex, Notify, mpsc};
use tracing::warn;

/// Fan-out registry mapping rooms to the connections that joined them.
///
/// Broadcasts never await a slow peer: events go to each member's bounded
/// queue via `try_send`, and a full queue evicts that member and signals
/// its connection to shut down instead of stalling the room.
#[derive(Clone, Default)]
pub struct RoomHub {
	inner: Arc<Mutex<HashMap<RoomId, HashMap<u64, Member>>>>,
}

struct Member {
	tx: mpsc::Sender<ServerEvent>,
	shutdown: Arc<Notify>,
}

impl RoomHub {
	pub fn new() -> Self {
		Self::default()
	}

	/// Add a connection to a room's membership set. Idempotent per
	/// `conn_id`; a re-join replaces the queue handle.
	pub async fn subscribe(&self, room_id: RoomId, conn_id: u64, tx: mpsc::Sender<ServerEvent>, shutdown: Arc<Notify>) {
		let mut rooms = self.inner.lock().await;
		let members = rooms.entry(room_id).or_default();
		if members.insert(conn_id, Member { tx, shutdown }).is_none() {
			metrics::gauge!("casechat_server_room_members").increment(1.0);
		}
	}

	pub async fn unsubscribe(&self, room_id: RoomId, conn_id: u64) {
		let mut rooms = self.inner.lock().await;
		if let Some(members) = rooms.get_mut(&room_id)
			&& members.remove(&conn_id).is_some()
		{
			metrics::gauge!("casechat_server_room_members").decrement(1.0);
			if members.is_empty() {
				rooms.remove(&room_id);
			}
		}
	}

	/// Deliver `event` to every member of the room.
	pub async fn broadcast(&self, room_id: RoomId, event: &ServerEvent) {
		let mut rooms = self.inner.lock().await;
		let Some(members) = rooms.get_mut(&room_id) else {
			return;
		};

		let mut evicted: Vec<u64> = Vec::new();
		for (conn_id, member) in members.iter() {
			match member.tx.try_send(event.clone()) {
				Ok(()) => {
					metrics::counter!("casechat_server_events_broadcast_total").increment(1);
				}
				Err(mpsc::error::TrySendError::Full(_)) => {
					warn!(conn_id, %room_id, "member event queue full; dropping connection");
					metrics::counter!("casechat_server_slow_members_dropped_total").increment(1);
					member.shutdown.notify_one();
					evicted.push(*conn_id);
				}
				Err(mpsc::error::TrySendError::Closed(_)) => {
					evicted.push(*conn_id);
				}
			}
		}

		for conn_id in evicted {
			if members.remove(&conn_id).is_some() {
				metrics::gauge!("casechat_server_room_members").decrement(1.0);
			}
		}
		if members.is_empty() {
			rooms.remove(&room_id);
		}
	}

	pub async fn member_count(&self, room_id: RoomId) -> usize {
		let rooms = self.inner.lock().await;
		rooms.get(&room_id).map(|members| members.len()).unwrap_or(0)
	}
}
