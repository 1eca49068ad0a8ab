#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::{Context as _, anyhow};
use casechat_directory::IdentityProvider;
use casechat_protocol::framing::{DEFAULT_MAX_FRAME_SIZE, encode_frame};
use casechat_protocol::wire::{ClientCommand, ServerEvent};
use casechat_util::time::unix_millis_now;
use tokio::sync::{Notify, mpsc};
use tracing::{debug, info, warn};

use crate::server::dispatch::Dispatcher;
use crate::server::error::ChatError;
use crate::server::registry::RoomRegistry;
use crate::server::sessions::SessionManager;

/// Per-connection server settings.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
	pub max_frame_bytes: usize,
	/// Capacity of the outbound event queue. Overflow drops the connection.
	pub event_queue_capacity: usize,
}

impl Default for ConnectionSettings {
	fn default() -> Self {
		Self {
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
			event_queue_capacity: 256,
		}
	}
}

/// Shared server state handed to every connection task.
pub struct ServerContext {
	pub identities: Arc<dyn IdentityProvider>,
	pub registry: Arc<RoomRegistry>,
	pub dispatcher: Arc<Dispatcher>,
	pub sessions: Arc<SessionManager>,
	pub settings: ConnectionSettings,
}

fn enqueue(event_tx: &mpsc::Sender<ServerEvent>, shutdown: &Notify, event: ServerEvent) -> anyhow::Result<()> {
	if event_tx.try_send(event).is_err() {
		shutdown.notify_one();
		return Err(anyhow!("event queue full or closed"));
	}
	Ok(())
}

fn enqueue_chat_error(
	conn_id: u64,
	event_tx: &mpsc::Sender<ServerEvent>,
	shutdown: &Notify,
	err: ChatError,
) -> anyhow::Result<()> {
	match err.wire_code() {
		Some(code) => {
			metrics::counter!("casechat_server_command_errors_total", "code" => code.as_str()).increment(1);
			debug!(conn_id, %code, "command rejected");
			enqueue(event_tx, shutdown, ServerEvent::Error {
				code,
				message: err.wire_message(),
			})
		}
		// Internal failures close the connection; the client recovers by
		// reconnecting against durable state.
		None => Err(anyhow::Error::from(err).context("internal chat error")),
	}
}

pub async fn handle_connection(conn_id: u64, connection: quinn::Connection, ctx: Arc<ServerContext>) -> anyhow::Result<()> {
	struct ConnectionGaugeGuard;
	impl Drop for ConnectionGaugeGuard {
		fn drop(&mut self) {
			metrics::gauge!("casechat_server_active_connections").decrement(1.0);
		}
	}

	metrics::gauge!("casechat_server_active_connections").increment(1.0);
	let _conn_guard = ConnectionGaugeGuard;

	let (mut send, mut recv) = connection.accept_bi().await.context("accept control bidirectional stream")?;

	let max_frame = ctx.settings.max_frame_bytes;
	let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<ClientCommand>();
	let reader_task = tokio::spawn(async move {
		let mut buf = Vec::<u8>::with_capacity(16 * 1024);
		let mut tmp = [0u8; 8192];

		loop {
			let n = match recv.read(&mut tmp).await {
				Ok(Some(n)) => n,
				Ok(None) => return Ok::<(), anyhow::Error>(()),
				Err(e) => return Err(anyhow!(e).context("control stream read failed")),
			};

			metrics::counter!("casechat_server_bytes_in_total").increment(n as u64);
			buf.extend_from_slice(&tmp[..n]);

			loop {
				match casechat_protocol::decode_frame::<ClientCommand>(&buf, max_frame) {
					Ok((cmd, used)) => {
						buf.drain(0..used);
						metrics::counter!("casechat_server_commands_in_total").increment(1);

						if cmd_tx.send(cmd).is_err() {
							return Ok(());
						}
					}
					Err(casechat_protocol::FramingError::InsufficientData { .. }) => break,
					Err(e) => {
						metrics::counter!("casechat_server_decode_errors_total").increment(1);
						return Err(anyhow!(e).context("failed to decode command frame"));
					}
				}
			}
		}
	});

	// Single writer task drains the bounded event queue so broadcasts from
	// other connections and direct replies share one ordered stream.
	let (event_tx, mut event_rx) = mpsc::channel::<ServerEvent>(ctx.settings.event_queue_capacity);
	let shutdown = Arc::new(Notify::new());

	let writer_task = tokio::spawn(async move {
		while let Some(event) = event_rx.recv().await {
			let frame = encode_frame(&event, max_frame).map_err(|e| anyhow!(e).context("encode event frame"))?;
			metrics::counter!("casechat_server_events_out_total").increment(1);
			metrics::counter!("casechat_server_bytes_out_total").increment(frame.len() as u64);

			send.write_all(&frame).await.context("event stream write failed")?;
		}

		let _ = send.finish();
		Ok::<(), anyhow::Error>(())
	});

	let loop_result = async {
		loop {
			let cmd = tokio::select! {
				cmd = cmd_rx.recv() => match cmd {
					Some(cmd) => cmd,
					None => break,
				},
				_ = shutdown.notified() => {
					warn!(conn_id, "connection dropped: event queue overflow");
					break;
				}
			};

			match cmd {
				ClientCommand::Auth { credential_token } => {
					let identity = match ctx.identities.resolve_token(&credential_token).await {
						Ok(identity) => identity,
						Err(e) => {
							metrics::counter!("casechat_server_auth_failures_total").increment(1);
							warn!(conn_id, error = %e, "auth rejected");
							enqueue(&event_tx, &shutdown, ServerEvent::AuthFailed { reason: e.to_string() })?;
							continue;
						}
					};

					match ctx.sessions.set_identity(conn_id, identity).await {
						Ok(identity) => {
							info!(conn_id, user = %identity.user_id, role = %identity.role, "authenticated");
							metrics::counter!("casechat_server_auth_success_total").increment(1);
							enqueue(&event_tx, &shutdown, ServerEvent::AuthSuccess { identity })?;
						}
						Err(e) => enqueue_chat_error(conn_id, &event_tx, &shutdown, e)?,
					}
				}

				ClientCommand::ResolveRoom { document_id } => {
					let Some(identity) = ctx.sessions.identity(conn_id).await else {
						enqueue_chat_error(
							conn_id,
							&event_tx,
							&shutdown,
							ChatError::Unauthorized("authenticate before resolving a room".to_string()),
						)?;
						continue;
					};

					match ctx.registry.resolve_or_create(document_id, &identity).await {
						Ok((room, _history)) => {
							enqueue(&event_tx, &shutdown, ServerEvent::RoomResolved { room })?;
						}
						Err(e) => enqueue_chat_error(conn_id, &event_tx, &shutdown, e)?,
					}
				}

				ClientCommand::JoinRoom { room_id } => {
					match ctx
						.dispatcher
						.join(conn_id, room_id, event_tx.clone(), Arc::clone(&shutdown))
						.await
					{
						Ok(()) => {}
						Err(e) => enqueue_chat_error(conn_id, &event_tx, &shutdown, e)?,
					}
				}

				ClientCommand::LeaveRoom { room_id } => {
					if ctx.sessions.identity(conn_id).await.is_none() {
						enqueue_chat_error(
							conn_id,
							&event_tx,
							&shutdown,
							ChatError::Unauthorized("authenticate before leaving a room".to_string()),
						)?;
						continue;
					}

					let was_member = ctx.dispatcher.leave(conn_id, room_id).await;
					debug!(conn_id, %room_id, was_member, "left room");
					enqueue(&event_tx, &shutdown, ServerEvent::LeftRoom { room_id })?;
				}

				ClientCommand::SendMessage { room_id, text } => {
					match ctx.dispatcher.send(conn_id, room_id, &text).await {
						// The sender is a member; the broadcast covers its ack.
						Ok(message) => debug!(conn_id, %room_id, message_id = %message.id, "message accepted"),
						Err(e) => enqueue_chat_error(conn_id, &event_tx, &shutdown, e)?,
					}
				}

				ClientCommand::Ping { client_time_unix_ms } => {
					enqueue(&event_tx, &shutdown, ServerEvent::Pong {
						client_time_unix_ms,
						server_time_unix_ms: unix_millis_now(),
					})?;
				}
			}
		}
		Ok::<(), anyhow::Error>(())
	}
	.await;

	ctx.dispatcher.disconnect(conn_id).await;
	debug!(conn_id, "connection cleaned up");

	drop(event_tx);
	let _ = writer_task.await;
	let _ = reader_task.await;

	loop_result
}
