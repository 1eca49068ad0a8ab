#![forbid(unsafe_code)]

//! Full-stack chat flows over a real QUIC endpoint: a server bound to an
//! ephemeral port, driven by `casechat_client_core` sessions.

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use casechat_client_core::{ChatSession, ClientConfig, ClientCoreError};
use casechat_directory::DocumentRecord;
use casechat_directory::memory::MemoryDirectory;
use casechat_domain::{DocumentId, Identity, MessageKind, Role, RoomId, UserId};
use casechat_protocol::wire::{ErrorCode, ServerEvent};
use tokio::sync::oneshot;

use crate::quic::config::QuicServerConfig;
use crate::server::connection::{ConnectionSettings, ServerContext, handle_connection};
use crate::server::dispatch::Dispatcher;
use crate::server::hub::RoomHub;
use crate::server::registry::RoomRegistry;
use crate::server::sessions::SessionManager;
use crate::server::store::{MemoryStore, MessageStore};

const WAIT: Duration = Duration::from_secs(5);

static LOG_INIT: OnceLock<()> = OnceLock::new();

fn init_test_logging() {
	if std::env::var("CASECHAT_TEST_LOG").is_ok() {
		LOG_INIT.get_or_init(|| {
			tracing_subscriber::fmt()
				.with_env_filter("debug")
				.with_target(false)
				.init();
		});
	}
}

fn init_rustls_crypto_provider() {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

fn identity(user_id: &str, name: &str, role: Role) -> Identity {
	Identity {
		user_id: UserId::new(user_id).unwrap(),
		name: name.to_string(),
		role,
	}
}

/// Tokens: `tok-dealer` owns document 41, `tok-worker` is a case worker,
/// `tok-stranger` is a dealer with no documents.
fn test_context() -> Arc<ServerContext> {
	let directory = Arc::new(MemoryDirectory::new());
	directory.insert_token("tok-dealer", identity("dealer-1", "Dana Dealer", Role::Dealer));
	directory.insert_token("tok-worker", identity("worker-1", "Wren Worker", Role::Worker));
	directory.insert_token("tok-stranger", identity("dealer-2", "Sam Stranger", Role::Dealer));
	directory.insert_document(DocumentRecord {
		id: DocumentId(41),
		dealer_id: UserId::new("dealer-1").unwrap(),
	});

	let store: Arc<dyn MessageStore> = Arc::new(MemoryStore::new());
	let registry = Arc::new(RoomRegistry::new(Arc::clone(&store), Arc::clone(&directory) as _));
	let sessions = Arc::new(SessionManager::new());
	let dispatcher = Arc::new(Dispatcher::new(
		Arc::clone(&store),
		Arc::clone(&registry),
		RoomHub::new(),
		Arc::clone(&sessions),
	));

	Arc::new(ServerContext {
		identities: directory as _,
		registry,
		dispatcher,
		sessions,
		settings: ConnectionSettings::default(),
	})
}

/// Binds an ephemeral dev endpoint, reports the address over `ready_tx`,
/// then serves at most `max_conns` connections.
async fn run_test_server(ctx: Arc<ServerContext>, ready_tx: oneshot::Sender<SocketAddr>, max_conns: u64) -> anyhow::Result<()> {
	let quic_cfg = QuicServerConfig::dev("127.0.0.1:0".parse().expect("valid bind addr"));
	let (endpoint, _cert_der) = quic_cfg.bind_dev_endpoint()?;

	let mut addr = endpoint.local_addr()?;
	if addr.ip().is_unspecified() {
		addr.set_ip("127.0.0.1".parse().expect("valid ip"));
	}
	let _ = ready_tx.send(addr);

	let mut handlers = Vec::new();
	for conn_id in 1..=max_conns {
		let Some(connecting) = endpoint.accept().await else {
			break;
		};
		let ctx = Arc::clone(&ctx);
		handlers.push(tokio::spawn(async move {
			let connection = connecting.await?;
			handle_connection(conn_id, connection, ctx).await
		}));
	}

	for handler in handlers {
		let _ = handler.await;
	}
	Ok(())
}

fn spawn_server(max_conns: u64) -> (tokio::task::JoinHandle<anyhow::Result<()>>, oneshot::Receiver<SocketAddr>) {
	let ctx = test_context();
	let (ready_tx, ready_rx) = oneshot::channel();
	let server = tokio::spawn(run_test_server(ctx, ready_tx, max_conns));
	(server, ready_rx)
}

async fn connect(addr: SocketAddr) -> ChatSession {
	let cfg = ClientConfig {
		server_host: "localhost".to_string(),
		server_port: addr.port(),
		server_addr: Some(addr),
		..ClientConfig::default()
	};
	tokio::time::timeout(WAIT, ChatSession::connect(cfg))
		.await
		.expect("connect timed out")
		.expect("connect failed")
}

async fn next_new_message(session: &mut ChatSession) -> casechat_domain::ChatMessage {
	loop {
		let event = tokio::time::timeout(WAIT, session.next_event())
			.await
			.expect("event wait timed out")
			.expect("event stream failed");
		match event {
			ServerEvent::NewMessage { message, .. } => return message,
			ServerEvent::Pong { .. } => {}
			other => panic!("expected new_message, got {other:?}"),
		}
	}
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dealer_and_worker_exchange_messages_in_order() {
	init_test_logging();
	init_rustls_crypto_provider();

	let (server, ready_rx) = spawn_server(2);
	let addr = ready_rx.await.expect("server ready");

	let mut dealer = connect(addr).await;
	let dealer_id = dealer.authenticate("tok-dealer").await.expect("dealer auth");
	assert_eq!(dealer_id.role, Role::Dealer);

	let room = dealer.resolve_room(DocumentId(41)).await.expect("resolve room");
	assert_eq!(room.document_id, DocumentId(41));

	let dealer_history = dealer.join_room(room.id).await.expect("dealer join");
	assert_eq!(dealer_history.len(), 1);
	assert_eq!(dealer_history[0].id.as_u64(), 0);
	assert_eq!(dealer_history[0].kind, MessageKind::System);

	let mut worker = connect(addr).await;
	worker.authenticate("tok-worker").await.expect("worker auth");
	let worker_room = worker.resolve_room(DocumentId(41)).await.expect("worker resolve");
	assert_eq!(worker_room.id, room.id);
	assert_eq!(
		worker_room.worker_participant_id,
		Some(UserId::new("worker-1").unwrap())
	);
	let worker_history = worker.join_room(room.id).await.expect("worker join");
	assert_eq!(worker_history.len(), 1);

	dealer.send_message(room.id, "안녕하세요").await.expect("dealer send");

	let at_dealer = next_new_message(&mut dealer).await;
	let at_worker = next_new_message(&mut worker).await;
	assert_eq!(at_dealer.id.as_u64(), 1);
	assert_eq!(at_worker.id.as_u64(), 1);
	assert_eq!(at_worker.text, "안녕하세요");
	assert_eq!(at_worker.sender_name, "Dana Dealer");

	worker.send_message(room.id, "네, 확인했습니다").await.expect("worker send");
	assert_eq!(next_new_message(&mut dealer).await.id.as_u64(), 2);
	assert_eq!(next_new_message(&mut worker).await.id.as_u64(), 2);

	let server_time = dealer.ping().await.expect("ping");
	assert!(server_time > 0);

	dealer.close(0, "done");
	worker.close(0, "done");
	tokio::time::timeout(WAIT, server).await.expect("server exit").unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stranger_dealer_is_forbidden() {
	init_test_logging();
	init_rustls_crypto_provider();

	let (server, ready_rx) = spawn_server(2);
	let addr = ready_rx.await.expect("server ready");

	let mut dealer = connect(addr).await;
	dealer.authenticate("tok-dealer").await.expect("dealer auth");
	let room = dealer.resolve_room(DocumentId(41)).await.expect("dealer resolve");

	let mut stranger = connect(addr).await;
	stranger.authenticate("tok-stranger").await.expect("stranger auth");

	match stranger.resolve_room(DocumentId(41)).await {
		Err(ClientCoreError::Server { code, .. }) => assert_eq!(code, ErrorCode::Forbidden),
		other => panic!("expected forbidden, got {other:?}"),
	}

	// Knowing the room id does not grant membership either.
	match stranger.join_room(room.id).await {
		Err(ClientCoreError::Server { code, .. }) => assert_eq!(code, ErrorCode::Forbidden),
		other => panic!("expected forbidden, got {other:?}"),
	}

	// Unknown documents are not disclosed either way.
	match stranger.resolve_room(DocumentId(999)).await {
		Err(ClientCoreError::Server { code, .. }) => assert_eq!(code, ErrorCode::NotFound),
		other => panic!("expected not_found, got {other:?}"),
	}

	dealer.close(0, "done");
	stranger.close(0, "done");
	tokio::time::timeout(WAIT, server).await.expect("server exit").unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reconnect_replays_history_and_continues_ids() {
	init_test_logging();
	init_rustls_crypto_provider();

	let (server, ready_rx) = spawn_server(3);
	let addr = ready_rx.await.expect("server ready");

	let mut dealer = connect(addr).await;
	dealer.authenticate("tok-dealer").await.expect("dealer auth");
	let room = dealer.resolve_room(DocumentId(41)).await.expect("resolve");
	dealer.join_room(room.id).await.expect("join");
	dealer.send_message(room.id, "first").await.expect("send");
	assert_eq!(next_new_message(&mut dealer).await.id.as_u64(), 1);

	let mut worker = connect(addr).await;
	worker.authenticate("tok-worker").await.expect("worker auth");
	worker.join_room(room.id).await.expect("worker join");

	// Dealer drops; the worker keeps talking while they are away.
	dealer.close(0, "network change");
	drop(dealer);

	worker.send_message(room.id, "second").await.expect("worker send");
	assert_eq!(next_new_message(&mut worker).await.id.as_u64(), 2);

	// Reconnect: re-auth, re-join, full ascending history, no duplicates.
	let mut dealer = connect(addr).await;
	dealer.authenticate("tok-dealer").await.expect("re-auth");
	let history = dealer.join_room(room.id).await.expect("re-join");

	let ids: Vec<u64> = history.iter().map(|m| m.id.as_u64()).collect();
	assert_eq!(ids, vec![0, 1, 2]);
	assert_eq!(history[2].text, "second");

	dealer.send_message(room.id, "third").await.expect("send after reconnect");
	assert_eq!(next_new_message(&mut dealer).await.id.as_u64(), 3);
	assert_eq!(next_new_message(&mut worker).await.id.as_u64(), 3);

	dealer.close(0, "done");
	worker.close(0, "done");
	tokio::time::timeout(WAIT, server).await.expect("server exit").unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn blank_message_is_rejected_and_not_persisted() {
	init_test_logging();
	init_rustls_crypto_provider();

	let (server, ready_rx) = spawn_server(1);
	let addr = ready_rx.await.expect("server ready");

	let mut dealer = connect(addr).await;
	dealer.authenticate("tok-dealer").await.expect("auth");
	let room = dealer.resolve_room(DocumentId(41)).await.expect("resolve");
	dealer.join_room(room.id).await.expect("join");

	dealer.send_message(room.id, "   \t ").await.expect("send blank");
	let event = tokio::time::timeout(WAIT, dealer.next_event())
		.await
		.expect("event wait timed out")
		.expect("event stream failed");
	match event {
		ServerEvent::Error { code, .. } => assert_eq!(code, ErrorCode::InvalidInput),
		other => panic!("expected invalid_input error, got {other:?}"),
	}

	// The rejected message consumed no id.
	dealer.send_message(room.id, "real one").await.expect("send real");
	assert_eq!(next_new_message(&mut dealer).await.id.as_u64(), 1);

	dealer.close(0, "done");
	tokio::time::timeout(WAIT, server).await.expect("server exit").unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn commands_before_auth_are_unauthorized() {
	init_test_logging();
	init_rustls_crypto_provider();

	let (server, ready_rx) = spawn_server(1);
	let addr = ready_rx.await.expect("server ready");

	let mut session = connect(addr).await;
	match session.resolve_room(DocumentId(41)).await {
		Err(ClientCoreError::Server { code, .. }) => assert_eq!(code, ErrorCode::Unauthorized),
		other => panic!("expected unauthorized, got {other:?}"),
	}

	match session.leave_room(RoomId(1)).await {
		Err(ClientCoreError::Server { code, .. }) => assert_eq!(code, ErrorCode::Unauthorized),
		other => panic!("expected unauthorized, got {other:?}"),
	}

	match session.authenticate("no-such-token").await {
		Err(ClientCoreError::Auth(_)) => {}
		other => panic!("expected auth failure, got {other:?}"),
	}

	session.close(0, "done");
	tokio::time::timeout(WAIT, server).await.expect("server exit").unwrap().unwrap();
}
