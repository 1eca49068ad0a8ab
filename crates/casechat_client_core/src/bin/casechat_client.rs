#![forbid(unsafe_code)]

use std::net::SocketAddr;

use casechat_client_core::{ChatSession, ClientConfig};
use casechat_domain::{ChatMessage, DocumentId};
use casechat_protocol::wire::ServerEvent;
use tokio::io::AsyncBufReadExt;
use tracing::{info, warn};

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: casechat_client --document ID [--connect quic://host:port] [--addr ip:port] [--token TOKEN]\n\
\n\
Options:\n\
	--document  Document id whose chat room to open (required)\n\
	--connect   Server endpoint (default: quic://127.0.0.1:17403)\n\
	            Format: quic://host:port\n\
	--addr      Server SocketAddr (overrides DNS resolution from --connect)\n\
	--token     Credential token (default: $CASECHAT_CLIENT_TOKEN)\n\
	--help      Show this help\n\
\n\
Examples:\n\
	casechat_client --document 41 --token demo-dealer\n\
	casechat_client --document 41 --connect quic://chat.example.com:443\n"
	);
	std::process::exit(2)
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,casechat_client_core=debug".to_string());
	tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

fn parse_args() -> (ClientConfig, String, DocumentId) {
	let mut endpoint = "quic://127.0.0.1:17403".to_string();
	let mut addr_override: Option<SocketAddr> = None;
	let mut token: Option<String> = None;
	let mut document: Option<DocumentId> = None;

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--connect" | "--endpoint" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--connect must be non-empty (expected quic://host:port)");
					usage_and_exit();
				}
				endpoint = v;
			}
			"--addr" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				let parsed: SocketAddr = v.parse().unwrap_or_else(|_| {
					eprintln!("Invalid --addr value: {v}");
					usage_and_exit()
				});
				addr_override = Some(parsed);
			}
			"--token" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--token must be non-empty");
					usage_and_exit();
				}
				token = Some(v);
			}
			"--document" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				let parsed: DocumentId = v.parse().unwrap_or_else(|_| {
					eprintln!("Invalid --document value: {v}");
					usage_and_exit()
				});
				document = Some(parsed);
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	let Some(document) = document else {
		eprintln!("--document is required");
		usage_and_exit();
	};

	let token = token
		.or_else(|| {
			std::env::var("CASECHAT_CLIENT_TOKEN").ok().and_then(|v| {
				let v = v.trim().to_string();
				(!v.is_empty()).then_some(v)
			})
		})
		.unwrap_or_else(|| {
			eprintln!("No credential token: pass --token or set CASECHAT_CLIENT_TOKEN");
			usage_and_exit();
		});

	let (host, port) = ClientConfig::parse_quic_endpoint(&endpoint).unwrap_or_else(|e| {
		eprintln!("Invalid --connect value: {endpoint}\n{e}");
		usage_and_exit();
	});

	let cfg = ClientConfig {
		server_host: host,
		server_port: port,
		server_addr: addr_override,
		..ClientConfig::default()
	};

	(cfg, token, document)
}

fn print_message(m: &ChatMessage) {
	let who = if m.sender_name.is_empty() { "system" } else { m.sender_name.as_str() };
	println!("[#{}] {}: {}", m.id, who, m.text);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();
	let (cfg, token, document_id) = parse_args();

	info!(host = %cfg.server_host, port = cfg.server_port, %document_id, "connecting");

	let mut session = ChatSession::connect(cfg).await?;
	let identity = session.authenticate(&token).await?;
	info!(user = %identity.user_id, role = %identity.role, "authenticated");

	let room = session.resolve_room(document_id).await?;
	let history = session.join_room(room.id).await?;

	println!("-- room {} for document {} ({} messages) --", room.id, room.document_id, history.len());
	for m in &history {
		print_message(m);
	}

	let stdin = tokio::io::BufReader::new(tokio::io::stdin());
	let mut lines = stdin.lines();

	loop {
		tokio::select! {
			line = lines.next_line() => {
				match line? {
					Some(text) if !text.trim().is_empty() => {
						session.send_message(room.id, text).await?;
					}
					Some(_) => {}
					None => {
						session.close(0, "bye");
						break;
					}
				}
			}
			event = session.next_event() => {
				match event? {
					ServerEvent::NewMessage { message, .. } => print_message(&message),
					ServerEvent::Error { code, message } => {
						warn!(code = %code, %message, "server rejected an operation");
					}
					other => {
						warn!(?other, "unexpected event");
					}
				}
			}
		}
	}

	Ok(())
}
