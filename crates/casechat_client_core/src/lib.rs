#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use bytes::BytesMut;
use casechat_domain::{ChatMessage, ChatRoom, DocumentId, Identity, RoomId};
use casechat_protocol::framing::{DEFAULT_MAX_FRAME_SIZE, FramingError, encode_frame, try_decode_frame_from_buffer};
use casechat_protocol::wire::{ClientCommand, ErrorCode, ServerEvent};
use casechat_util::endpoint::QuicEndpoint;
use casechat_util::time::unix_millis_now;
use quinn::{ClientConfig as QuinnClientConfig, Endpoint, TransportConfig, VarInt};
use tracing::{debug, info};

pub mod controller;

/// Client session configuration (v1).
#[derive(Debug, Clone)]
pub struct ClientConfig {
	/// Remote server host (DNS name or IP literal).
	pub server_host: String,

	/// Remote server UDP port.
	pub server_port: u16,

	/// Resolved remote server address override.
	pub server_addr: Option<SocketAddr>,

	/// Maximum inbound/outbound frame size.
	pub max_frame_bytes: usize,

	/// Timeout for connect + handshake.
	pub connect_timeout: Duration,
}

impl ClientConfig {
	/// Parse a `quic://host:port` endpoint into `(host, port)`.
	pub fn parse_quic_endpoint(endpoint: &str) -> Result<(String, u16), ClientCoreError> {
		let e = QuicEndpoint::parse(endpoint).map_err(|e| ClientCoreError::Protocol(e.to_string()))?;
		Ok((e.host, e.port))
	}

	/// Convenience: create a config from `quic://host:port`.
	pub fn from_quic_endpoint(endpoint: &str) -> Result<Self, ClientCoreError> {
		let (host, port) = Self::parse_quic_endpoint(endpoint)?;
		Ok(Self {
			server_host: host,
			server_port: port,
			server_addr: None,
			..Self::default()
		})
	}
}

impl Default for ClientConfig {
	fn default() -> Self {
		// Local dev default.
		Self {
			server_host: "localhost".to_string(),
			server_port: 17403,
			server_addr: Some("127.0.0.1:17403".parse().expect("valid default addr")),
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
			connect_timeout: Duration::from_secs(15),
		}
	}
}

/// Errors for client core operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientCoreError {
	/// QUIC endpoint setup failed.
	#[error("failed to create QUIC endpoint: {0}")]
	Endpoint(String),

	/// Connection establishment failed.
	#[error("failed to connect: {0}")]
	Connect(String),

	/// Protocol framing error.
	#[error(transparent)]
	Framing(#[from] FramingError),

	/// Protocol error (unexpected event ordering/types).
	#[error("protocol error: {0}")]
	Protocol(String),

	/// Credentials were rejected.
	#[error("authentication failed: {0}")]
	Auth(String),

	/// The server rejected an operation.
	#[error("server error ({code}): {message}")]
	Server { code: ErrorCode, message: String },

	/// IO error.
	#[error("io error: {0}")]
	Io(String),

	/// Other error.
	#[error("error: {0}")]
	Other(String),
}

impl From<anyhow::Error> for ClientCoreError {
	fn from(e: anyhow::Error) -> Self {
		ClientCoreError::Other(format!("{e:#}"))
	}
}

/// One QUIC chat session: a single bidirectional stream carrying commands
/// out and events in.
pub struct ChatSession {
	conn: quinn::Connection,
	send: quinn::SendStream,
	recv: quinn::RecvStream,
	max_frame_bytes: usize,
	recv_buf: BytesMut,
	// Events read while waiting for a specific acknowledgement; replayed
	// to `next_event` callers in arrival order.
	pending: VecDeque<ServerEvent>,
}

impl ChatSession {
	/// Connect and open the control stream.
	pub async fn connect(cfg: ClientConfig) -> Result<Self, ClientCoreError> {
		let endpoint = make_client_endpoint().map_err(|e| ClientCoreError::Endpoint(format!("{e:#}")))?;

		let quinn_cfg = make_insecure_client_config().map_err(|e| ClientCoreError::Endpoint(format!("{e:#}")))?;

		let connect_timeout = cfg.connect_timeout;
		let server_name = cfg.server_host.clone();

		let candidates: Vec<SocketAddr> = match cfg.server_addr {
			Some(addr) => vec![addr],
			None => {
				let hostport = format!("{}:{}", cfg.server_host, cfg.server_port);
				let addrs = hostport
					.to_socket_addrs()
					.map_err(|e| ClientCoreError::Connect(format!("failed to resolve {hostport}: {e}")))?;

				let addrs: Vec<SocketAddr> = addrs.collect();
				if addrs.is_empty() {
					return Err(ClientCoreError::Connect(format!(
						"DNS resolution returned no addresses for {hostport}"
					)));
				}
				addrs
			}
		};

		let mut last_err: Option<String> = None;
		let mut conn: Option<quinn::Connection> = None;

		for server_addr in candidates {
			let connecting = endpoint
				.connect_with(quinn_cfg.clone(), server_addr, &server_name)
				.map_err(|e| ClientCoreError::Connect(format!("connect_with({server_addr}, sni={server_name}): {e}")))?;

			match tokio::time::timeout(connect_timeout, connecting).await {
				Ok(Ok(c)) => {
					conn = Some(c);
					break;
				}
				Ok(Err(e)) => {
					last_err = Some(format!("connect failed (addr={server_addr}, sni={server_name}): {e}"));
				}
				Err(_) => {
					last_err = Some(format!(
						"connect timeout after {connect_timeout:?} (addr={server_addr}, sni={server_name})"
					));
				}
			}
		}

		let conn = conn.ok_or_else(|| {
			ClientCoreError::Connect(
				last_err.unwrap_or_else(|| format!("connect failed (no addresses attempted) (sni={server_name})")),
			)
		})?;

		info!(remote = %conn.remote_address(), "connected");

		let (send, recv) = tokio::time::timeout(connect_timeout, conn.open_bi())
			.await
			.map_err(|_| ClientCoreError::Io(format!("timeout opening control stream after {connect_timeout:?}")))?
			.map_err(|e| ClientCoreError::Io(format!("open_bi(control) failed: {e}")))?;

		Ok(Self {
			conn,
			send,
			recv,
			max_frame_bytes: cfg.max_frame_bytes,
			recv_buf: BytesMut::with_capacity(16 * 1024),
			pending: VecDeque::new(),
		})
	}

	/// Attach an identity to the connection.
	pub async fn authenticate(&mut self, credential_token: &str) -> Result<Identity, ClientCoreError> {
		self.send_command(&ClientCommand::Auth {
			credential_token: credential_token.to_string(),
		})
		.await?;

		loop {
			match self.read_event().await? {
				ServerEvent::AuthSuccess { identity } => {
					debug!(user = %identity.user_id, "authenticated");
					return Ok(identity);
				}
				ServerEvent::AuthFailed { reason } => return Err(ClientCoreError::Auth(reason)),
				ServerEvent::Error { code, message } => return Err(ClientCoreError::Server { code, message }),
				other => self.pending.push_back(other),
			}
		}
	}

	/// Resolve (or lazily create) the room bound to a document.
	pub async fn resolve_room(&mut self, document_id: DocumentId) -> Result<ChatRoom, ClientCoreError> {
		self.send_command(&ClientCommand::ResolveRoom { document_id }).await?;

		loop {
			match self.read_event().await? {
				ServerEvent::RoomResolved { room } => return Ok(room),
				ServerEvent::Error { code, message } => return Err(ClientCoreError::Server { code, message }),
				other => self.pending.push_back(other),
			}
		}
	}

	/// Join a room; returns the full ascending history snapshot.
	pub async fn join_room(&mut self, room_id: RoomId) -> Result<Vec<ChatMessage>, ClientCoreError> {
		self.send_command(&ClientCommand::JoinRoom { room_id }).await?;

		// joined_room arrives first, history directly after.
		loop {
			match self.read_event().await? {
				ServerEvent::JoinedRoom { room_id: acked } if acked == room_id => break,
				ServerEvent::Error { code, message } => return Err(ClientCoreError::Server { code, message }),
				other => self.pending.push_back(other),
			}
		}

		loop {
			match self.read_event().await? {
				ServerEvent::History { room_id: acked, messages } if acked == room_id => return Ok(messages),
				ServerEvent::Error { code, message } => return Err(ClientCoreError::Server { code, message }),
				other => self.pending.push_back(other),
			}
		}
	}

	/// Leave a room and wait for the acknowledgement.
	pub async fn leave_room(&mut self, room_id: RoomId) -> Result<(), ClientCoreError> {
		self.send_command(&ClientCommand::LeaveRoom { room_id }).await?;

		loop {
			match self.read_event().await? {
				ServerEvent::LeftRoom { room_id: acked } if acked == room_id => return Ok(()),
				ServerEvent::Error { code, message } => return Err(ClientCoreError::Server { code, message }),
				other => self.pending.push_back(other),
			}
		}
	}

	/// Send a message. The acknowledgement is the broadcast `new_message`
	/// carrying the server-assigned id; rejections surface as an `error`
	/// event on `next_event`.
	pub async fn send_message(&mut self, room_id: RoomId, text: impl Into<String>) -> Result<(), ClientCoreError> {
		self.send_command(&ClientCommand::SendMessage {
			room_id,
			text: text.into(),
		})
		.await
	}

	/// Keepalive round trip; returns the server timestamp.
	pub async fn ping(&mut self) -> Result<i64, ClientCoreError> {
		let sent_at = unix_millis_now();
		self.send_command(&ClientCommand::Ping {
			client_time_unix_ms: sent_at,
		})
		.await?;

		loop {
			match self.read_event().await? {
				ServerEvent::Pong {
					client_time_unix_ms,
					server_time_unix_ms,
				} if client_time_unix_ms == sent_at => return Ok(server_time_unix_ms),
				other => self.pending.push_back(other),
			}
		}
	}

	/// Next server event, replaying any events buffered during an
	/// acknowledgement wait first.
	pub async fn next_event(&mut self) -> Result<ServerEvent, ClientCoreError> {
		if let Some(event) = self.pending.pop_front() {
			return Ok(event);
		}
		self.read_event().await
	}

	pub fn close(&self, code: u32, reason: &str) {
		self.conn.close(VarInt::from_u32(code), reason.as_bytes());
	}

	async fn send_command(&mut self, cmd: &ClientCommand) -> Result<(), ClientCoreError> {
		let frame = encode_frame(cmd, self.max_frame_bytes).map_err(ClientCoreError::Framing)?;
		self.send
			.write_all(&frame)
			.await
			.map_err(|e| ClientCoreError::Io(e.to_string()))?;
		Ok(())
	}

	async fn read_event(&mut self) -> Result<ServerEvent, ClientCoreError> {
		let mut tmp = [0u8; 8192];

		loop {
			// Try decoding first in case the buffer already has a full frame.
			match try_decode_frame_from_buffer::<ServerEvent>(&mut self.recv_buf, self.max_frame_bytes) {
				Ok(Some(event)) => return Ok(event),
				Ok(None) => {}
				Err(e) => return Err(ClientCoreError::Framing(e)),
			}

			let n = match self.recv.read(&mut tmp).await {
				Ok(Some(n)) => n,
				Ok(None) => {
					return Err(ClientCoreError::Protocol(
						"stream closed before receiving full event".to_string(),
					));
				}
				Err(e) => return Err(ClientCoreError::Io(e.to_string())),
			};

			self.recv_buf.extend_from_slice(&tmp[..n]);
		}
	}
}

fn make_client_endpoint() -> anyhow::Result<Endpoint> {
	let addr: SocketAddr = "0.0.0.0:0".parse().context("parse wildcard addr")?;
	let endpoint = Endpoint::client(addr).context("create client endpoint")?;
	Ok(endpoint)
}

/// Dev-only TLS config that skips server cert validation.
fn make_insecure_client_config() -> anyhow::Result<QuinnClientConfig> {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

	#[derive(Debug)]
	struct NoVerifier;

	impl rustls::client::danger::ServerCertVerifier for NoVerifier {
		fn verify_server_cert(
			&self,
			_end_entity: &rustls::pki_types::CertificateDer<'_>,
			_intermediates: &[rustls::pki_types::CertificateDer<'_>],
			_server_name: &rustls::pki_types::ServerName<'_>,
			_ocsp_response: &[u8],
			_now: rustls::pki_types::UnixTime,
		) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
			Ok(rustls::client::danger::ServerCertVerified::assertion())
		}

		fn verify_tls12_signature(
			&self,
			_message: &[u8],
			_cert: &rustls::pki_types::CertificateDer<'_>,
			_dss: &rustls::DigitallySignedStruct,
		) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
			Err(rustls::Error::General("TLS1.2 not supported".into()))
		}

		fn verify_tls13_signature(
			&self,
			_message: &[u8],
			_cert: &rustls::pki_types::CertificateDer<'_>,
			_dss: &rustls::DigitallySignedStruct,
		) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
			Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
		}

		fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
			vec![
				rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
				rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
				rustls::SignatureScheme::RSA_PSS_SHA256,
				rustls::SignatureScheme::RSA_PSS_SHA384,
				rustls::SignatureScheme::RSA_PSS_SHA512,
				rustls::SignatureScheme::ED25519,
			]
		}
	}

	let mut tls = rustls::ClientConfig::builder()
		.with_root_certificates(rustls::RootCertStore::empty())
		.with_no_client_auth();

	tls.dangerous().set_certificate_verifier(Arc::new(NoVerifier));
	tls.alpn_protocols = vec![casechat_protocol::version::ALPN.to_vec()];

	let quic_tls = quinn::crypto::rustls::QuicClientConfig::try_from(tls)?;

	let mut cfg = QuinnClientConfig::new(Arc::new(quic_tls));

	let mut transport = TransportConfig::default();
	transport.max_concurrent_bidi_streams(VarInt::from_u32(64));
	transport.max_concurrent_uni_streams(VarInt::from_u32(64));
	cfg.transport_config(Arc::new(transport));

	Ok(cfg)
}
