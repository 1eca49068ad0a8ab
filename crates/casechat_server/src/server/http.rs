#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use casechat_directory::IdentityProvider;
use casechat_domain::DocumentId;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::warn;

use crate::server::error::ChatError;
use crate::server::registry::RoomRegistry;

#[derive(Clone, Default)]
pub struct HealthState {
	ready: Arc<AtomicBool>,
}

impl HealthState {
	pub fn new() -> Self {
		Self {
			ready: Arc::new(AtomicBool::new(false)),
		}
	}

	pub fn mark_ready(&self) {
		self.ready.store(true, Ordering::Relaxed);
	}

	pub fn is_ready(&self) -> bool {
		self.ready.load(Ordering::Relaxed)
	}
}

/// State behind the HTTP sidecar: health probes plus the REST
/// resolve-or-create boundary used by clients before they dial QUIC.
#[derive(Clone)]
pub struct HttpState {
	pub health: HealthState,
	pub identities: Arc<dyn IdentityProvider>,
	pub registry: Arc<RoomRegistry>,
}

pub fn spawn_http_server(bind: SocketAddr, state: HttpState) {
	tokio::spawn(async move {
		if let Err(err) = run_http_server(bind, state).await {
			warn!(error = %err, "http sidecar stopped");
		}
	});
}

async fn run_http_server(bind: SocketAddr, state: HttpState) -> anyhow::Result<()> {
	let listener = TcpListener::bind(bind).await?;
	loop {
		let (stream, _addr) = listener.accept().await?;
		let io = TokioIo::new(stream);
		let state = state.clone();
		tokio::spawn(async move {
			let service = service_fn(move |req| handle_request(req, state.clone()));
			if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
				warn!(error = %err, "http sidecar connection error");
			}
		});
	}
}

fn text_response(status: StatusCode, body: &'static [u8]) -> Response<Full<Bytes>> {
	Response::builder()
		.status(status)
		.body(Full::new(Bytes::from_static(body)))
		.unwrap()
}

fn json_response(status: StatusCode, value: serde_json::Value) -> Response<Full<Bytes>> {
	Response::builder()
		.status(status)
		.header(hyper::header::CONTENT_TYPE, "application/json")
		.body(Full::new(Bytes::from(value.to_string())))
		.unwrap()
}

fn bearer_token(req: &Request<Incoming>) -> Option<&str> {
	req.headers()
		.get(hyper::header::AUTHORIZATION)?
		.to_str()
		.ok()?
		.strip_prefix("Bearer ")
		.map(str::trim)
}

fn error_response(err: &ChatError) -> Response<Full<Bytes>> {
	let status = match err {
		ChatError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
		ChatError::Forbidden(_) => StatusCode::FORBIDDEN,
		ChatError::NotFound(_) => StatusCode::NOT_FOUND,
		ChatError::InvalidInput(_) => StatusCode::BAD_REQUEST,
		ChatError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
	};
	json_response(status, json!({ "error": err.wire_message() }))
}

async fn handle_request(req: Request<Incoming>, state: HttpState) -> Result<Response<Full<Bytes>>, hyper::Error> {
	let path = req.uri().path().to_string();

	match (req.method(), path.as_str()) {
		(&Method::GET, "/healthz") => Ok(text_response(StatusCode::OK, b"ok")),
		(&Method::GET, "/readyz") => {
			if state.health.is_ready() {
				Ok(text_response(StatusCode::OK, b"ready"))
			} else {
				Ok(text_response(StatusCode::SERVICE_UNAVAILABLE, b"not-ready"))
			}
		}
		(&Method::POST, _) => {
			let Some(document_id) = parse_resolve_path(&path) else {
				return Ok(text_response(StatusCode::NOT_FOUND, b""));
			};
			Ok(handle_resolve_room(&req, &state, document_id).await)
		}
		_ => Ok(text_response(StatusCode::NOT_FOUND, b"")),
	}
}

/// `/api/documents/{document_id}/room`
fn parse_resolve_path(path: &str) -> Option<DocumentId> {
	let rest = path.strip_prefix("/api/documents/")?;
	let (id, tail) = rest.split_once('/')?;
	if tail != "room" {
		return None;
	}
	id.parse().ok()
}

async fn handle_resolve_room(req: &Request<Incoming>, state: &HttpState, document_id: DocumentId) -> Response<Full<Bytes>> {
	let Some(token) = bearer_token(req) else {
		return json_response(StatusCode::UNAUTHORIZED, json!({ "error": "missing bearer token" }));
	};

	let identity = match state.identities.resolve_token(token).await {
		Ok(identity) => identity,
		Err(e) => return error_response(&ChatError::from(e)),
	};

	match state.registry.resolve_or_create(document_id, &identity).await {
		Ok((room, messages)) => {
			metrics::counter!("casechat_server_rest_resolves_total").increment(1);
			json_response(StatusCode::OK, json!({ "room": room, "messages": messages }))
		}
		Err(e) => {
			if matches!(e, ChatError::Internal(_)) {
				warn!(%document_id, error = %e, "rest resolve failed");
			}
			error_response(&e)
		}
	}
}
