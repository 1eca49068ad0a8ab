#![forbid(unsafe_code)]

mod config;
mod quic;
mod server;

use std::net::SocketAddr;
use std::sync::Arc;

use casechat_directory::http::HttpDirectory;
use casechat_directory::memory::MemoryDirectory;
use casechat_directory::{DocumentRecord, DocumentStore, IdentityProvider, SecretString};
use casechat_domain::{DocumentId, Identity, Role, UserId};
use casechat_util::endpoint::QuicEndpoint;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::quic::config::QuicServerConfig;
use crate::server::auth::HmacIdentityProvider;
use crate::server::connection::{ConnectionSettings, ServerContext, handle_connection};
use crate::server::dispatch::Dispatcher;
use crate::server::http::{HealthState, HttpState, spawn_http_server};
use crate::server::hub::RoomHub;
use crate::server::registry::RoomRegistry;
use crate::server::sessions::SessionManager;
use crate::server::store::{MemoryStore, MessageStore, SqliteStore};

/// Dev-only in-process directory enable flag.
const CASECHAT_ENABLE_DEMO_DIRECTORY_ENV: &str = "CASECHAT_ENABLE_DEMO_DIRECTORY";

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: casechat_server [--bind quic://host:port]\n\
\n\
Options:\n\
\t--bind    Bind endpoint (default: quic://127.0.0.1:17403)\n\
\t         Format: quic://host:port\n\
\t--help   Show this help\n\
"
	);
	std::process::exit(2)
}

fn parse_args() -> SocketAddr {
	let mut bind_endpoint = "quic://127.0.0.1:17403".to_string();

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--bind must be non-empty (expected quic://host:port)");
					usage_and_exit();
				}
				bind_endpoint = v;
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	let bind = QuicEndpoint::parse(&bind_endpoint).unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	});

	let addr: SocketAddr = bind.to_socket_addr_if_ip_literal().unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	});

	addr
}

fn init_rustls_crypto_provider() {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,casechat_server=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("casechat_server");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<std::net::SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

fn seed_demo_directory() -> MemoryDirectory {
	let directory = MemoryDirectory::new();
	directory.insert_token("demo-dealer", Identity {
		user_id: UserId::new("dealer-1").unwrap(),
		name: "Demo Dealer".to_string(),
		role: Role::Dealer,
	});
	directory.insert_token("demo-worker", Identity {
		user_id: UserId::new("worker-1").unwrap(),
		name: "Demo Worker".to_string(),
		role: Role::Worker,
	});
	directory.insert_document(DocumentRecord {
		id: DocumentId(1),
		dealer_id: UserId::new("dealer-1").unwrap(),
	});
	directory
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_rustls_crypto_provider();
	init_tracing();

	let bind_addr = parse_args();

	let config_path = crate::config::default_config_path()?;
	let server_cfg = crate::config::load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	init_metrics(server_cfg.server.metrics_bind.as_deref());

	let store: Arc<dyn MessageStore> = if server_cfg.persistence.enabled {
		let Some(database_url) = server_cfg.persistence.database_url.as_deref() else {
			return Err(anyhow::anyhow!("persistence enabled but no database_url configured"));
		};
		Arc::new(SqliteStore::connect(database_url).await?)
	} else {
		warn!("persistence disabled; chat history is lost on restart");
		Arc::new(MemoryStore::new())
	};

	let demo_enabled = cfg!(debug_assertions)
		&& std::env::var(CASECHAT_ENABLE_DEMO_DIRECTORY_ENV)
			.map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
			.unwrap_or(false);

	let (identities, documents): (Arc<dyn IdentityProvider>, Arc<dyn DocumentStore>) = if demo_enabled {
		info!(
			env = CASECHAT_ENABLE_DEMO_DIRECTORY_ENV,
			"using dev-only demo directory (enabled by env)"
		);
		let directory = Arc::new(seed_demo_directory());
		(Arc::clone(&directory) as _, directory as _)
	} else if let Some(base_url) = server_cfg.directory.base_url.as_deref() {
		let service_token = server_cfg
			.directory
			.service_token
			.clone()
			.unwrap_or_else(|| SecretString::new(String::new()));
		let http_directory = Arc::new(HttpDirectory::new(base_url, service_token)?);
		info!(base_url, "document directory: business application http api");

		let identities: Arc<dyn IdentityProvider> = match server_cfg.server.auth_hmac_secret.clone() {
			Some(secret) => {
				info!("identity provider: hmac session tokens");
				Arc::new(HmacIdentityProvider::new(secret))
			}
			None => {
				info!("identity provider: business application http api");
				Arc::clone(&http_directory) as _
			}
		};
		(identities, http_directory as _)
	} else {
		return Err(anyhow::anyhow!(
			"no document directory configured: set [directory].base_url or {CASECHAT_ENABLE_DEMO_DIRECTORY_ENV}=1"
		));
	};

	let registry = Arc::new(RoomRegistry::new(Arc::clone(&store), documents));
	let sessions = Arc::new(SessionManager::new());
	let hub = RoomHub::new();
	let dispatcher = Arc::new(Dispatcher::new(
		Arc::clone(&store),
		Arc::clone(&registry),
		hub,
		Arc::clone(&sessions),
	));

	let ctx = Arc::new(ServerContext {
		identities: Arc::clone(&identities),
		registry: Arc::clone(&registry),
		dispatcher,
		sessions,
		settings: ConnectionSettings {
			event_queue_capacity: server_cfg.server.event_queue_capacity,
			..ConnectionSettings::default()
		},
	});

	let health_state = HealthState::new();
	if let Some(bind) = server_cfg.server.http_bind.as_deref() {
		match bind.parse::<std::net::SocketAddr>() {
			Ok(addr) => {
				spawn_http_server(addr, HttpState {
					health: health_state.clone(),
					identities,
					registry,
				});
				info!(%addr, "http sidecar listening");
			}
			Err(e) => warn!(error = %e, %bind, "invalid http bind address (expected host:port)"),
		}
	}

	let quic_cfg = QuicServerConfig::dev(bind_addr);
	let endpoint = if let (Some(cert_path), Some(key_path)) = (
		server_cfg.server.tls_cert_path.as_deref(),
		server_cfg.server.tls_key_path.as_deref(),
	) {
		info!(cert = %cert_path.display(), key = %key_path.display(), "loading TLS cert/key");
		quic_cfg.bind_endpoint_with_tls(cert_path, key_path)?
	} else {
		let (endpoint, server_cert_der) = quic_cfg.bind_dev_endpoint()?;
		info!(
			bind = %bind_addr,
			cert_der_len = server_cert_der.len(),
			"casechat_server: QUIC endpoint ready (dev self-signed cert)"
		);
		endpoint
	};

	health_state.mark_ready();

	let mut next_conn_id: u64 = 1;

	loop {
		let Some(connecting) = endpoint.accept().await else {
			break;
		};

		let conn_id = next_conn_id;
		next_conn_id += 1;
		metrics::counter!("casechat_server_connections_total").increment(1);

		let ctx = Arc::clone(&ctx);
		tokio::spawn(async move {
			match connecting.await {
				Ok(connection) => {
					info!(conn_id, remote = %connection.remote_address(), "accepted connection");
					if let Err(e) = handle_connection(conn_id, connection, ctx).await {
						warn!(conn_id, error = %e, "connection handler exited with error");
					}
				}
				Err(e) => {
					warn!(conn_id, error = %e, "failed to establish QUIC connection");
				}
			}
		});
	}

	Ok(())
}
