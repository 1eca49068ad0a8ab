#![forbid(unsafe_code)]

pub mod endpoint {
	use std::net::SocketAddr;

	use thiserror::Error;

	#[derive(Debug, Error, Clone, PartialEq, Eq)]
	pub enum EndpointParseError {
		#[error("endpoint must be non-empty (expected quic://host:port)")]
		Empty,
		#[error("invalid endpoint (expected quic://host:port): {0}")]
		BadScheme(String),
		#[error("invalid endpoint (expected quic://host:port without path/query/fragment): {0}")]
		TrailingComponents(String),
		#[error("invalid endpoint host (expected quic://host:port): {0}")]
		BadHost(String),
		#[error("invalid endpoint host (IPv6 must be bracketed like quic://[::1]:17403): {0}")]
		UnbracketedIpv6(String),
		#[error("invalid endpoint port (expected 1..=65535): {0}")]
		BadPort(String),
	}

	/// Parsed `quic://host:port` endpoint.
	#[derive(Debug, Clone, PartialEq, Eq, Hash)]
	pub struct QuicEndpoint {
		pub host: String,
		pub port: u16,
	}

	impl QuicEndpoint {
		/// Returns `host:port` (host preserved, IPv6 stays bracketed).
		pub fn hostport(&self) -> String {
			format!("{}:{}", self.host, self.port)
		}

		/// Convert to `SocketAddr` only if the host is an IP literal.
		pub fn to_socket_addr_if_ip_literal(&self) -> Result<SocketAddr, EndpointParseError> {
			self.hostport()
				.parse()
				.map_err(|_| EndpointParseError::BadHost(self.host.clone()))
		}

		/// Parse a QUIC endpoint string in the form `quic://host:port`.
		pub fn parse(s: &str) -> Result<Self, EndpointParseError> {
			let s = s.trim();
			if s.is_empty() {
				return Err(EndpointParseError::Empty);
			}

			let rest = s
				.strip_prefix("quic://")
				.ok_or_else(|| EndpointParseError::BadScheme(s.to_string()))?;

			if rest.contains('/') || rest.contains('?') || rest.contains('#') {
				return Err(EndpointParseError::TrailingComponents(s.to_string()));
			}

			let (host, port_str) = rest
				.rsplit_once(':')
				.ok_or_else(|| EndpointParseError::BadPort(s.to_string()))?;

			let host = host.trim();
			if host.is_empty() {
				return Err(EndpointParseError::BadHost(s.to_string()));
			}

			if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
				return Err(EndpointParseError::UnbracketedIpv6(s.to_string()));
			}

			let port: u16 = port_str
				.trim()
				.parse()
				.map_err(|_| EndpointParseError::BadPort(s.to_string()))?;

			if port == 0 {
				return Err(EndpointParseError::BadPort(s.to_string()));
			}

			Ok(Self {
				host: host.to_string(),
				port,
			})
		}
	}

}

pub mod time {
	/// Milliseconds since the unix epoch.
	pub fn unix_millis_now() -> i64 {
		use std::time::{SystemTime, UNIX_EPOCH};
		match SystemTime::now().duration_since(UNIX_EPOCH) {
			Ok(d) => d.as_millis() as i64,
			Err(_) => 0,
		}
	}

}
