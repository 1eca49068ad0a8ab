#![forbid(unsafe_code)]

use anyhow::Context;
use async_trait::async_trait;
use casechat_domain::{DocumentId, Identity};
use reqwest::StatusCode;
use tracing::warn;

use crate::{DirectoryError, DocumentRecord, DocumentStore, IdentityProvider, SecretString};

/// Directory backed by the surrounding business application's HTTP API.
///
/// Session lookups present the user's own token; document lookups present
/// the chat service's token.
pub struct HttpDirectory {
	base_url: String,
	service_token: SecretString,
	http: reqwest::Client,
}

impl HttpDirectory {
	pub fn new(base_url: impl Into<String>, service_token: SecretString) -> anyhow::Result<Self> {
		let base_url = base_url.into().trim_end_matches('/').to_string();
		let http = reqwest::Client::builder()
			.user_agent(concat!("casechat/", env!("CARGO_PKG_VERSION")))
			.build()
			.context("build reqwest client")?;
		Ok(Self {
			base_url,
			service_token,
			http,
		})
	}

	fn map_status(status: StatusCode, what: &str, body: &str) -> DirectoryError {
		match status {
			StatusCode::UNAUTHORIZED => DirectoryError::Unauthorized(format!("{what}: {body}")),
			StatusCode::FORBIDDEN => DirectoryError::Forbidden(format!("{what}: {body}")),
			StatusCode::NOT_FOUND => DirectoryError::NotFound(what.to_string()),
			_ => {
				warn!(%status, what, "unexpected directory response");
				DirectoryError::Upstream(anyhow::anyhow!("{what} failed: status={status} body={body}"))
			}
		}
	}
}

#[async_trait]
impl IdentityProvider for HttpDirectory {
	async fn resolve_token(&self, credential_token: &str) -> Result<Identity, DirectoryError> {
		let url = format!("{}/api/session", self.base_url);
		let resp = self
			.http
			.get(&url)
			.bearer_auth(credential_token)
			.send()
			.await
			.context("session lookup request")?;

		let status = resp.status();
		let body = resp.text().await.context("session lookup read body")?;
		if !status.is_success() {
			return Err(Self::map_status(status, "session lookup", &body));
		}

		serde_json::from_str(&body)
			.context("session lookup parse json")
			.map_err(DirectoryError::Upstream)
	}
}

#[async_trait]
impl DocumentStore for HttpDirectory {
	async fn fetch_document(&self, document_id: DocumentId) -> Result<DocumentRecord, DirectoryError> {
		let url = format!("{}/api/documents/{document_id}", self.base_url);
		let resp = self
			.http
			.get(&url)
			.bearer_auth(self.service_token.expose())
			.send()
			.await
			.context("document lookup request")?;

		let status = resp.status();
		let body = resp.text().await.context("document lookup read body")?;
		if !status.is_success() {
			return Err(Self::map_status(status, &format!("document {document_id}"), &body));
		}

		serde_json::from_str(&body)
			.context("document lookup parse json")
			.map_err(DirectoryError::Upstream)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn auth_statuses_map_to_directory_errors() {
		assert!(matches!(
			HttpDirectory::map_status(StatusCode::UNAUTHORIZED, "session lookup", "expired"),
			DirectoryError::Unauthorized(_)
		));
		assert!(matches!(
			HttpDirectory::map_status(StatusCode::FORBIDDEN, "document 7", "no access"),
			DirectoryError::Forbidden(_)
		));
		assert!(matches!(
			HttpDirectory::map_status(StatusCode::NOT_FOUND, "document 7", ""),
			DirectoryError::NotFound(_)
		));
	}

	#[test]
	fn unexpected_status_maps_to_upstream() {
		let err = HttpDirectory::map_status(StatusCode::INTERNAL_SERVER_ERROR, "session lookup", "boom");
		match err {
			DirectoryError::Upstream(e) => {
				let msg = e.to_string();
				assert!(msg.contains("status=500"));
				assert!(msg.contains("boom"));
			}
			other => panic!("expected upstream error, got {other:?}"),
		}
	}
}
